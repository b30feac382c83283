//! ALSA PCM device wrappers for audio capture and playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::error::DeviceError;

/// Device buffer size, in periods, when a period size is requested.
/// Bounds how much already-written audio a flush has to discard.
const BUFFER_PERIODS: usize = 4;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

/// Open a mono float capture device. The hardware picks the closest rate
/// it supports; the downsampler works from whatever comes back.
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams), DeviceError> {
    open_pcm(device, Direction::Capture, Format::FloatLE, sample_rate, 1, period_size)
        .map_err(|e| DeviceError::CaptureUnavailable {
            device: device.to_string(),
            reason: e.to_string(),
        })
}

/// Open an s16 playback device.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams), DeviceError> {
    open_pcm(
        device,
        Direction::Playback,
        Format::S16LE,
        sample_rate,
        channels,
        period_size,
    )
    .map_err(|e| DeviceError::PlaybackUnavailable {
        device: device.to_string(),
        reason: e.to_string(),
    })
}

fn open_pcm(
    device: &str,
    direction: Direction,
    format: Format,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> alsa::Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let pcm = PCM::new(device, direction, false)?;

    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(format)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
            hwp.set_buffer_size_near((ps * BUFFER_PERIODS) as alsa::pcm::Frames)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
        params.buffer_size,
    );

    Ok((pcm, params))
}
