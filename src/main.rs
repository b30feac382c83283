use std::path::PathBuf;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use voice_link::audio::AlsaAudioSystem;
use voice_link::config::Config;
use voice_link::{ClientEvent, VoiceClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置：可选的第一个参数为配置文件路径
    let mut config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(&PathBuf::from(path), true)?,
        None => Config::load()?,
    };
    config.validate().context("Configuration rejected")?;
    config.resolve_identity();

    log::info!(
        "Voice link starting: url={}, device_id={}, client_id={}",
        config.server.url,
        config.server.device_id,
        config.server.client_id
    );

    let devices = AlsaAudioSystem::new(config.audio.clone());
    let client = VoiceClient::spawn(config, Box::new(devices));

    // 订阅事件，打印状态变化和转写文本
    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::State(state)) => log::info!("State: {}", state),
                Ok(ClientEvent::Transcript {
                    role,
                    text,
                    partial: false,
                }) => println!("{}: {}", role, text),
                Ok(ClientEvent::Transcript { .. }) => {}
                Ok(ClientEvent::BargeIn) => log::info!("Playback interrupted by server"),
                Ok(ClientEvent::ReconnectScheduled { attempt, delay }) => {
                    log::info!("Reconnect attempt {} in {:?}", attempt, delay)
                }
                Ok(ClientEvent::Error(e)) => log::warn!("{}", e),
                Err(RecvError::Lagged(n)) => log::warn!("Event subscriber lagged, {} events skipped", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    client
        .connect()
        .await
        .context("Failed to start voice session")?;

    // 标准输入的每一行作为文本输入发送给服务端
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(text)) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        client.send_text(text).await?;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    log::warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    client.disconnect().await;
    client.dispose().await;
    Ok(())
}
