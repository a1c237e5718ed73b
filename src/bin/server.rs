//! Mic Relay server
//!
//! Receives a microphone stream and exposes it as a virtual input device.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_relay::{config::AppConfig, network::StreamingServer, sink::VirtualSink};

#[derive(Parser, Debug)]
#[command(name = "mic-server", about = "Expose a streamed microphone as a virtual input device")]
struct Args {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Name of the virtual microphone
    #[arg(long)]
    name: Option<String>,

    /// Gain applied before the virtual device, 0.0 to 2.0
    #[arg(long)]
    volume: Option<f32>,

    /// Device sample rate in Hz; clients must match it
    #[arg(long)]
    rate: Option<u32>,

    /// Device channel count; clients must match it
    #[arg(long)]
    channels: Option<u16>,

    /// Only create the named pipe, without registering it with PulseAudio
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_pulseaudio: bool,

    /// Settings file (defaults to the per-user config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[cfg(unix)]
fn create_sink(name: &str, rate: u32, channels: u16, pulse: bool) -> Result<Box<dyn VirtualSink>> {
    use mic_relay::sink::{FifoSink, PulsePipeSource};

    if pulse {
        let source = PulsePipeSource::create(name, rate, channels)
            .context("failed to create the virtual microphone")?;
        tracing::info!("Select '{}' as the microphone in your applications", name);
        Ok(Box::new(source))
    } else {
        let fifo = FifoSink::create(name).context("failed to create the named pipe")?;
        tracing::info!(
            "Raw s16le audio ({} Hz, {} ch) will be written to {}",
            rate,
            channels,
            fifo.path().display()
        );
        Ok(Box::new(fifo))
    }
}

#[cfg(not(unix))]
fn create_sink(_name: &str, _rate: u32, _channels: u16, _pulse: bool) -> Result<Box<dyn VirtualSink>> {
    anyhow::bail!("virtual input devices are only supported on Linux")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())
        .context("failed to load settings")?
        .server;

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(name) = args.name {
        config.device_name = name;
    }
    if let Some(volume) = args.volume {
        config.volume = volume;
    }
    if let Some(rate) = args.rate {
        config.sample_rate = rate;
    }
    if let Some(channels) = args.channels {
        config.channels = channels;
    }
    if args.no_pulseaudio {
        config.use_pulseaudio = false;
    }
    config.validate().context("invalid server settings")?;

    tracing::info!("Starting Mic Relay server");

    let (name, rate, channels, pulse) = (
        config.device_name.clone(),
        config.sample_rate,
        config.channels,
        config.use_pulseaudio,
    );
    let sink = tokio::task::spawn_blocking(move || create_sink(&name, rate, channels, pulse))
        .await
        .context("device setup task failed")??;

    // A failed start drops the sink, which removes the device again
    let handle = StreamingServer::start(config, sink).await?;

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }

    tracing::info!("Shutdown signal received, removing virtual device");
    handle.shutdown().await?;
    Ok(())
}
