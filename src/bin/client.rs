//! Mic Relay client
//!
//! Captures the local microphone and streams it to a mic-server.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_relay::{
    audio::{format_device_table, list_input_devices, CaptureDevice, CpalCapture, PatternCapture},
    config::{AppConfig, ReconnectPolicy},
    control::ClientState,
    network::StreamingClient,
    quality::Quality,
};

#[derive(Parser, Debug)]
#[command(name = "mic-client", about = "Stream this machine's microphone to a mic-server")]
struct Args {
    /// Server hostname or IP
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Input device index (see --list)
    #[arg(long, value_name = "INDEX")]
    device: Option<usize>,

    /// Sample rate in Hz
    #[arg(long)]
    rate: Option<u32>,

    /// Channel count (1 or 2)
    #[arg(long)]
    channels: Option<u16>,

    /// Frames per chunk; overrides the quality preset
    #[arg(long, value_name = "FRAMES")]
    chunk: Option<u32>,

    /// Quality preset: low_latency, balanced or high_quality
    #[arg(long)]
    quality: Option<Quality>,

    /// Capture gain, 0.0 to 2.0
    #[arg(long)]
    volume: Option<f32>,

    /// List input devices and exit
    #[arg(long, action = clap::ArgAction::SetTrue)]
    list: bool,

    /// Exit instead of reconnecting when the connection drops
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_reconnect: bool,

    /// Send a 440 Hz test tone instead of the microphone
    #[arg(long, action = clap::ArgAction::SetTrue)]
    test_tone: bool,

    /// Settings file (defaults to the per-user config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
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

    if args.list {
        let devices = list_input_devices();
        if devices.is_empty() {
            println!("No input devices found");
        } else {
            println!("{}", format_device_table(&devices));
        }
        return Ok(());
    }

    let mut config = AppConfig::load(args.config.as_deref())
        .context("failed to load settings")?
        .client;

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.device.is_some() {
        config.device_index = args.device;
    }
    if let Some(rate) = args.rate {
        config.sample_rate = rate;
    }
    if let Some(channels) = args.channels {
        config.channels = channels;
    }
    if args.chunk.is_some() {
        config.chunk_size = args.chunk;
    }
    if let Some(quality) = args.quality {
        config.quality = quality;
    }
    if let Some(volume) = args.volume {
        config.volume = volume;
    }
    if args.no_reconnect {
        config.reconnect = ReconnectPolicy::disabled();
    }

    let stream = config.stream_config().context("invalid stream settings")?;
    tracing::info!(
        "Target latency ~{} ms per chunk at {} Hz",
        stream.frame_duration().as_millis(),
        stream.sample_rate
    );

    let capture: Box<dyn CaptureDevice> = if args.test_tone {
        tracing::info!("Sending a 440 Hz test tone");
        Box::new(PatternCapture::tone(stream.sample_rate, stream.channels))
    } else {
        Box::new(
            CpalCapture::open(config.device_index, &stream)
                .context("failed to open input device")?,
        )
    };

    let client = StreamingClient::start(config, capture)?;
    let mut status = client.subscribe();

    let final_state = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping");
            client.shutdown().await
        }
        _ = async {
            while !status.borrow_and_update().is_terminal() {
                if status.changed().await.is_err() {
                    break;
                }
            }
        } => client.join().await,
    };

    match final_state {
        ClientState::Error(reason) => anyhow::bail!("client stopped with an error: {}", reason),
        _ => {
            tracing::info!("Client stopped");
            Ok(())
        }
    }
}
