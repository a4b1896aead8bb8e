use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use pttlink_audio::{
    AudioSink, CaptureSession, CaptureSettings, MicSession, NullMic, NullSink, Playback,
};
use pttlink_client::app::{App, Command, Event};
use pttlink_client::config::AppConfig;
use pttlink_client::state::Signal;

#[derive(Parser)]
#[command(name = "pttlink", about = "Encrypted push-to-talk voice client")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the persisted settings file (JSON)
    #[arg(long, default_value = "pttlink_settings.json")]
    settings: PathBuf,

    /// Channel id, overrides config
    #[arg(long)]
    channel: Option<u32>,

    /// Server address (IP or hostname), overrides config
    #[arg(long)]
    server: Option<String>,

    /// Server UDP port, overrides config
    #[arg(long)]
    port: Option<u16>,

    /// Channel password or its sha256 hex form, overrides config
    #[arg(long)]
    password: Option<String>,

    /// Run without audio devices (control path only)
    #[arg(long)]
    no_audio: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pttlink=info,pttlink_client=info,pttlink_audio=info".into()
            }),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(path) = &args.config {
        AppConfig::load_toml(path)?
    } else if args.settings.exists() {
        AppConfig::load_json(&args.settings).unwrap_or_else(|e| {
            warn!("ignoring unreadable settings file: {e:#}");
            AppConfig::default()
        })
    } else {
        AppConfig::default()
    };

    if let Some(channel) = args.channel {
        config.channel_id = channel;
    }
    if let Some(server) = args.server {
        config.server_address = server;
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(password) = args.password {
        config.password = password;
    }

    info!("pttlink starting");

    let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let capture_settings = Arc::new(Mutex::new(CaptureSettings::default()));

    let mic: Box<dyn MicSession> = if args.no_audio {
        Box::new(NullMic)
    } else {
        let mic_events = events_tx.clone();
        Box::new(CaptureSession::new(
            config.input_device.clone(),
            Arc::clone(&capture_settings),
            move |frame| {
                let _ = mic_events.send(Event::MicFrame(frame));
            },
        ))
    };

    let sink: Box<dyn AudioSink> = if args.no_audio {
        Box::new(NullSink)
    } else {
        match Playback::new(config.output_device.as_deref()) {
            Ok(playback) => Box::new(playback),
            Err(e) => {
                warn!("audio playback unavailable, discarding output: {e:#}");
                Box::new(NullSink)
            }
        }
    };

    // Observer for state changes; a UI would subscribe the same way.
    tokio::spawn(async move {
        while let Some(signal) = signals_rx.recv().await {
            match signal {
                Signal::LinkStatus(status) => info!(%status, "link"),
                Signal::ServerOnline(online) => info!(online, "server"),
                Signal::TalkerId(talker) => info!(talker, "talker"),
                Signal::PttPressed(pressed) => info!(pressed, "ptt"),
                Signal::TalkDenied(current) => info!(current, "talk denied"),
                Signal::ChannelError(message) => warn!("channel error: {message}"),
                Signal::CodecSelection(selection) => info!(?selection, "codec"),
                Signal::CodecBitrate(bitrate) => info!(bitrate, "bitrate"),
                Signal::Codec2Library { loaded, error } if !loaded && !error.is_empty() => {
                    warn!("codec2 library: {error}");
                }
                Signal::OpusBackend { loaded, error } if !loaded && !error.is_empty() => {
                    warn!("opus backend: {error}");
                }
                _ => {}
            }
        }
    });

    let app = App::new(
        config,
        Some(args.settings.clone()),
        signals_tx,
        events_tx,
        events_rx,
        mic,
        sink,
        capture_settings,
    )?;

    // Interactive command surface on stdin.
    let command_events = app.events_sender();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let Some(command) = Command::parse(trimmed) else {
                        eprintln!(
                            "commands: ptt on|off, join [id host port [password]], leave, \
                             codec pcm|codec2|opus, bitrate N, forcepcm on|off, fec on|off, \
                             qos on|off, mic N, speaker N, ns on|off [level], \
                             keepmic on|off, codec2lib PATH, devices, status, quit"
                        );
                        continue;
                    };
                    let quitting = command == Command::Quit;
                    if command_events.send(Event::Command(command)).is_err() || quitting {
                        break;
                    }
                }
            }
        }
    });

    app.run().await
}
