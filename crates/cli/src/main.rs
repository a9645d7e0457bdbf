//! Headless shell client.
//!
//! Connects to a server, joins a conference and records it to a file until
//! interrupted. Exit code is non-zero on fatal auth failure so scripted
//! test runs can tell login problems from clean shutdowns.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use confero_client_core::{ClientConfig, ClientController, ClientEvent, ClientState};

#[derive(Parser, Debug)]
#[command(name = "shclnt", about = "Headless Confero conference client")]
struct Args {
    /// Server address, host[:port]
    server: String,
    /// Account login
    login: String,
    /// Account password
    password: String,
    /// Conference tag to join
    conference: String,
    /// Output file (.webm, or .mp3 for audio only)
    file: String,

    /// Use TLS toward the signalling endpoint
    #[arg(long)]
    secure: bool,

    /// Optional TOML config file; command line arguments win over it
    #[arg(long)]
    config: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {path}"))?;
            toml::from_str(&raw).with_context(|| format!("cannot parse config file {path}"))?
        }
        None => ClientConfig::default(),
    };
    config.server_address = args.server.clone();
    config.server_secure = args.secure;
    config.login = args.login.clone();
    config.password = args.password.clone();
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    let (controller, mut events) = ClientController::new(config);
    controller.connect();

    let mp3_mode = args.file.ends_with(".mp3");
    let mut joined = false;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break ExitCode::SUCCESS;
            }
            event = events.recv() => {
                let Some(event) = event else { break ExitCode::SUCCESS };
                match event {
                    ClientEvent::StateChanged(ClientState::Online) if !joined => {
                        info!("online, joining conference {}", args.conference);
                        if let Err(e) = controller.connect_to_conference(&args.conference, false, false, false) {
                            error!("cannot join: {e}");
                            break ExitCode::FAILURE;
                        }
                    }
                    ClientEvent::ConferenceJoined(conference) => {
                        joined = true;
                        info!("joined conference '{}', recording to {}", conference.name, args.file);
                        if let Err(e) = controller.recorder().start(&args.file, mp3_mode) {
                            error!("cannot start recorder: {e}");
                            break ExitCode::FAILURE;
                        }
                    }
                    ClientEvent::AuthFailed(reason) => {
                        error!("authentication failed: {reason:?}");
                        break ExitCode::FAILURE;
                    }
                    ClientEvent::ConferenceRefused { reason } => {
                        error!("conference refused: {reason}");
                        break ExitCode::FAILURE;
                    }
                    ClientEvent::ConnectionLost => {
                        info!("connection lost, reconnecting");
                    }
                    ClientEvent::MessagesDelivered(messages) => {
                        for message in messages {
                            info!("[chat] {}: {}", message.author_name, message.text);
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    controller.recorder().stop();
    controller.disconnect();
    outcome
}
