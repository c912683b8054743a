use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use meshcall::config::{LoggingConfig, ServerConfig, SessionConfig, DEFAULT_MAX_OCCUPANTS};
use meshcall::logging::init_logging;
use meshcall::media::{FacingMode, MediaConstraints, MediaSource, SilentSource};
use meshcall::webrtc::WebRtcConnector;
use meshcall::{RoomCall, SessionEvent, SignalingServer};

#[derive(Parser, Debug)]
#[command(name = "meshcall")]
#[command(about = "Room signaling server and mesh call client", long_about = None)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct LoggingArgs {
    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, env = "MESHCALL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true, env = "MESHCALL_LOG_FORMAT", default_value = "pretty")]
    log_format: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling server
    Serve {
        /// Listen address
        #[arg(long, env = "MESHCALL_BIND", default_value = "127.0.0.1:5000")]
        bind: String,

        /// Listen on 0.0.0.0 at this port instead of --bind
        #[arg(long, env = "PORT")]
        port: Option<u16>,

        /// Maximum occupants per room
        #[arg(long, env = "MESHCALL_MAX_OCCUPANTS", default_value_t = DEFAULT_MAX_OCCUPANTS)]
        max_occupants: usize,
    },
    /// Join a room as a headless participant
    Join {
        /// Signaling server URL
        #[arg(long, env = "MESHCALL_URL", default_value = "ws://127.0.0.1:5000")]
        url: String,

        /// Room to join
        room: String,

        /// Also publish this name in the server directory
        #[arg(long)]
        name: Option<String>,

        /// Send audio only
        #[arg(long)]
        no_video: bool,

        /// STUN/TURN server URL, repeatable
        #[arg(long = "ice-server")]
        ice_servers: Vec<String>,

        /// Seconds to wait for a session to connect
        #[arg(long, default_value_t = 30)]
        negotiation_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        level: cli.logging.log_level,
        format: cli.logging.log_format,
    })?;

    match cli.command {
        Command::Serve {
            bind,
            port,
            max_occupants,
        } => {
            let bind_addr = match port {
                Some(port) => format!("0.0.0.0:{port}"),
                None => bind,
            };
            serve(ServerConfig {
                bind_addr,
                max_occupants,
            })
            .await
        }
        Command::Join {
            url,
            room,
            name,
            no_video,
            ice_servers,
            negotiation_timeout,
        } => {
            let mut config = SessionConfig {
                negotiation_timeout: Duration::from_secs(negotiation_timeout),
                ..SessionConfig::default()
            };
            if !ice_servers.is_empty() {
                config.ice_servers = ice_servers;
            }
            let constraints = MediaConstraints {
                audio: true,
                video: (!no_video).then_some(FacingMode::User),
            };
            join(&url, &room, name.as_deref(), constraints, config).await
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let server = SignalingServer::bind(&config)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(
        addr = %server.local_addr()?,
        max_occupants = config.max_occupants,
        "signaling server listening"
    );

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await?;
    info!("signaling server stopped");
    Ok(())
}

async fn join(
    url: &str,
    room: &str,
    name: Option<&str>,
    constraints: MediaConstraints,
    config: SessionConfig,
) -> Result<()> {
    let connector = Arc::new(WebRtcConnector::new(&config)?);
    let media = SilentSource::new(format!("meshcall-{}", std::process::id()))
        .acquire(&constraints)
        .await?;

    let (call, mut events) = RoomCall::join(url, room, connector, media, config)
        .await
        .with_context(|| format!("Failed to join {room} at {url}"))?;
    if let Some(name) = name {
        call.register_name(name)?;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Welcome { id }) => info!(id = %id, "assigned connection id"),
                Some(SessionEvent::OccupantsKnown { room, occupants }) => {
                    info!(room = %room, occupants = occupants.len(), "room joined");
                }
                Some(SessionEvent::RoomFull { room }) => {
                    warn!(room = %room, "room is full");
                    break;
                }
                Some(SessionEvent::SessionEstablished { peer, media }) => {
                    info!(peer = %peer, tracks = media.track_count(), "call connected");
                }
                Some(SessionEvent::SessionClosed { peer }) => info!(peer = %peer, "call ended"),
                Some(SessionEvent::CallFailed { peer, reason }) => {
                    warn!(peer = %peer, "call failed: {}", reason);
                }
                Some(SessionEvent::Directory { entries }) => {
                    info!(entries = entries.len(), "directory updated");
                }
                Some(SessionEvent::Rejected { message }) => warn!("server rejected request: {}", message),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    call.leave().await?;
    Ok(())
}
