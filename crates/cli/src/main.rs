use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use events::{Envelope, EventKind};
use realtime::{
    ConnectionConfig, ConnectionManager, ConnectionState, ReconnectPolicy, SessionEvents,
    WebSocketTransport,
};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const APP_DIR: &str = "interview-link";
const CONFIG_FILE: &str = "config.toml";

#[derive(Parser)]
#[command(name = "interview-link")]
#[command(about = "Live event link to an interview session", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/interview-link/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Relay base URL, overrides config and INTERVIEW_WS_URL
    #[arg(long, global = true)]
    ws_url: Option<String>,

    #[arg(long, global = true)]
    base_delay_ms: Option<u64>,

    #[arg(long, global = true)]
    max_attempts: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print every session event until Ctrl+C
    Listen {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Connect, send one event and disconnect
    Emit {
        #[command(flatten)]
        session: SessionArgs,

        #[command(subcommand)]
        event: EmitEvent,
    },
    /// Show the resolved configuration
    Config {
        /// Write the resolved configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Args)]
struct SessionArgs {
    #[arg(short, long)]
    session: String,

    #[arg(short, long, env = "INTERVIEW_TOKEN")]
    token: String,
}

#[derive(Subcommand)]
enum EmitEvent {
    Question {
        text: String,
    },
    Response {
        text: String,
        #[arg(long)]
        conversation: String,
    },
    Suggestion {
        text: String,
        #[arg(long)]
        conversation: String,
    },
    /// Intervention fields as a JSON object
    Intervention {
        fields: String,
    },
    Voice {
        transcript: String,
        #[arg(long = "final")]
        is_final: bool,
    },
    Status {
        status: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = resolve_config(&cli, &config_path).await?;

    match cli.command {
        Commands::Listen { session } => listen(&config, &session).await,
        Commands::Emit { session, event } => emit(&config, &session, event).await,
        Commands::Config { save } => show_config(&config, &config_path, save).await,
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join(APP_DIR).join(CONFIG_FILE))
}

async fn resolve_config(cli: &Cli, path: &Path) -> Result<ConnectionConfig> {
    let mut config = ConnectionConfig::load(path)
        .await
        .with_context(|| format!("Failed to load config from {}", path.display()))?
        .apply_env_overrides();

    if let Some(url) = &cli.ws_url {
        config.ws_url = url.clone();
    }
    config.reconnect = ReconnectPolicy {
        base_delay_ms: cli.base_delay_ms.unwrap_or(config.reconnect.base_delay_ms),
        max_attempts: cli.max_attempts.unwrap_or(config.reconnect.max_attempts),
    };

    config.ws_url().context("Invalid relay URL")?;
    Ok(config)
}

/// Spawn a manager and wait for the connection to open
async fn open_session(config: &ConnectionConfig, session: &SessionArgs) -> Result<ConnectionManager> {
    let manager = ConnectionManager::from_config(WebSocketTransport::new(), config)?;

    let lost = Arc::new(Notify::new());
    let notify = lost.clone();
    let subscription = manager.on(EventKind::ConnectionLost, move |_| {
        notify.notify_one();
        Ok(())
    });

    tracing::info!(session_id = %session.session, ws_url = %config.ws_url, "Connecting");
    manager.connect(&session.session, &session.token);

    tokio::select! {
        _ = manager.wait_for_state(ConnectionState::Connected) => {}
        _ = lost.notified() => {
            bail!(
                "Could not connect to {} after {} attempts",
                config.ws_url,
                config.reconnect.max_attempts
            );
        }
        _ = tokio::signal::ctrl_c() => bail!("Interrupted"),
    }

    subscription.cancel();
    Ok(manager)
}

async fn listen(config: &ConnectionConfig, session: &SessionArgs) -> Result<()> {
    let manager = open_session(config, session).await?;

    let kinds = EventKind::DOMAIN.into_iter().chain([
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::Error,
        EventKind::ConnectionEstablished,
        EventKind::ConnectionLost,
    ]);
    for kind in kinds {
        manager.on(kind, |envelope| {
            print_envelope(envelope);
            Ok(())
        });
    }

    println!("Listening on session {} (Ctrl+C to stop)", session.session);

    let mut states = manager.state_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("-- {}", state);
            }
        }
    }

    let stats = manager.stats();
    manager.disconnect();
    manager.barrier().await;

    println!(
        "Received {} frames ({} undecodable, {} handler failures)",
        stats.frames_received, stats.protocol_errors, stats.handler_failures
    );
    Ok(())
}

fn print_envelope(envelope: &Envelope) {
    let payload = serde_json::to_string(&envelope.payload).unwrap_or_default();
    println!(
        "{} {:<22} {}",
        envelope.timestamp.format("%H:%M:%S%.3f"),
        envelope.kind.as_str(),
        payload
    );
}

async fn emit(config: &ConnectionConfig, session: &SessionArgs, event: EmitEvent) -> Result<()> {
    let manager = open_session(config, session).await?;
    let events = SessionEvents::new(manager.clone());
    let session_id = session.session.as_str();

    match event {
        EmitEvent::Question { text } => events.emit_question(text, session_id),
        EmitEvent::Response { text, conversation } => events.emit_response(text, conversation),
        EmitEvent::Suggestion { text, conversation } => {
            events.emit_ai_suggestion(text, conversation)
        }
        EmitEvent::Intervention { fields } => {
            let fields: Map<String, Value> =
                serde_json::from_str(&fields).context("Intervention fields must be a JSON object")?;
            events.emit_support_intervention(fields, session_id)
        }
        EmitEvent::Voice {
            transcript,
            is_final,
        } => events.emit_voice_recognition(transcript, is_final),
        EmitEvent::Status { status } => events.emit_session_status(status, session_id),
    }

    manager.barrier().await;
    let stats = manager.stats();
    manager.disconnect();
    manager.barrier().await;

    if stats.frames_sent == 0 {
        bail!("Event was not sent, connection dropped");
    }
    println!("Sent 1 event to session {}", session_id);
    Ok(())
}

async fn show_config(config: &ConnectionConfig, path: &Path, save: bool) -> Result<()> {
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    println!(
        "# reconnect gives up after {:?} of retries",
        config.reconnect.worst_case_downtime()
    );

    if save {
        config
            .write(path)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interview_link=info,realtime=warn,events=warn".into()),
        )
        .init();
}
