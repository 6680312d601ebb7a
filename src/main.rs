//! relayterm - remote shell sessions through a relay, with recording.
//!
//! `relayterm attach` bridges the local terminal to one relay session;
//! `relayterm play` replays a stored recording; `relayterm recordings`
//! manages the recording catalog.

use clap::{Parser as ClapParser, Subcommand};
use relayterm::{
    config::{Config, ConfigError},
    multiplexer::TabManager,
    player::{PlaybackSpeed, Player, PlayerError},
    recording::{FileStore, Recorder, RecordingStateError, RecordingStore, StoreError},
    session::{ConnectionStatus, SessionId},
    sink::StdoutSink,
    terminal::{self, TerminalError},
    transport::WsConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// relayterm - remote shell sessions through a relay
#[derive(ClapParser, Debug)]
#[command(name = "relayterm", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "RELAYTERM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a shell on the remote host in this terminal
    Attach {
        /// Relay WebSocket URL
        #[arg(long, env = "RELAYTERM_URL")]
        url: Option<String>,

        /// Shell to launch on the remote host
        #[arg(long)]
        shell: Option<String>,

        /// Record the session's output
        #[arg(long)]
        record: bool,

        /// Machine label stamped on the recording
        #[arg(long)]
        label: Option<String>,
    },

    /// Replay a recording to this terminal
    Play {
        /// Recording id
        id: String,

        /// Playback speed: 0.5, 1, 2 or 4
        #[arg(long)]
        speed: Option<PlaybackSpeed>,
    },

    /// Manage stored recordings
    Recordings {
        #[command(subcommand)]
        action: RecordingsAction,
    },
}

#[derive(Subcommand, Debug)]
enum RecordingsAction {
    /// List recordings, oldest first
    List,
    /// Print one recording's metadata
    Show { id: String },
    /// Delete a recording
    Delete { id: String },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("recording store: {0}")]
    Store(#[from] StoreError),

    #[error("recording: {0}")]
    Recording(#[from] RecordingStateError),

    #[error("playback: {0}")]
    Player(#[from] PlayerError),

    #[error("terminal: {0}")]
    Terminal(#[from] TerminalError),

    #[error("could not connect: {0}")]
    Connect(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing();
    // wss:// relays need a process-wide TLS provider; a second install is harmless.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Attach { url, shell, record, label } => {
            if let Some(url) = url {
                config.relay.url = url;
            }
            if let Some(shell) = shell {
                config.session.shell = Some(shell);
            }
            if let Some(label) = label {
                config.relay.machine_label = Some(label);
            }
            config.validate()?;
            run_attach(config, record).await
        }
        Commands::Play { id, speed } => run_play(config, id, speed).await,
        Commands::Recordings { action } => run_recordings(config, action),
    }
}

/// Tracing goes to stderr: stdout carries the remote terminal.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relayterm=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_store(config: &Config) -> Result<Arc<FileStore>, CliError> {
    Ok(Arc::new(FileStore::open(config.recording_dir())?))
}

// ── attach ─────────────────────────────────────────────────────────

async fn run_attach(config: Config, record: bool) -> Result<(), CliError> {
    let recorder = Recorder::new(open_store(&config)?);
    let mut defaults = config.session_defaults();
    defaults.geometry = terminal::terminal_geometry_or(defaults.geometry);

    let manager = TabManager::new(Arc::new(WsConnector), defaults, recorder);
    let id = manager
        .active()
        .ok_or_else(|| CliError::Connect("no session available".into()))?;
    manager.attach_sink(id, Arc::new(StdoutSink));

    let status = manager.connect(id).await;
    if status != Some(ConnectionStatus::Connected) {
        let reason = manager
            .controller(id)
            .map(|c| c.diagnostics().join("; "))
            .unwrap_or_default();
        return Err(CliError::Connect(reason));
    }

    if record {
        if let Some(result) = manager.start_recording(id) {
            let recording_id = result?;
            eprintln!("relayterm: recording {recording_id}");
        }
    }

    let raw_guard = terminal::RawModeGuard::new()?;
    let result = bridge(&manager, id).await;

    if record {
        if let Some(Ok(sealed)) = manager.stop_recording(id) {
            eprint!("\r\nrelayterm: saved recording {} ({} events)\r\n", sealed.id, sealed.events.len());
        }
    }
    manager.disconnect(id);
    drop(raw_guard);

    if let Some(controller) = manager.controller(id) {
        if let Some(reason) = controller.diagnostics().last() {
            eprintln!("relayterm: {reason}");
        }
    }
    result
}

/// Pump stdin to the session and terminal resizes to the relay until the
/// session ends or stdin closes.
async fn bridge(manager: &TabManager, id: SessionId) -> Result<(), CliError> {
    let Some(controller) = manager.controller(id) else {
        return Ok(());
    };
    let mut status_rx = controller.subscribe_status();
    let mut window = window_changes()?;
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            n = stdin.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    tracing::debug!("stdin closed");
                    return Ok(());
                }
                manager.send(id, &buf[..n]);
            }
            _ = window_changed(&mut window) => {
                if let Ok(geometry) = terminal::terminal_geometry() {
                    manager.resize(id, geometry.cols, geometry.rows);
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() || status_rx.borrow().status != ConnectionStatus::Connected {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(unix)]
type WindowChanges = tokio::signal::unix::Signal;

#[cfg(unix)]
fn window_changes() -> std::io::Result<WindowChanges> {
    use tokio::signal::unix::{signal, SignalKind};
    signal(SignalKind::window_change())
}

#[cfg(unix)]
async fn window_changed(signal: &mut WindowChanges) {
    if signal.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}

#[cfg(not(unix))]
type WindowChanges = ();

#[cfg(not(unix))]
fn window_changes() -> std::io::Result<WindowChanges> {
    Ok(())
}

#[cfg(not(unix))]
async fn window_changed(_signal: &mut WindowChanges) {
    std::future::pending::<()>().await
}

// ── play ───────────────────────────────────────────────────────────

async fn run_play(config: Config, id: String, speed: Option<PlaybackSpeed>) -> Result<(), CliError> {
    let store = open_store(&config)?;
    let player = Player::with_min_tick(store, Arc::new(StdoutSink), config.min_tick());
    player.set_speed(speed.unwrap_or_else(|| config.playback_speed()));
    player.load(&id)?;

    let mut state_rx = player.subscribe();
    player.play()?;
    tokio::select! {
        _ = state_rx.wait_for(|s| !s.playing) => {}
        _ = tokio::signal::ctrl_c() => player.pause(),
    }

    let state = player.state();
    eprintln!(
        "\r\nrelayterm: played {}/{} events ({:.0}%)",
        state.cursor, state.event_count, state.progress
    );
    Ok(())
}

// ── recordings ─────────────────────────────────────────────────────

fn run_recordings(config: Config, action: RecordingsAction) -> Result<(), CliError> {
    let store = open_store(&config)?;
    match action {
        RecordingsAction::List => {
            let recordings = store.list()?;
            if recordings.is_empty() {
                println!("No recordings in {}", store.dir().display());
                return Ok(());
            }
            for r in recordings {
                let duration = r
                    .duration
                    .map(|d| format!("{d:.1}s"))
                    .unwrap_or_else(|| "recording".into());
                println!(
                    "{}  {:<24}  session {:<4} {:>6} events  {}",
                    r.id, r.machine_label, r.session_id.0, r.event_count, duration
                );
            }
        }
        RecordingsAction::Show { id } => {
            let summary = store.get(&id)?.summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        RecordingsAction::Delete { id } => {
            store.delete(&id)?;
            println!("Deleted recording {id}");
        }
    }
    Ok(())
}
