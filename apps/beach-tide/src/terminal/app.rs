use std::env;
use std::sync::Arc;
use std::time::Duration;

use crossterm::terminal;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::display::{DisplayFactory, StdoutDisplay, TerminalDisplay, VirtualDisplay};
use crate::engine::SessionEngine;
use crate::events::EngineEvent;
use crate::session::{Session, SessionStatus};
use crate::terminal::cli::{Cli, Command, CreateArgs};
use crate::terminal::error::CliError;
use crate::transport::{Credentials, Transport, WebSocketConfig, WebSocketTransport};

/// Ctrl-]
const DETACH_BYTE: u8 = 0x1d;
const RESIZE_POLL: Duration = Duration::from_millis(500);

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli)?;

    let ws_config = WebSocketConfig::new(&cli.host)?
        .with_reconnect(config.reconnect.clone())
        .with_outbound_buffer(config.outbound_buffer)
        .with_heartbeat(config.heartbeat);
    let transport = Arc::new(WebSocketTransport::new(ws_config));
    transport.connect(&Credentials::new(cli.token.clone())).await?;
    info!(target = "tide::cli", endpoint = %transport.endpoint(), "connected to host");

    let mut builder = SessionEngine::builder(transport.clone()).config(config);
    if let Command::Attach(args) = &cli.command {
        builder = builder.display_factory(focused_display(args.id.clone()));
    }
    let engine = builder.build();
    engine.refresh_sessions().await?;

    let result = match cli.command {
        Command::List => {
            print_sessions(&engine.sessions());
            Ok(())
        }
        Command::Create(args) => create(&engine, args).await,
        Command::Start(args) => {
            let session = engine.start(&args.id).await?;
            println!("▶️  {} started (pid {})", session.id, pid_label(&session));
            Ok(())
        }
        Command::Stop(args) => {
            let session = engine.stop(&args.id).await?;
            println!("⏹️  {} stopped", session.id);
            Ok(())
        }
        Command::Remove(args) => {
            engine.remove(&args.id).await?;
            println!("🗑️  {} removed", args.id);
            Ok(())
        }
        Command::Attach(args) => attach(&engine, &args.id).await,
    };
    transport.close();
    result
}

fn load_config(cli: &Cli) -> Result<EngineConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?.with_env()?,
        None => EngineConfig::load()?,
    };
    if let Some(ms) = cli.debounce_ms {
        config.sync.debounce = Duration::from_millis(ms);
    }
    config.validate()?;
    debug!(target = "tide::cli", ?config, "configuration loaded");
    Ok(config)
}

/// Renders the attached session to stdout; every other session gets an
/// off-screen buffer.
fn focused_display(focus: String) -> DisplayFactory {
    Arc::new(move |session: &Session| -> Box<dyn TerminalDisplay> {
        if session.id == focus {
            Box::new(StdoutDisplay::new())
        } else {
            Box::new(VirtualDisplay::new())
        }
    })
}

async fn create(engine: &SessionEngine, args: CreateArgs) -> Result<(), CliError> {
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => env::current_dir()?.display().to_string(),
    };
    if cwd.trim().is_empty() {
        return Err(CliError::InvalidArgument("working directory must not be empty".into()));
    }
    let session = engine.create(args.kind, cwd, args.name).await?;
    println!("🌊 created {} session {}", session.kind, session.id);
    println!("   pid {}  cwd {}", pid_label(&session), session.working_directory);
    Ok(())
}

fn pid_label(session: &Session) -> String {
    session
        .pid
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_sessions(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("no sessions");
        return;
    }
    println!(
        "{:<36}  {:<12}  {:<9}  {:>7}  {:<20}  CWD",
        "ID", "STATUS", "KIND", "PID", "NAME"
    );
    for session in sessions {
        println!(
            "{:<36}  {:<12}  {:<9}  {:>7}  {:<20}  {}",
            session.id,
            session.status,
            session.kind,
            pid_label(session),
            session.display_name,
            session.working_directory
        );
    }
}

struct RawModeGuard(bool);

impl RawModeGuard {
    fn new() -> Self {
        match terminal::enable_raw_mode() {
            Ok(()) => Self(true),
            Err(err) => {
                eprintln!("⚠️  failed to enable raw mode: {err}");
                Self(false)
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = terminal::disable_raw_mode();
        }
    }
}

async fn attach(engine: &SessionEngine, id: &str) -> Result<(), CliError> {
    let session = engine.require(id)?;
    if !session.is_connected() {
        return Err(CliError::NotAttachable(id.to_string()));
    }

    let mut events = engine.subscribe();
    let raw = RawModeGuard::new();
    engine.attach(id).await?;
    let mut size = terminal::size().ok();
    if let Some((cols, rows)) = size {
        engine.resize(id, cols, rows).await?;
    }

    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    let mut resize_tick = tokio::time::interval(RESIZE_POLL);
    resize_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            read = stdin.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break "stdin closed";
                }
                let chunk = &buf[..n];
                if let Some(pos) = chunk.iter().position(|byte| *byte == DETACH_BYTE) {
                    if pos > 0 {
                        engine.forward(id, &chunk[..pos]).await?;
                    }
                    break "detached";
                }
                if let Err(err) = engine.forward(id, chunk).await {
                    if err.is_transient() {
                        warn!(target = "tide::cli", error = %err, "input not delivered");
                    } else {
                        return Err(err.into());
                    }
                }
            }
            event = events.recv() => match event {
                Ok(EngineEvent::SessionRemoved { session_id }) if session_id == id => {
                    break "session removed";
                }
                Ok(EngineEvent::SessionUpdated(session))
                    if session.id == id && session.status == SessionStatus::Disconnected =>
                {
                    break "session disconnected";
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break "engine stopped",
            },
            _ = resize_tick.tick() => {
                let current = terminal::size().ok();
                if current != size {
                    size = current;
                    if let Some((cols, rows)) = current {
                        engine.resize(id, cols, rows).await?;
                    }
                }
            }
        }
    };
    drop(raw);
    eprintln!("\r\n🌊 {reason}");
    Ok(())
}
