use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::session::SessionKind;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "beach-tide",
    about = "🌊 Drive remote terminal sessions and keep their screens in sync",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "BEACH_TIDE_HOST",
        default_value = "ws://127.0.0.1:7878/tide",
        help = "Endpoint of the session host"
    )]
    pub host: String,

    #[arg(
        long,
        global = true,
        env = "BEACH_TIDE_TOKEN",
        hide_env_values = true,
        help = "Credential presented when connecting to the host"
    )]
    pub token: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Read engine settings from this file instead of ~/.beach/tide.toml"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "debounce-ms",
        global = true,
        value_name = "MS",
        help = "Override the refresh debounce window"
    )]
    pub debounce_ms: Option<u64>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "BEACH_TIDE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "BEACH_TIDE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the sessions the host knows about
    List,
    /// Spawn a new session on the host
    Create(CreateArgs),
    /// Restart a disconnected session
    Start(SessionArg),
    /// Stop a running session; it stays listed
    Stop(SessionArg),
    /// Stop and forget a session
    Remove(SessionArg),
    /// Mirror a session in this terminal and forward keystrokes (Ctrl-] detaches)
    Attach(SessionArg),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(long, value_enum, default_value_t = SessionKind::Shell)]
    pub kind: SessionKind,

    #[arg(long, value_name = "DIR", help = "Working directory on the host (defaults to the current directory)")]
    pub cwd: Option<String>,

    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct SessionArg {
    #[arg(value_name = "SESSION_ID")]
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_create_with_flags() {
        let cli = Cli::try_parse_from([
            "beach-tide",
            "--debounce-ms",
            "40",
            "create",
            "--kind",
            "assistant",
            "--cwd",
            "/tmp",
        ])
        .expect("parse");
        assert_eq!(cli.debounce_ms, Some(40));
        match cli.command {
            Command::Create(args) => {
                assert_eq!(args.kind, SessionKind::Assistant);
                assert_eq!(args.cwd.as_deref(), Some("/tmp"));
                assert!(args.name.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
