use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Calling it again is a no-op.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        // the attach view owns stdout, so logs never go there
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let (filter, throttled) = match std::env::var("BEACH_TIDE_LOG_FILTER") {
        Ok(directives) => (directives, false),
        Err(_) => default_directives(config.level.filter(), allow_dependency_traces()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    if throttled {
        tracing::debug!(
            target = "tide::telemetry",
            "dependency traces capped at info; set BEACH_TIDE_TRACE_DEPS=1 to lift"
        );
    }
    Ok(())
}

const NOISY_DEPENDENCIES: &[&str] = &["tokio_tungstenite", "tungstenite", "mio", "native_tls"];

fn allow_dependency_traces() -> bool {
    super::env_flag("BEACH_TIDE_TRACE_DEPS").unwrap_or(false)
}

fn default_directives(level: LevelFilter, allow_deps: bool) -> (String, bool) {
    let mut directives = match level {
        LevelFilter::TRACE => "info,beach_tide=trace".to_string(),
        LevelFilter::DEBUG => "info,beach_tide=debug".to_string(),
        other => other.to_string().to_lowercase(),
    };
    let throttle = level == LevelFilter::TRACE && !allow_deps;
    if throttle {
        for target in NOISY_DEPENDENCIES {
            directives.push_str(&format!(",{target}=info"));
        }
    }
    (directives, throttle)
}

/// Classic offset / hex / ascii dump for trace logging of payloads.
pub fn hexdump(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", row * 16);
        for index in 0..16 {
            match chunk.get(index) {
                Some(byte) => {
                    let _ = write!(out, " {byte:02x}");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        out.extend(chunk.iter().map(|&byte| {
            if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_level_throttles_dependencies() {
        let (filter, throttled) = default_directives(LevelFilter::TRACE, false);
        assert!(throttled);
        assert!(filter.contains("tungstenite=info"));
        assert!(filter.starts_with("info,beach_tide=trace"));

        let (filter, throttled) = default_directives(LevelFilter::TRACE, true);
        assert!(!throttled);
        assert!(!filter.contains("tungstenite"));
    }

    #[test]
    fn quiet_levels_map_directly() {
        assert_eq!(default_directives(LevelFilter::WARN, false).0, "warn");
        assert_eq!(default_directives(LevelFilter::ERROR, false).0, "error");
    }

    #[test]
    fn hexdump_marks_unprintable_bytes() {
        let dump = hexdump(b"ls\n");
        assert!(dump.starts_with("00000000  6c 73 0a"));
        assert!(dump.trim_end().ends_with("|ls.|"));
    }
}
