use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::error::EngineError;
use crate::telemetry::logging::InitError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Engine(#[from] EngineError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("session {0} is not connected; run `beach-tide start {0}` first")]
    NotAttachable(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
