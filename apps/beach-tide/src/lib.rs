pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod input;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod task;
pub mod telemetry;
pub mod terminal;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{DisplayFactory, SessionEngine, SessionEngineBuilder};
pub use error::EngineError;
pub use events::EngineEvent;
pub use session::{Session, SessionKind, SessionStatus, SessionSummary};
