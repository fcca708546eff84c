pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod trace;

pub use config::StrataConfig;
pub use error::{Result, RunError, StrataError};
pub use event::EventBus;
pub use state::State;
pub use trace::{AttemptOutcome, RunId, RunStatus, TraceEvent, TracePhase, TraceRecorder};
