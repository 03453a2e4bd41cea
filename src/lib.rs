//! Orchestration core for a local speech-to-text desktop app: brings up a
//! bundled python inference server (interpreter discovery, virtualenv
//! provisioning, process lifecycle) and runs streaming transcription
//! sessions against it over HTTP + server-sent events.

pub mod client;
pub mod config;
pub mod install_progress;
pub mod protocol;
pub mod provision;
pub mod runtime;
pub mod session;
pub mod sse;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod trace;
pub mod transcript;

#[cfg(test)]
mod testutil;

pub use client::{BackendClient, UsageMonitor};
pub use config::BackendConfig;
pub use session::{SessionOutcome, SessionUpdate, TranscriptionSession};
pub use status::{BackendPhase, BackendStatus, StatusBroadcaster};
pub use store::JsonStore;
pub use supervisor::Supervisor;
pub use transcript::TranscriptSegment;
