//! Swizzle relay: a WebSocket hub that pairs a UI-driving peer with a
//! swizzling instrumentation peer and walks a command script across both.

pub mod bindings;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod peer;
pub mod registry;
pub mod runner;
pub mod script;
pub mod server;
pub mod session;
pub mod telemetry;

pub use relay_proto::{ExecutionResult, OutboundEnvelope, Role};
pub use runner::{Outcome, RunnerSnapshot, RunnerState};
pub use script::{Command, Script, UnboundPolicy, WaitPolicy};
pub use session::{RelaySession, SessionConfig, SessionStatus};
