//! Agent orchestration runtime for Tether.
//!
//! Sessions delegate code-editing and command work on a remote machine to a
//! tool-calling model loop. Every tool call passes through path and command
//! validation, may wait for a human decision, and every file mutation is
//! snapshotted so a session can be rolled back.

pub mod config;
pub mod conversation;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod prompts;
pub mod redact;
pub mod remote;
pub mod sandbox;
pub mod session;
pub mod snapshot;
pub mod tools;
pub mod truncation;
pub mod validator;

pub use config::*;
pub use conversation::*;
pub use errors::*;
pub use events::*;
pub use orchestrator::*;
pub use prompts::*;
pub use redact::*;
pub use remote::*;
pub use sandbox::*;
pub use session::*;
pub use snapshot::*;
pub use tools::*;
pub use truncation::*;
pub use validator::*;
