//! Model-service client for Tether.
//!
//! Provides the message/tool types exchanged with a tool-calling model, the
//! provider adapter contract, a middleware-capable client, rate-limit retry,
//! and an Anthropic Messages adapter.

pub mod anthropic;
pub mod client;
pub mod errors;
pub mod provider;
pub mod retry;
pub mod types;

pub use anthropic::*;
pub use client::*;
pub use errors::*;
pub use provider::*;
pub use retry::*;
pub use types::*;
