//! Streaming normalization and conversation-invariant engine for clients that
//! talk to several LLM providers.
//!
//! Three incompatible streaming dialects are decoded into one canonical
//! [`StreamEvent`](protocol::canonical::StreamEvent) sequence, and caller-owned
//! history is repaired so tool calls are always answered in the next message.

pub mod adapter;
pub mod config;
pub mod error;
pub mod history;
pub mod observability;
pub mod protocol;
pub mod stream;
pub mod transport;

mod util;

pub use adapter::{Adapter, AdapterRegistry, HttpAdapter, PersistentConnection, TurnHandle, TurnRequest};
pub use error::EngineError;
