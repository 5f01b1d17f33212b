//! Conversation-history repair and validation.
//!
//! [`normalize_history`] rewrites a caller-owned history so every tool call is
//! answered in the very next message; [`preflight`] checks the same invariant
//! on the wire-level request right before it is sent.

pub mod normalize;
pub mod preflight;

pub use normalize::{normalize_history, MISSING_RESULT_CONTENT};
pub use preflight::{
    find_violations, preflight, Violation, ViolationKind, WireBlock, WireBlockKind, WireEntry,
    WireRole, WireTranscript,
};
