//! # Termhub Protocol
//!
//! The typed contract between the termhub session orchestrator and whatever
//! consumer drives it (a desktop UI, the bundled `termhub serve` stdio
//! frontend, tests).
//!
//! Two enums carry everything:
//!
//! - [`Command`]: the closed set of requests a consumer may issue, one
//!   variant per operation. Every session-scoped command carries the
//!   [`SessionId`] it targets.
//! - [`Event`]: the asynchronous notifications an orchestrator emits back,
//!   always scoped to one session. [`EventKind`] is the payload-free
//!   discriminant used as a subscription key.
//!
//! Both serialize with serde's tagged-enum representation so the contract
//! can be spoken as newline-delimited JSON across a process boundary.
//! Terminal payloads are raw bytes; in human-readable formats they appear
//! base64-encoded (see [`base64_bytes`]).

pub mod command;
pub mod event;

mod bytes;

pub use bytes::base64_bytes;
pub use command::Command;
pub use event::{Event, EventEnvelope, EventKind, FileAttrs, FileEntry};

/// Opaque key naming one active backend session and its event channels.
///
/// Local backends derive it from the spawned process id; remote backends
/// use whatever the caller supplied before connecting. An id is never
/// shared by two live backends.
pub type SessionId = String;
