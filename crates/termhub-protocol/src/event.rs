//! Events the orchestrator emits back to its consumer.

use serde::{Deserialize, Serialize};

use crate::SessionId;

/// A session-scoped notification from a backend adapter.
///
/// Events for one session are delivered in production order; nothing is
/// implied about ordering across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Event {
    /// A new backend was registered under `id`.
    Created { id: SessionId },

    /// A chunk of terminal output. Arbitrary size, opaque bytes.
    Output {
        #[serde(with = "crate::base64_bytes")]
        data: Vec<u8>,
    },

    /// A local shell process exited.
    Exit { code: i32, signal: Option<i32> },

    /// A remote connection authenticated successfully.
    Ready,

    /// A backend failed; the session does not recover on its own.
    Error { message: String },

    /// A remote shell channel closed and the connection was ended.
    Closed,

    /// A directory listing completed.
    ListResult { entries: Vec<FileEntry> },

    /// A directory listing failed.
    ListError { message: String },

    /// An upload finished; `error` is `None` on success.
    UploadDone { error: Option<String> },
}

impl Event {
    /// The payload-free discriminant, used as the router subscription key.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Created { .. } => EventKind::Created,
            Event::Output { .. } => EventKind::Output,
            Event::Exit { .. } => EventKind::Exit,
            Event::Ready => EventKind::Ready,
            Event::Error { .. } => EventKind::Error,
            Event::Closed => EventKind::Closed,
            Event::ListResult { .. } => EventKind::ListResult,
            Event::ListError { .. } => EventKind::ListError,
            Event::UploadDone { .. } => EventKind::UploadDone,
        }
    }
}

/// Event discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Created,
    Output,
    Exit,
    Ready,
    Error,
    Closed,
    ListResult,
    ListError,
    UploadDone,
}

impl EventKind {
    /// Every kind, for consumers that subscribe to a whole session.
    pub const ALL: [EventKind; 9] = [
        EventKind::Created,
        EventKind::Output,
        EventKind::Exit,
        EventKind::Ready,
        EventKind::Error,
        EventKind::Closed,
        EventKind::ListResult,
        EventKind::ListError,
        EventKind::UploadDone,
    ];
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name (not a full path).
    pub name: String,
    /// `ls -l`-style descriptive line for display.
    pub longname: String,
    /// Raw attribute bundle as reported by the server.
    pub attrs: FileAttrs,
}

/// File attributes as reported over the file sub-channel.
///
/// Every field is optional: SFTP servers are free to omit any of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAttrs {
    /// Size in bytes.
    pub size: Option<u64>,
    /// Owning user id.
    pub uid: Option<u32>,
    /// Owning group id.
    pub gid: Option<u32>,
    /// Unix permission bits, including the file-type bits.
    pub permissions: Option<u32>,
    /// Last access time, seconds since the epoch.
    pub atime: Option<u32>,
    /// Last modification time, seconds since the epoch.
    pub mtime: Option<u32>,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// An event paired with the session it belongs to, as written on the wire
/// by the stdio frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: SessionId,
    #[serde(flatten)]
    pub event: Event,
}
