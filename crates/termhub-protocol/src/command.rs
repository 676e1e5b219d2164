//! Commands a consumer can issue to the orchestrator.

use serde::{Deserialize, Serialize};

use crate::SessionId;

/// The closed set of orchestrator commands.
///
/// Session-scoped commands carry the identifier of the backend they target.
/// `CreateLocal` is the one exception: the identifier is assigned by the
/// backend at spawn time and returned through the `created` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Command {
    /// Spawn a new local shell in a pseudo-terminal.
    CreateLocal {
        /// Initial terminal width in columns.
        cols: u16,
        /// Initial terminal height in rows.
        rows: u16,
    },

    /// Forward keyboard input to a local shell.
    LocalInput {
        id: SessionId,
        #[serde(with = "crate::base64_bytes")]
        data: Vec<u8>,
    },

    /// Resize a local shell's terminal.
    LocalResize { id: SessionId, cols: u16, rows: u16 },

    /// Open a remote shell session over SSH.
    ///
    /// If a session with this identifier already exists it is torn down
    /// before the new connection attempt begins.
    RemoteConnect {
        id: SessionId,
        host: String,
        port: u16,
        username: String,
        password: String,
    },

    /// Tear down a remote session.
    RemoteDisconnect { id: SessionId },

    /// Forward keyboard input to a remote shell channel.
    RemoteInput {
        id: SessionId,
        #[serde(with = "crate::base64_bytes")]
        data: Vec<u8>,
    },

    /// Send a window-size change to a remote shell channel.
    RemoteResize { id: SessionId, cols: u16, rows: u16 },

    /// List a directory on the remote host over a file sub-channel.
    ListDirectory { id: SessionId, path: String },

    /// Upload a local file into a remote directory.
    ///
    /// The destination name is the local file's base name placed under
    /// `remote_dir` (or the base name alone when `remote_dir` is `"."`).
    UploadFile {
        id: SessionId,
        local_path: String,
        remote_dir: String,
    },
}

impl Command {
    /// The session identifier this command targets, if it carries one.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Command::CreateLocal { .. } => None,
            Command::LocalInput { id, .. }
            | Command::LocalResize { id, .. }
            | Command::RemoteConnect { id, .. }
            | Command::RemoteDisconnect { id }
            | Command::RemoteInput { id, .. }
            | Command::RemoteResize { id, .. }
            | Command::ListDirectory { id, .. }
            | Command::UploadFile { id, .. } => Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_local_serialization() {
        let cmd = Command::CreateLocal { cols: 80, rows: 24 };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"type":"create-local","data":{"cols":80,"rows":24}}"#);

        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn remote_connect_round_trip() {
        let cmd = Command::RemoteConnect {
            id: "web-01".into(),
            host: "web-01.internal".into(),
            port: 22,
            username: "deploy".into(),
            password: "hunter2".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn input_payload_is_base64() {
        let cmd = Command::RemoteInput {
            id: "web-01".into(),
            data: b"uptime\n".to_vec(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("dXB0aW1lCg=="), "unexpected wire form: {json}");
    }

    #[test]
    fn session_id_extraction() {
        assert_eq!(
            Command::CreateLocal { cols: 80, rows: 24 }.session_id(),
            None
        );
        assert_eq!(
            Command::RemoteDisconnect { id: "abc".into() }
                .session_id()
                .map(String::as_str),
            Some("abc")
        );
    }
}
