//! The orchestrator facade.
//!
//! One entry point for every consumer command. The facade resolves the
//! target backend through the registry, drives the adapters, and converts
//! every adapter failure into an event scoped to the originating session.
//! Commands never return errors across this boundary, and a failure in one
//! session cannot touch any other session's backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use termhub_protocol::{Command, Event, EventKind, SessionId};

use crate::config::Config;
use crate::files::{self, FileOpError};
use crate::router::ChannelRouter;
use crate::session::local::{LocalSession, SpawnError};
use crate::session::registry::{Backend, SessionRegistry};
use crate::session::remote::{ConnectParams, RemoteSession, ShellCommand};
use crate::session::{local, remote::SshHandle};

/// Geometry used when a create command carries zeros.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Owns the registry and router and dispatches consumer commands.
pub struct Orchestrator {
    config: Config,
    registry: Arc<SessionRegistry>,
    router: Arc<ChannelRouter>,
}

impl Orchestrator {
    /// Creates an orchestrator with no sessions.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            router: Arc::new(ChannelRouter::new()),
        }
    }

    /// Subscribes to one of a session's event channels.
    pub fn subscribe(&self, id: &SessionId, kind: EventKind) -> mpsc::Receiver<Event> {
        self.router.subscribe(id, kind)
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The event router.
    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }

    /// Dispatches one consumer command.
    pub async fn handle(&self, command: Command) {
        match command {
            Command::CreateLocal { cols, rows } => {
                if let Err(e) = self.create_local(cols, rows).await {
                    tracing::error!(error = %e, "Local session creation failed");
                }
            }
            Command::LocalInput { id, data } => self.local_input(&id, &data).await,
            Command::LocalResize { id, cols, rows } => self.local_resize(&id, cols, rows).await,
            Command::RemoteConnect {
                id,
                host,
                port,
                username,
                password,
            } => {
                self.remote_connect(
                    id,
                    ConnectParams {
                        host,
                        port,
                        username,
                        password,
                    },
                )
                .await
            }
            Command::RemoteDisconnect { id } => self.remote_disconnect(&id).await,
            Command::RemoteInput { id, data } => self.remote_input(&id, data).await,
            Command::RemoteResize { id, cols, rows } => self.remote_resize(&id, cols, rows).await,
            Command::ListDirectory { id, path } => self.list_directory(id, path).await,
            Command::UploadFile {
                id,
                local_path,
                remote_dir,
            } => self.upload_file(id, local_path, remote_dir).await,
        }
    }

    /// Spawns a local shell and returns its new identifier.
    ///
    /// The identifier is registered before any output can flow, and the
    /// `created` event precedes every other event of the session.
    pub async fn create_local(&self, cols: u16, rows: u16) -> Result<SessionId, SpawnError> {
        let cols = if cols == 0 { DEFAULT_COLS } else { cols };
        let rows = if rows == 0 { DEFAULT_ROWS } else { rows };

        let preferred = local::resolve_shell(&self.config.terminal.shell);
        let (session, _used_fallback) = LocalSession::spawn_with_fallback(
            &preferred,
            &self.config.terminal.fallback_shell,
            cols,
            rows,
            None,
            &self.config.terminal.term,
        )?;

        let session = Arc::new(session);
        let id = session.id().clone();

        self.registry
            .upsert(id.clone(), Backend::Local(Arc::clone(&session)))
            .await;
        self.router.publish(&id, Event::Created { id: id.clone() });
        Arc::clone(&session)
            .start_io(Arc::clone(&self.router), Arc::clone(&self.registry))
            .await;

        Ok(id)
    }

    async fn local_input(&self, id: &SessionId, data: &[u8]) {
        let Some(backend) = self.registry.get(id) else {
            return;
        };
        let Some(session) = backend.as_local() else {
            tracing::warn!(session_id = %id, "local-input targets a remote session; ignoring");
            return;
        };
        if let Err(e) = session.write(data).await {
            self.router.publish(
                id,
                Event::Error {
                    message: e.to_string(),
                },
            );
        }
    }

    async fn local_resize(&self, id: &SessionId, cols: u16, rows: u16) {
        // Unknown identifiers are a silent no-op: the session may have
        // exited between the consumer's resize and its arrival here.
        let Some(backend) = self.registry.get(id) else {
            return;
        };
        let Some(session) = backend.as_local() else {
            return;
        };
        if let Err(e) = session.resize(cols, rows).await {
            self.router.publish(
                id,
                Event::Error {
                    message: e.to_string(),
                },
            );
        }
    }

    /// Starts a remote session under the caller-chosen identifier.
    ///
    /// Any backend already holding the identifier is torn down before the
    /// connection attempt begins: a reconnect always wins over a stale
    /// session.
    pub async fn remote_connect(&self, id: SessionId, params: ConnectParams) {
        let (session, cmd_rx) = RemoteSession::new(id.clone(), params);
        let session = Arc::new(session);

        self.registry
            .upsert(id.clone(), Backend::Remote(Arc::clone(&session)))
            .await;
        session.start(
            &self.config,
            Arc::clone(&self.router),
            Arc::clone(&self.registry),
            cmd_rx,
        );
    }

    async fn remote_disconnect(&self, id: &SessionId) {
        let Some(backend) = self.registry.get(id) else {
            return;
        };
        let Some(session) = backend.as_remote() else {
            tracing::warn!(session_id = %id, "remote-disconnect targets a local session; ignoring");
            return;
        };
        self.registry.remove(id);
        // The driver observes the cancellation and emits `closed` once.
        session.teardown().await;
    }

    async fn remote_input(&self, id: &SessionId, data: Vec<u8>) {
        let Some(backend) = self.registry.get(id) else {
            return;
        };
        if let Some(session) = backend.as_remote() {
            if !session.send(ShellCommand::Input(data)).await {
                tracing::debug!(session_id = %id, "Input dropped: no active shell channel");
            }
        }
    }

    async fn remote_resize(&self, id: &SessionId, cols: u16, rows: u16) {
        let Some(backend) = self.registry.get(id) else {
            return;
        };
        if let Some(session) = backend.as_remote() {
            if !session.send(ShellCommand::Resize { cols, rows }).await {
                tracing::debug!(session_id = %id, "Resize dropped: no active shell channel");
            }
        }
    }

    /// Lists a remote directory on the session's file sub-channel.
    ///
    /// Without an established connection this answers immediately with a
    /// `list-error` and performs no I/O.
    async fn list_directory(&self, id: SessionId, path: String) {
        let Some(connection) = self.remote_connection(&id).await else {
            self.router.publish(
                &id,
                Event::ListError {
                    message: FileOpError::ConnectionNotFound.to_string(),
                },
            );
            return;
        };

        let router = Arc::clone(&self.router);
        let timeout_secs = self.config.files.op_timeout_secs;
        tokio::spawn(async move {
            let result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                files::list_directory(&connection, &path),
            )
            .await
            .unwrap_or(Err(FileOpError::Timeout(timeout_secs)));

            let event = match result {
                Ok(entries) => Event::ListResult { entries },
                Err(e) => Event::ListError {
                    message: e.to_string(),
                },
            };
            router.publish(&id, event);
        });
    }

    /// Uploads a local file into a remote directory.
    async fn upload_file(&self, id: SessionId, local_path: String, remote_dir: String) {
        let Some(connection) = self.remote_connection(&id).await else {
            self.router.publish(
                &id,
                Event::UploadDone {
                    error: Some(FileOpError::ConnectionNotFound.to_string()),
                },
            );
            return;
        };

        let router = Arc::clone(&self.router);
        let timeout_secs = self.config.files.op_timeout_secs;
        let max_size = self.config.files.max_upload_size;
        tokio::spawn(async move {
            let result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                files::upload_file(&connection, &local_path, &remote_dir, max_size),
            )
            .await
            .unwrap_or(Err(FileOpError::Timeout(timeout_secs)));

            let event = Event::UploadDone {
                error: result.err().map(|e| e.to_string()),
            };
            router.publish(&id, event);
        });
    }

    /// The established connection behind a remote session id, if any.
    async fn remote_connection(&self, id: &SessionId) -> Option<Arc<SshHandle>> {
        let backend = self.registry.get(id)?;
        let session = backend.as_remote()?.clone();
        session.connection().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Config::default())
    }

    #[tokio::test]
    async fn resize_of_unknown_session_is_a_no_op() {
        let orch = orchestrator();
        orch.handle(Command::LocalResize {
            id: "missing".to_string(),
            cols: 100,
            rows: 40,
        })
        .await;
        assert_eq!(orch.registry().count(), 0);
    }

    #[tokio::test]
    async fn input_to_unknown_session_is_a_no_op() {
        let orch = orchestrator();
        orch.handle(Command::LocalInput {
            id: "missing".to_string(),
            data: b"ls\n".to_vec(),
        })
        .await;
        orch.handle(Command::RemoteInput {
            id: "missing".to_string(),
            data: b"ls\n".to_vec(),
        })
        .await;
    }

    #[tokio::test]
    async fn disconnect_of_unknown_session_is_a_no_op() {
        let orch = orchestrator();
        orch.handle(Command::RemoteDisconnect {
            id: "missing".to_string(),
        })
        .await;
    }

    #[tokio::test]
    async fn list_without_connection_yields_list_error() {
        let orch = orchestrator();
        let id = "no-conn".to_string();
        let mut rx = orch.subscribe(&id, EventKind::ListError);

        orch.handle(Command::ListDirectory {
            id: id.clone(),
            path: ".".to_string(),
        })
        .await;

        let event = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timeout")
            .expect("no event");
        match event {
            Event::ListError { message } => assert_eq!(message, "connection not found"),
            other => panic!("expected list-error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upload_without_connection_yields_upload_error() {
        let orch = orchestrator();
        let id = "no-conn".to_string();
        let mut rx = orch.subscribe(&id, EventKind::UploadDone);

        orch.handle(Command::UploadFile {
            id: id.clone(),
            local_path: "/tmp/report.txt".to_string(),
            remote_dir: ".".to_string(),
        })
        .await;

        let event = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timeout")
            .expect("no event");
        match event {
            Event::UploadDone { error } => {
                assert_eq!(error.as_deref(), Some("connection not found"))
            }
            other => panic!("expected upload-done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_replaces_pending_session() {
        let orch = orchestrator();
        let id = "replace-me".to_string();
        // A blackhole address keeps the first attempt in Connecting.
        let params = ConnectParams {
            host: "10.255.255.1".to_string(),
            port: 22,
            username: "tester".to_string(),
            password: String::new(),
        };

        orch.remote_connect(id.clone(), params.clone()).await;
        let first = orch
            .registry()
            .get(&id)
            .and_then(|b| b.as_remote().cloned())
            .unwrap();

        orch.remote_connect(id.clone(), params).await;
        let second = orch
            .registry()
            .get(&id)
            .and_then(|b| b.as_remote().cloned())
            .unwrap();

        // The stale backend was torn down before the new attempt began.
        assert!(first.is_torn_down());
        assert!(!second.is_torn_down());
        assert_ne!(first.instance(), second.instance());
        assert_eq!(orch.registry().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn create_local_registers_before_returning() {
        let mut config = Config::default();
        config.terminal.shell = "/bin/sh".to_string();
        let orch = Orchestrator::new(config);

        let id = orch.create_local(80, 24).await.unwrap();
        assert!(orch.registry().contains(&id));

        orch.registry().remove(&id).unwrap().teardown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_geometry_falls_back_to_defaults() {
        let mut config = Config::default();
        config.terminal.shell = "/bin/sh".to_string();
        let orch = Orchestrator::new(config);

        let id = orch.create_local(0, 0).await.unwrap();
        let backend = orch.registry().get(&id).unwrap();
        assert_eq!(backend.as_local().unwrap().size(), (80, 24));

        orch.registry().remove(&id).unwrap().teardown().await;
    }
}
