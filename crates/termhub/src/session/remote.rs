//! Remote SSH sessions.
//!
//! A remote session owns one authenticated SSH connection and the
//! interactive shell channel opened on it. The whole lifecycle runs in a
//! single driver task per session: it connects, authenticates, opens the
//! shell, then serves input/resize commands and channel traffic until the
//! channel closes, the caller disconnects, or the transport fails.
//!
//! States: `Connecting -> Ready -> Active -> Closed`, with `Errored`
//! reachable from `Connecting` and `Active`. An errored session never
//! reconnects on its own; the caller issues a fresh connect, which
//! replaces the stale backend unconditionally.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::{ChannelMsg, Disconnect};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use termhub_protocol::{Event, SessionId};

use crate::config::Config;
use crate::router::ChannelRouter;
use crate::session::registry::SessionRegistry;

/// Terminal geometry before the consumer's first resize arrives.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Capacity of the per-session command queue.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Remote session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Connection attempt in progress.
    Connecting,
    /// Authenticated; shell channel being opened.
    Ready,
    /// Shell channel is read/write.
    Active,
    /// Shell channel ended and the connection was closed.
    Closed,
    /// Transport, authentication, or channel failure.
    Errored,
}

/// Errors surfaced by the remote adapter, always converted to `error`
/// events before they reach a consumer.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("connection attempt timed out after {0}s")]
    ConnectTimeout(u64),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("authentication rejected for user {0}")]
    AuthRejected(String),

    #[error("failed to open shell channel: {0}")]
    ChannelOpen(String),

    #[error("shell channel error: {0}")]
    Channel(String),
}

/// Connection parameters supplied by the caller.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Commands served by the driver task while the shell channel is open.
#[derive(Debug)]
pub(crate) enum ShellCommand {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Disconnect,
}

/// Client-side transport handler.
///
/// Host keys are accepted with a warning; there is no known-hosts store.
pub(crate) struct HostAcceptor;

#[async_trait]
impl client::Handler for HostAcceptor {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::warn!("Accepting server host key without verification");
        Ok(true)
    }
}

/// Handle to an authenticated SSH connection.
pub(crate) type SshHandle = client::Handle<HostAcceptor>;

/// Algorithm lists skewed toward interoperability with old servers.
///
/// Legacy group1/group14 SHA-1 key exchanges and SHA-1 MACs stay enabled
/// on purpose: the appliances this talks to often never saw a firmware
/// update, and a session that cannot be opened protects nobody. The cost
/// is a wider negotiation surface than a modern-only client would carry.
fn compat_preferred() -> russh::Preferred {
    const KEX: &[russh::kex::Name] = &[
        russh::kex::CURVE25519,
        russh::kex::ECDH_SHA2_NISTP256,
        russh::kex::ECDH_SHA2_NISTP384,
        russh::kex::ECDH_SHA2_NISTP521,
        russh::kex::DH_G16_SHA512,
        russh::kex::DH_G14_SHA256,
        russh::kex::DH_G14_SHA1,
        russh::kex::DH_G1_SHA1,
    ];
    const CIPHER: &[russh::cipher::Name] = &[
        russh::cipher::CHACHA20_POLY1305,
        russh::cipher::AES_256_GCM,
        russh::cipher::AES_256_CTR,
        russh::cipher::AES_192_CTR,
        russh::cipher::AES_128_CTR,
    ];
    const MAC: &[russh::mac::Name] = &[
        russh::mac::HMAC_SHA256_ETM,
        russh::mac::HMAC_SHA512_ETM,
        russh::mac::HMAC_SHA1_ETM,
        russh::mac::HMAC_SHA256,
        russh::mac::HMAC_SHA512,
        russh::mac::HMAC_SHA1,
    ];

    let mut preferred = russh::Preferred::default();
    preferred.kex = KEX.into();
    preferred.cipher = CIPHER.into();
    preferred.mac = MAC.into();
    preferred
}

/// One remote shell session.
///
/// The struct is the registry-facing handle; all I/O happens in the driver
/// task spawned by [`RemoteSession::start`].
pub struct RemoteSession {
    id: SessionId,
    instance: Uuid,
    params: ConnectParams,
    state: Arc<RwLock<RemoteState>>,
    cmd_tx: mpsc::Sender<ShellCommand>,
    /// Set once authenticated; taken on teardown.
    handle: Arc<Mutex<Option<Arc<SshHandle>>>>,
    cancel: CancellationToken,
}

impl RemoteSession {
    /// Creates the session handle and its command queue.
    ///
    /// Nothing connects until [`start`](Self::start) is called, so the
    /// session can be registered first and no event can precede a known
    /// identifier.
    pub fn new(id: SessionId, params: ConnectParams) -> (Self, mpsc::Receiver<ShellCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let session = Self {
            id,
            instance: Uuid::new_v4(),
            params,
            state: Arc::new(RwLock::new(RemoteState::Connecting)),
            cmd_tx,
            handle: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        };
        (session, cmd_rx)
    }

    /// Returns the session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the backend instance marker.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Returns the current lifecycle state.
    pub async fn state(&self) -> RemoteState {
        *self.state.read().await
    }

    /// Returns the authenticated connection, if one is established.
    pub(crate) async fn connection(&self) -> Option<Arc<SshHandle>> {
        self.handle.lock().await.clone()
    }

    /// Queues a command for the driver task.
    ///
    /// Returns `false` when the driver is gone; the caller treats that the
    /// same as an unknown session.
    pub(crate) async fn send(&self, cmd: ShellCommand) -> bool {
        self.cmd_tx.send(cmd).await.is_ok()
    }

    /// Spawns the driver task that runs the connection lifecycle.
    pub(crate) fn start(
        &self,
        config: &Config,
        router: Arc<ChannelRouter>,
        registry: Arc<SessionRegistry>,
        cmd_rx: mpsc::Receiver<ShellCommand>,
    ) {
        let driver = Driver {
            id: self.id.clone(),
            instance: self.instance,
            params: self.params.clone(),
            state: Arc::clone(&self.state),
            handle_slot: Arc::clone(&self.handle),
            cancel: self.cancel.clone(),
            connect_timeout_secs: config.remote.connect_timeout_secs,
            keepalive_interval: config.keepalive_interval(),
            term: config.terminal.term.clone(),
            router,
            registry,
        };
        tokio::spawn(driver.run(cmd_rx));
    }

    /// Whether teardown has been requested.
    pub fn is_torn_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels the driver task and ends the underlying connection.
    ///
    /// Invoked by the registry on replacement and by explicit disconnect;
    /// by the time this returns the connection is no longer held here.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
        }
    }
}

/// How the shell loop ended.
enum LoopEnd {
    Closed,
    Errored(String),
}

/// State owned by the driver task.
struct Driver {
    id: SessionId,
    instance: Uuid,
    params: ConnectParams,
    state: Arc<RwLock<RemoteState>>,
    handle_slot: Arc<Mutex<Option<Arc<SshHandle>>>>,
    cancel: CancellationToken,
    connect_timeout_secs: u64,
    keepalive_interval: std::time::Duration,
    term: String,
    router: Arc<ChannelRouter>,
    registry: Arc<SessionRegistry>,
}

impl Driver {
    async fn run(self, mut cmd_rx: mpsc::Receiver<ShellCommand>) {
        let channel = tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!(session_id = %self.id, "Connection attempt cancelled");
                return;
            }
            result = self.establish() => match result {
                Ok(channel) => channel,
                Err(e) => {
                    self.fail(e).await;
                    return;
                }
            }
        };

        self.set_state(RemoteState::Active).await;

        match self.shell_loop(channel, &mut cmd_rx).await {
            LoopEnd::Closed => self.finish_closed().await,
            LoopEnd::Errored(message) => {
                self.fail(RemoteError::Channel(message)).await;
            }
        }
    }

    /// Connects, authenticates, and opens the interactive shell channel.
    async fn establish(&self) -> Result<russh::Channel<client::Msg>, RemoteError> {
        // Transport compression is never offered (the default "none" list
        // stands): some servers corrupt packet framing when it is on.
        let ssh_config = Arc::new(client::Config {
            // An idle terminal is not a dead one; only keep-alives police
            // the connection.
            inactivity_timeout: None,
            keepalive_interval: Some(self.keepalive_interval),
            // Three missed probes and the connection is declared dead.
            keepalive_max: 3,
            preferred: compat_preferred(),
            ..Default::default()
        });

        tracing::info!(
            session_id = %self.id,
            host = %self.params.host,
            port = self.params.port,
            username = %self.params.username,
            "Connecting to remote host"
        );

        let mut handle = timeout(
            std::time::Duration::from_secs(self.connect_timeout_secs),
            client::connect(
                ssh_config,
                (self.params.host.as_str(), self.params.port),
                HostAcceptor,
            ),
        )
        .await
        .map_err(|_| RemoteError::ConnectTimeout(self.connect_timeout_secs))?
        .map_err(|e| RemoteError::Connect(e.to_string()))?;

        let mut authenticated = handle
            .authenticate_password(&self.params.username, &self.params.password)
            .await
            .map_err(|e| RemoteError::Auth(e.to_string()))?;

        if !authenticated {
            authenticated = self.keyboard_interactive(&mut handle).await?;
        }
        if !authenticated {
            return Err(RemoteError::AuthRejected(self.params.username.clone()));
        }

        tracing::info!(session_id = %self.id, "Authenticated");
        self.set_state(RemoteState::Ready).await;
        self.router.publish(&self.id, Event::Ready);

        let handle = Arc::new(handle);
        *self.handle_slot.lock().await = Some(Arc::clone(&handle));

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| RemoteError::ChannelOpen(e.to_string()))?;
        channel
            .request_pty(
                true,
                &self.term,
                u32::from(DEFAULT_COLS),
                u32::from(DEFAULT_ROWS),
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| RemoteError::ChannelOpen(e.to_string()))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| RemoteError::ChannelOpen(e.to_string()))?;

        tracing::info!(session_id = %self.id, "Shell channel open");
        Ok(channel)
    }

    /// One round of keyboard-interactive authentication.
    ///
    /// Every prompt in the first request is answered with the configured
    /// password (or nothing when none is set); a second request means the
    /// server wants a conversation this adapter cannot hold, so it counts
    /// as a rejection. The adapter never blocks waiting for a human.
    async fn keyboard_interactive(&self, handle: &mut SshHandle) -> Result<bool, RemoteError> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(self.params.username.as_str(), None)
            .await
            .map_err(|e| RemoteError::Auth(e.to_string()))?;

        let mut answered = false;
        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    if answered {
                        tracing::warn!(
                            session_id = %self.id,
                            "Server requested a second interactive round; giving up"
                        );
                        return Ok(false);
                    }
                    answered = true;

                    let responses = if prompts.is_empty() || self.params.password.is_empty() {
                        Vec::new()
                    } else {
                        vec![self.params.password.clone(); prompts.len()]
                    };
                    response = handle
                        .authenticate_keyboard_interactive_respond(responses)
                        .await
                        .map_err(|e| RemoteError::Auth(e.to_string()))?;
                }
            }
        }
    }

    /// Serves commands and channel traffic until the channel ends.
    async fn shell_loop(
        &self,
        mut channel: russh::Channel<client::Msg>,
        cmd_rx: &mut mpsc::Receiver<ShellCommand>,
    ) -> LoopEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(session_id = %self.id, "Shell loop cancelled");
                    let _ = channel.eof().await;
                    return LoopEnd::Closed;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(ShellCommand::Input(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            return LoopEnd::Errored(format!(
                                "failed to write to shell channel: {e}"
                            ));
                        }
                    }
                    Some(ShellCommand::Resize { cols, rows }) => {
                        // Pixel dimensions are not tracked; zeros on the wire.
                        if let Err(e) = channel
                            .window_change(u32::from(cols), u32::from(rows), 0, 0)
                            .await
                        {
                            tracing::warn!(
                                session_id = %self.id,
                                error = %e,
                                "Window change failed"
                            );
                        }
                    }
                    Some(ShellCommand::Disconnect) | None => {
                        let _ = channel.eof().await;
                        return LoopEnd::Closed;
                    }
                },
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        self.router.publish(&self.id, Event::Output { data: data.to_vec() });
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        self.router.publish(&self.id, Event::Output { data: data.to_vec() });
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        tracing::debug!(
                            session_id = %self.id,
                            exit_status,
                            "Remote shell reported exit status"
                        );
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        tracing::info!(session_id = %self.id, "Shell channel closed by remote");
                        return LoopEnd::Closed;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    /// Terminal close path: end the connection, retire the registry entry,
    /// emit `closed` exactly once. After this no command handler for the
    /// identifier remains anywhere.
    async fn finish_closed(&self) {
        self.set_state(RemoteState::Closed).await;
        self.disconnect_underlying().await;
        self.registry.remove_if_instance(&self.id, self.instance);
        self.router.publish(&self.id, Event::Closed);
        tracing::info!(session_id = %self.id, "Remote session closed");
    }

    /// Error path: the session stays registered (stale, replace-on-connect
    /// clears it) but the connection is ended and the failure reported.
    async fn fail(&self, error: RemoteError) {
        self.set_state(RemoteState::Errored).await;
        tracing::error!(session_id = %self.id, error = %error, "Remote session failed");
        self.disconnect_underlying().await;
        self.router.publish(
            &self.id,
            Event::Error {
                message: error.to_string(),
            },
        );
    }

    async fn disconnect_underlying(&self) {
        if let Some(handle) = self.handle_slot.lock().await.take() {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
        }
    }

    async fn set_state(&self, state: RemoteState) {
        *self.state.write().await = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    use termhub_protocol::EventKind;

    fn test_params(host: &str, port: u16) -> ConnectParams {
        ConnectParams {
            host: host.to_string(),
            port,
            username: "tester".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn starts_in_connecting_state() {
        let (session, _cmd_rx) = RemoteSession::new("r1".to_string(), test_params("localhost", 22));
        assert_eq!(session.state().await, RemoteState::Connecting);
        assert!(session.connection().await.is_none());
    }

    #[tokio::test]
    async fn refused_connection_emits_error_event() {
        let config = Config::default();
        let router = Arc::new(ChannelRouter::new());
        let registry = Arc::new(SessionRegistry::new());

        let id = "refused".to_string();
        let mut error_rx = router.subscribe(&id, EventKind::Error);

        // Port 1 on loopback: nothing listens there, the kernel refuses fast.
        let (session, cmd_rx) = RemoteSession::new(id.clone(), test_params("127.0.0.1", 1));
        session.start(&config, Arc::clone(&router), Arc::clone(&registry), cmd_rx);

        let event = timeout(Duration::from_secs(10), error_rx.recv())
            .await
            .expect("no error event before timeout")
            .expect("channel ended");
        match event {
            Event::Error { message } => assert!(!message.is_empty()),
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(session.state().await, RemoteState::Errored);
    }

    #[tokio::test]
    async fn teardown_cancels_pending_connect() {
        let config = Config::default();
        let router = Arc::new(ChannelRouter::new());
        let registry = Arc::new(SessionRegistry::new());

        // A blackhole address; the connect attempt will just hang until
        // cancelled or timed out.
        let id = "cancelled".to_string();
        let (session, cmd_rx) = RemoteSession::new(id.clone(), test_params("10.255.255.1", 22));
        session.start(&config, router, registry, cmd_rx);

        session.teardown().await;
        // Driver task observed the cancellation; no command sink remains.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.send(ShellCommand::Input(b"x".to_vec())).await);
    }
}
