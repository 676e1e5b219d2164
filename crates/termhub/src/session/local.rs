//! Local PTY sessions.
//!
//! A local session wraps one shell process spawned in a pseudo-terminal:
//! write input, observe output, resize, and a terminal exit event. Shell
//! resolution never produces an empty command, and a failed spawn of a
//! non-fallback shell is retried exactly once with the platform fallback
//! before the failure surfaces.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use termhub_protocol::{Event, SessionId};

use crate::router::ChannelRouter;
use crate::session::registry::SessionRegistry;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Errors that can occur while spawning a local session.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The shell failed to start and no fallback applied (the attempted
    /// command already was the fallback).
    #[error("failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },

    /// Both the preferred shell and the fallback failed.
    #[error("failed to spawn {command} ({message}); fallback {fallback} also failed: {fallback_message}")]
    FallbackFailed {
        command: String,
        message: String,
        fallback: String,
        fallback_message: String,
    },
}

/// Errors that can occur on a running local session.
#[derive(Debug, Error)]
pub enum LocalSessionError {
    /// The session has already exited.
    #[error("session already exited: {0}")]
    AlreadyExited(SessionId),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
}

/// One local shell process in a pseudo-terminal.
pub struct LocalSession {
    /// Session identifier: the shell's process id where available.
    id: SessionId,

    /// Distinguishes this backend from any later one reusing the id.
    instance: Uuid,

    /// The PTY master handle, used for resizing and reader cloning.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The writer for shell input.
    writer: Mutex<Box<dyn Write + Send>>,

    /// The child process, waited on after EOF.
    child: Mutex<Box<dyn Child + Send + Sync>>,

    /// Kills the child without needing the `child` lock.
    killer: std::sync::Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Cleared on exit or teardown; gates writes and event emission.
    running: Arc<AtomicBool>,

    cols: AtomicU16,
    rows: AtomicU16,
}

impl LocalSession {
    /// Spawns a shell, retrying once with `fallback` when the preferred
    /// command fails and differs from it.
    ///
    /// Returns the session and whether the fallback was used. The retry is
    /// transparent: callers never have to reissue the command themselves.
    pub fn spawn_with_fallback(
        preferred: &str,
        fallback: &str,
        cols: u16,
        rows: u16,
        cwd: Option<String>,
        term: &str,
    ) -> Result<(Self, bool), SpawnError> {
        match Self::spawn_once(preferred, cols, rows, cwd.clone(), term) {
            Ok(session) => Ok((session, false)),
            Err(message) if preferred != fallback => {
                tracing::warn!(
                    command = %preferred,
                    error = %message,
                    fallback = %fallback,
                    "Shell spawn failed, retrying with fallback"
                );
                match Self::spawn_once(fallback, cols, rows, cwd, term) {
                    Ok(session) => Ok((session, true)),
                    Err(fallback_message) => Err(SpawnError::FallbackFailed {
                        command: preferred.to_string(),
                        message,
                        fallback: fallback.to_string(),
                        fallback_message,
                    }),
                }
            }
            Err(message) => Err(SpawnError::Spawn {
                command: preferred.to_string(),
                message,
            }),
        }
    }

    /// Performs a single spawn attempt.
    fn spawn_once(
        command: &str,
        cols: u16,
        rows: u16,
        cwd: Option<String>,
        term: &str,
    ) -> Result<Self, String> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| e.to_string())?;

        let mut cmd = CommandBuilder::new(command);
        cmd.env("TERM", term);
        match cwd {
            Some(dir) => cmd.cwd(dir),
            None => {
                if let Some(home) = dirs::home_dir() {
                    cmd.cwd(home);
                }
            }
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| e.to_string())?;
        let killer = child.clone_killer();

        let id = child
            .process_id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let writer = pair.master.take_writer().map_err(|e| e.to_string())?;

        tracing::info!(session_id = %id, command = %command, cols, rows, "Spawned local shell");

        Ok(Self {
            id,
            instance: Uuid::new_v4(),
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            killer: std::sync::Mutex::new(killer),
            running: Arc::new(AtomicBool::new(true)),
            cols: AtomicU16::new(cols),
            rows: AtomicU16::new(rows),
        })
    }

    /// Returns the session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the backend instance marker.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        (
            self.cols.load(Ordering::Relaxed),
            self.rows.load(Ordering::Relaxed),
        )
    }

    /// Returns whether the shell is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Writes input bytes to the shell.
    pub async fn write(&self, data: &[u8]) -> Result<(), LocalSessionError> {
        if !self.is_running() {
            return Err(LocalSessionError::AlreadyExited(self.id.clone()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| LocalSessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| LocalSessionError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Resizes the PTY.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), LocalSessionError> {
        if !self.is_running() {
            return Err(LocalSessionError::AlreadyExited(self.id.clone()));
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| LocalSessionError::ResizeFailed(e.to_string()))?;

        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);
        tracing::debug!(session_id = %self.id, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Starts the output read loop.
    ///
    /// Output chunks are published in production order to the router; when
    /// the shell exits naturally the loop emits the `exit` event and drops
    /// this session's registry entry. The loop must only start after the
    /// session is registered so no output precedes a known identifier.
    pub async fn start_io(
        self: Arc<Self>,
        router: Arc<ChannelRouter>,
        registry: Arc<SessionRegistry>,
    ) {
        let reader = {
            let master = self.master.lock().await;
            match master.try_clone_reader() {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::error!(session_id = %self.id, error = %e, "Failed to get PTY reader");
                    self.running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        };

        tokio::spawn(async move {
            self.read_loop(reader, router, registry).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        reader: Box<dyn Read + Send>,
        router: Arc<ChannelRouter>,
        registry: Arc<SessionRegistry>,
    ) {
        let reader = Arc::new(std::sync::Mutex::new(reader));

        loop {
            if !self.running.load(Ordering::SeqCst) {
                tracing::debug!(session_id = %self.id, "Read loop stopping: session torn down");
                return;
            }

            let reader_clone = Arc::clone(&reader);
            let result = tokio::task::spawn_blocking(move || {
                let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                let mut reader = reader_clone.lock().unwrap();
                match reader.read(&mut buffer) {
                    Ok(0) => Ok(None),
                    Ok(n) => {
                        buffer.truncate(n);
                        Ok(Some(buffer))
                    }
                    Err(e) => Err(e),
                }
            })
            .await;

            match result {
                Ok(Ok(Some(data))) => {
                    router.publish(&self.id, Event::Output { data });
                }
                Ok(Ok(None)) => {
                    tracing::info!(session_id = %self.id, "PTY EOF, shell exited");
                    break;
                }
                Ok(Err(e)) => {
                    if self.running.load(Ordering::SeqCst) {
                        tracing::error!(session_id = %self.id, error = %e, "Error reading from PTY");
                    }
                    break;
                }
                Err(e) => {
                    tracing::error!(session_id = %self.id, error = %e, "Read task panicked");
                    break;
                }
            }
        }

        // Natural exit: report the code and retire the registry entry.
        // When teardown got here first the replacement owns the id and
        // nothing may be emitted for it anymore.
        if self.running.swap(false, Ordering::SeqCst) {
            let code = {
                let mut child = self.child.lock().await;
                match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        tracing::warn!(session_id = %self.id, error = %e, "Failed to reap shell");
                        -1
                    }
                }
            };
            tracing::info!(session_id = %self.id, code, "Local session exited");

            registry.remove_if_instance(&self.id, self.instance);
            // portable-pty does not report the terminating signal, so the
            // exit event always carries `signal: None`.
            router.publish(
                &self.id,
                Event::Exit {
                    code,
                    signal: None,
                },
            );
        }
    }

    /// Kills the shell process. Safe to call more than once.
    pub fn teardown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!(session_id = %self.id, "Tearing down local session");
        }
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(e) = killer.kill() {
                tracing::debug!(session_id = %self.id, error = %e, "Kill failed (already exited?)");
            }
        }
    }
}

/// Resolves the shell command for a new local session. Never empty.
///
/// Preference order: the configured shell, then `$SHELL`, then the
/// platform default (PowerShell on Windows, zsh elsewhere).
pub fn resolve_shell(configured: &str) -> String {
    if !configured.trim().is_empty() {
        return configured.to_string();
    }

    if cfg!(windows) {
        return which::which("powershell")
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| "powershell.exe".to_string());
    }

    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.trim().is_empty() {
            return shell;
        }
    }

    which::which("zsh")
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| "/bin/zsh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_shell_prefers_configured() {
        assert_eq!(resolve_shell("/bin/bash"), "/bin/bash");
    }

    #[test]
    fn resolve_shell_never_empty() {
        assert!(!resolve_shell("").is_empty());
        assert!(!resolve_shell("   ").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_preferred_shell() {
        let (session, used_fallback) =
            LocalSession::spawn_with_fallback("/bin/sh", "/bin/sh", 80, 24, None, "xterm-256color")
                .unwrap();

        assert!(!used_fallback);
        assert!(session.is_running());
        assert_eq!(session.size(), (80, 24));
        assert!(!session.id().is_empty());

        session.teardown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_falls_back_exactly_once() {
        let (session, used_fallback) = LocalSession::spawn_with_fallback(
            "/nonexistent/shell-binary",
            "/bin/sh",
            80,
            24,
            None,
            "xterm-256color",
        )
        .unwrap();

        assert!(used_fallback);
        assert!(session.is_running());
        session.teardown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fallback_failure_is_terminal() {
        let result = LocalSession::spawn_with_fallback(
            "/nonexistent/shell-binary",
            "/nonexistent/fallback-binary",
            80,
            24,
            None,
            "xterm-256color",
        );

        assert!(matches!(result, Err(SpawnError::FallbackFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_primary_equal_to_fallback_is_not_retried() {
        let result = LocalSession::spawn_with_fallback(
            "/nonexistent/shell-binary",
            "/nonexistent/shell-binary",
            80,
            24,
            None,
            "xterm-256color",
        );

        assert!(matches!(result, Err(SpawnError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_and_resize() {
        let (session, _) =
            LocalSession::spawn_with_fallback("/bin/sh", "/bin/sh", 80, 24, None, "xterm-256color")
                .unwrap();

        session.write(b"true\n").await.unwrap();
        session.resize(120, 40).await.unwrap();
        assert_eq!(session.size(), (120, 40));

        session.teardown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_after_teardown_fails() {
        let (session, _) =
            LocalSession::spawn_with_fallback("/bin/sh", "/bin/sh", 80, 24, None, "xterm-256color")
                .unwrap();

        session.teardown();

        let result = session.write(b"true\n").await;
        assert!(matches!(result, Err(LocalSessionError::AlreadyExited(_))));
    }
}
