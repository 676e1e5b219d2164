//! # Termhub
//!
//! Session backend orchestrator for a multi-session terminal UI: any
//! number of local PTY shells and remote SSH shells behind one
//! identifier-keyed command and event surface.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Orchestrator Facade                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌──────────────┐   ┌──────────────┐   ┌────────────────┐  │
//! │  │    Local     │   │    Remote    │   │  File Sub-     │  │
//! │  │ PTY Sessions │   │ SSH Sessions │   │  channel Ops   │  │
//! │  └──────────────┘   └──────────────┘   └────────────────┘  │
//! │                                                             │
//! │  ┌───────────────────────┐  ┌───────────────────────────┐  │
//! │  │    Session Registry   │  │      Channel Router       │  │
//! │  └───────────────────────┘  └───────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Consumers issue [`termhub_protocol::Command`]s tagged with a session
//! identifier; the facade resolves the backend through the registry,
//! adapters perform the work on their own tasks, and results flow back as
//! [`termhub_protocol::Event`]s routed per (identifier, kind) channel.
//! Errors never escape a session: an adapter failure becomes an event for
//! that identifier and nothing else.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use termhub::{Config, Orchestrator};
//! use termhub_protocol::{Command, EventKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::new(Config::load_or_default()?);
//!
//!     let id = orchestrator.create_local(80, 24).await?;
//!     let mut output = orchestrator.subscribe(&id, EventKind::Output);
//!
//!     orchestrator
//!         .handle(Command::LocalInput {
//!             id: id.clone(),
//!             data: b"uptime\n".to_vec(),
//!         })
//!         .await;
//!
//!     while let Some(event) = output.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration loading and validation
//! - [`session`]: local PTY and remote SSH backends plus their registry
//! - [`files`]: SFTP sub-channel listing and upload
//! - [`router`]: per-session event routing
//! - [`orchestrator`]: the command dispatch facade

pub mod config;
pub mod files;
pub mod orchestrator;
pub mod router;
pub mod session;

// Re-export the wire contract for convenience
pub use termhub_protocol as protocol;

// Re-export the main types for convenience
pub use config::{Config, ConfigError};
pub use files::FileOpError;
pub use orchestrator::Orchestrator;
pub use router::ChannelRouter;
pub use session::{
    Backend, ConnectParams, LocalSession, LocalSessionError, RemoteError, RemoteSession,
    RemoteState, SessionRegistry, SpawnError,
};
