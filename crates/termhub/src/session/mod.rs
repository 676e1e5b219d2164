//! Session backends and their registry.

pub mod local;
pub mod registry;
pub mod remote;

pub use local::{LocalSession, LocalSessionError, SpawnError};
pub use registry::{Backend, SessionRegistry};
pub use remote::{ConnectParams, RemoteError, RemoteSession, RemoteState};
