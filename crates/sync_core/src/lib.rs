//! Offline-first sync core: local store first, remote reconciliation second.

pub mod auth;
pub mod config;
pub mod connection;
pub mod durability;
pub mod engine;
pub mod error;
pub mod events;
pub mod ingest;
pub mod outbox;
pub mod remote;
pub mod resync;
pub mod retry;
pub mod transport;
pub mod unread;
pub mod view;
pub mod wake;

#[cfg(test)]
mod test_support;

pub use config::{load_settings, SyncSettings};
pub use engine::{LifecycleSignal, SyncEngine};
pub use error::SyncError;
pub use events::SyncEvent;
pub use remote::{Credential, CredentialProvider, LiveChannel, RemoteStore, Subscription};
pub use transport::{HttpCredentialProvider, HttpRemoteStore};
pub use wake::{StepOutcome, WakeReport};
