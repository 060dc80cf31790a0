//! Realtime table chat: one provider connection per identity, multiplexed
//! across the chat groups of every poker table the identity is watching.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod client;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod identity;
pub mod instances;
pub mod loopback;
pub mod message;
pub mod registry;
pub mod router;
pub mod transport;

pub use client::ChatClient;
pub use config::ChatConfig;
pub use connection::ConnectionState;
pub use error::ChatError;
pub use identity::{Identity, Signer};
pub use instances::ChatClientRegistry;
pub use message::{ChatMessage, GroupEvent};
pub use registry::Subscription;
pub use router::DispatchOutcome;
pub use shared::domain::{ConnectionEventKind, GroupId, MessageId, MessageType, WalletAddress};

/// Listener panics are caught before they unwind through any guard, so a
/// poisoned lock here means a bug elsewhere and the data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
