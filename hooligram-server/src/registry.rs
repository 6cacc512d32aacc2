//! Live connection registry.
//!
//! Tracks, for every connection currently attached to the server, its
//! outbound queue, the client identity cached on it and whether that
//! identity has been confirmed on this connection. The same identity may be
//! signed in on several connections at once (one per device).
//!
//! All operations lock internally. Callers never hold the lock across an
//! await point, and snapshots taken with [`Registry::signed_in`] are owned
//! copies, so writes to the outboxes happen outside the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::db::Client;

/// Opaque handle of a live connection.
pub type ConnId = u64;

/// Sending side of a connection's outbound queue. Carries encoded lines.
pub type Outbox = mpsc::Sender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    SignedIn,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    Unregistered(ConnId),
    #[error("connection {0} has no identity to sign in")]
    NoIdentity(ConnId),
}

struct Entry {
    outbox: Outbox,
    client: Option<Client>,
    auth: AuthState,
}

#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<ConnId, Entry>>,
    next_id: AtomicU64,
}

/// Scoped registration. Dropping it removes the connection from the registry.
pub struct Registration {
    id: ConnId,
    registry: Arc<Registry>,
}

impl Registration {
    pub fn id(&self) -> ConnId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// A connection carrying a confirmed identity, as seen at snapshot time.
#[derive(Clone)]
pub struct SignedIn {
    pub conn_id: ConnId,
    pub client: Client,
    pub outbox: Outbox,
}

/// Owned snapshot of every signed-in connection. Iterable any number of times.
#[derive(Clone, Default)]
pub struct SignedInSnapshot(Vec<SignedIn>);

impl SignedInSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, SignedIn> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a SignedInSnapshot {
    type Item = &'a SignedIn;
    type IntoIter = std::slice::Iter<'a, SignedIn>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new, unauthenticated connection.
    pub fn register(self: &Arc<Self>, outbox: Outbox) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.lock().insert(
            id,
            Entry {
                outbox,
                client: None,
                auth: AuthState::Unauthenticated,
            },
        );
        tracing::debug!(conn_id = id, "Connection registered");
        Registration { id, registry: self.clone() }
    }

    /// Remove a connection. Returns whether it was present.
    pub fn unregister(&self, id: ConnId) -> bool {
        let removed = self.entries.lock().remove(&id).is_some();
        if removed {
            tracing::debug!(conn_id = id, "Connection unregistered");
        }
        removed
    }

    /// Cache an identity on the connection. The connection is not signed in
    /// until [`Registry::mark_signed_in`] is called.
    pub fn set_identity(&self, id: ConnId, client: Client) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(RegistryError::Unregistered(id))?;
        entry.client = Some(client);
        entry.auth = AuthState::Unauthenticated;
        Ok(())
    }

    /// Mark the cached identity as confirmed on this connection.
    pub fn mark_signed_in(&self, id: ConnId) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(RegistryError::Unregistered(id))?;
        if entry.client.is_none() {
            return Err(RegistryError::NoIdentity(id));
        }
        entry.auth = AuthState::SignedIn;
        Ok(())
    }

    /// Cache the identity and mark it confirmed in one step.
    pub fn sign_in(&self, id: ConnId, client: Client) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(RegistryError::Unregistered(id))?;
        entry.client = Some(client);
        entry.auth = AuthState::SignedIn;
        Ok(())
    }

    pub fn identity(&self, id: ConnId) -> Result<Option<Client>, RegistryError> {
        let entries = self.entries.lock();
        let entry = entries.get(&id).ok_or(RegistryError::Unregistered(id))?;
        Ok(entry.client.clone())
    }

    pub fn auth_state(&self, id: ConnId) -> Result<AuthState, RegistryError> {
        let entries = self.entries.lock();
        let entry = entries.get(&id).ok_or(RegistryError::Unregistered(id))?;
        Ok(entry.auth)
    }

    pub fn is_signed_in(&self, id: ConnId) -> Result<bool, RegistryError> {
        Ok(self.auth_state(id)? == AuthState::SignedIn)
    }

    /// Snapshot of all connections whose identity is confirmed.
    pub fn signed_in(&self) -> SignedInSnapshot {
        let entries = self.entries.lock();
        let mut list: Vec<SignedIn> = entries
            .iter()
            .filter(|(_, e)| e.auth == AuthState::SignedIn)
            .filter_map(|(id, e)| {
                e.client.as_ref().map(|client| SignedIn {
                    conn_id: *id,
                    client: client.clone(),
                    outbox: e.outbox.clone(),
                })
            })
            .collect();
        list.sort_by_key(|s| s.conn_id);
        SignedInSnapshot(list)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn signed_in_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.auth == AuthState::SignedIn)
            .count()
    }
}
