//! Pending request table.
//!
//! Each outbound request registers a one-shot slot under its id before the
//! frame is written. The read loop resolves slots as responses arrive, in
//! whatever order the peer sends them. A slot is removed exactly once: by
//! its response, by the caller giving up on a timeout, or by `close()`.
//! Whichever gets there first wins and the others are no-ops.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use marionette_core::error::ClientError;
use marionette_core::protocol::{Notification, RequestId, RpcError};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// What a pending slot resolves to.
pub type Outcome = Result<Value, RpcError>;

/// Notifications buffered per observer before the oldest are dropped.
const NOTIFICATION_CAPACITY: usize = 64;

pub struct Correlator {
    inner: Mutex<Inner>,
    notifications: broadcast::Sender<Notification>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<RequestId, oneshot::Sender<Outcome>>,
    closed: bool,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            notifications,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a slot for `id`.
    ///
    /// Fails with `SessionClosed` once the table has been closed.
    pub fn register(&self, id: RequestId) -> Result<oneshot::Receiver<Outcome>, ClientError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ClientError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        if inner.pending.insert(id, tx).is_some() {
            warn!("Request id {} registered twice, dropping the earlier waiter", id);
        }
        Ok(rx)
    }

    /// Complete the slot for `id`. Returns whether a waiter received it.
    ///
    /// Responses for ids that are unknown, already resolved, or already
    /// timed out are logged and discarded.
    pub fn resolve(&self, id: RequestId, outcome: Outcome) -> bool {
        let Some(tx) = self.lock().pending.remove(&id) else {
            warn!("Discarding response for unknown or expired request id {}", id);
            return false;
        };
        if tx.send(outcome).is_err() {
            debug!("Waiter for request {} left before its response arrived", id);
            return false;
        }
        true
    }

    /// Remove the slot for `id` without resolving it.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Hand an unsolicited message to observers.
    pub fn publish(&self, notification: Notification) {
        debug!("Notification from peer: {}", notification.method);
        // No receivers is fine; notifications are best-effort.
        let _ = self.notifications.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Refuse new slots and fail every pending one with `SessionClosed`.
    ///
    /// Returns how many calls were still waiting.
    pub fn close(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let abandoned = inner.pending.len();
        // Dropping the senders wakes each receiver with a RecvError.
        inner.pending.clear();
        if abandoned > 0 {
            debug!("Closed correlator with {} pending requests", abandoned);
        }
        abandoned
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}
