//! A configuration store: the controller's single source of truth for
//! desired configuration, offering atomic snapshot reads, atomic
//! compare-and-apply writes, and a change-observer stream.
//!
//! Persisting this store to disk is out of scope here -- the
//! reference [`InMemoryStore`] is what the broadcast service and its
//! tests run against. A durable implementation is expected to satisfy
//! the same [`ConfigurationStore`] trait.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use orchd_diff::{apply, Patch};
use orchd_tree::{TreeError, Value};
use tokio::sync::broadcast;

/// Failure applying a write to the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The patch failed to apply against the current snapshot (stale
    /// base, invariant violation, or a malformed path).
    #[error("applying configuration patch: {0}")]
    Apply(#[from] TreeError),
}

/// Atomic read/write access to a single [`Value`], with change
/// notification.
pub trait ConfigurationStore: Send + Sync {
    /// The current configuration, read atomically.
    fn snapshot(&self) -> Value;

    /// Applies `patch` to the current snapshot and atomically installs
    /// the result, notifying observers. Returns the new snapshot.
    fn apply_patch(&self, patch: &Patch) -> Result<Value, StoreError>;

    /// Replaces the whole configuration atomically, notifying
    /// observers.
    fn replace(&self, value: Value) -> Value;

    /// Registers a new observer; it receives every snapshot installed
    /// from this point on, starting with the next one (not the
    /// current value -- callers that need it should call [`snapshot`]
    /// first).
    ///
    /// [`snapshot`]: ConfigurationStore::snapshot
    fn subscribe(&self) -> ChangeStream;
}

/// A stream of configuration snapshots, one per write observed since
/// [`ConfigurationStore::subscribe`] was called. A slow subscriber
/// that falls behind the broadcast channel's buffer observes a gap,
/// surfaced as [`StoreError`]-free but skipped snapshots -- it will
/// simply see the next one.
pub struct ChangeStream(broadcast::Receiver<Value>);

impl Stream for ChangeStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let fut = self.0.recv();
        futures::pin_mut!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Some(value)),
            Poll::Ready(Err(broadcast::error::RecvError::Lagged(_))) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Poll::Ready(Err(broadcast::error::RecvError::Closed)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The in-memory reference [`ConfigurationStore`]: an [`RwLock`] over
/// the current snapshot plus a broadcast channel for observers.
pub struct InMemoryStore {
    current: RwLock<Value>,
    changes: broadcast::Sender<Value>,
}

impl InMemoryStore {
    /// The channel capacity backing [`subscribe`](Self::subscribe);
    /// a subscriber more than this many writes behind loses the
    /// intervening snapshots rather than the connection.
    const CHANGE_BUFFER: usize = 64;

    /// Creates a store seeded with `initial`.
    pub fn new(initial: Value) -> Self {
        let (changes, _) = broadcast::channel(Self::CHANGE_BUFFER);
        Self {
            current: RwLock::new(initial),
            changes,
        }
    }

    fn install(&self, value: Value) -> Value {
        *self.current.write().unwrap() = value.clone();
        let _ = self.changes.send(value.clone());
        value
    }
}

impl ConfigurationStore for InMemoryStore {
    fn snapshot(&self) -> Value {
        self.current.read().unwrap().clone()
    }

    fn apply_patch(&self, patch: &Patch) -> Result<Value, StoreError> {
        let current = self.snapshot();
        let next = apply(&current, patch)?;
        Ok(self.install(next))
    }

    fn replace(&self, value: Value) -> Value {
        self.install(value)
    }

    fn subscribe(&self) -> ChangeStream {
        ChangeStream(self.changes.subscribe())
    }
}

/// A shared handle to a [`ConfigurationStore`], the shape callers
/// actually hold (the broadcast service fans a single store out to
/// many connection tasks).
pub type SharedStore = Arc<dyn ConfigurationStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use orchd_diff::diff;
    use orchd_tree::Value;

    #[test]
    fn snapshot_reflects_latest_replace() {
        let store = InMemoryStore::new(Value::leaf(1i64));
        store.replace(Value::leaf(2i64));
        assert_eq!(store.snapshot(), Value::leaf(2i64));
    }

    #[test]
    fn apply_patch_advances_and_rejects_stale_base() {
        let store = InMemoryStore::new(Value::record(vec![("a", Value::leaf(1i64))]));
        let patch = diff(
            &store.snapshot(),
            &Value::record(vec![("a", Value::leaf(2i64))]),
        );
        let updated = store.apply_patch(&patch).unwrap();
        assert_eq!(updated, Value::record(vec![("a", Value::leaf(2i64))]));
    }

    #[tokio::test]
    async fn subscribers_observe_writes_made_after_subscribing() {
        let store = InMemoryStore::new(Value::leaf(0i64));
        let mut changes = store.subscribe();
        store.replace(Value::leaf(1i64));
        assert_eq!(changes.next().await, Some(Value::leaf(1i64)));
    }
}
