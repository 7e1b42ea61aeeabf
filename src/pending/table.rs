//! Pending-request table.
//!
//! Maps request ids to the waiter of the in-flight request. Every entry
//! leaves the table exactly once: through [`PendingTable::complete`],
//! [`PendingTable::expire`], [`PendingTable::cancel_all`] or
//! [`PendingTable::forget`]. All four take the same lock and remove the entry
//! before resolving it, so only the first one to run has any effect.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::ids::IdAllocator;
use crate::error::{ClientError, Result};

/// Outcome delivered to a waiting caller.
pub type Completion = Result<Bytes>;

struct Entry {
    tx: oneshot::Sender<Completion>,
    timeout: Option<Duration>,
}

struct Inner {
    ids: IdAllocator,
    entries: HashMap<u16, Entry>,
    closed: bool,
}

/// Table of requests waiting for a response.
pub struct PendingTable {
    inner: Mutex<Inner>,
}

/// Caller side of a registered request.
#[derive(Debug)]
pub struct PendingHandle {
    /// Correlation id written into the request header.
    pub id: u16,
    /// When the entry was registered.
    pub submitted_at: Instant,
    /// Deadline derived from the registration timeout.
    pub deadline: Option<Instant>,
    /// Resolved exactly once.
    pub rx: oneshot::Receiver<Completion>,
}

impl PendingTable {
    /// Create an empty, open table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ids: IdAllocator::new(),
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Allocate an id and register a waiter for it.
    pub fn register(&self, timeout: Option<Duration>) -> Result<PendingHandle> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ClientError::ConnectionClosed);
        }
        let id = inner.ids.allocate()?;
        Ok(insert(&mut inner, id, timeout))
    }

    /// Register a waiter under an explicit id.
    pub fn register_id(&self, id: u16, timeout: Option<Duration>) -> Result<PendingHandle> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ClientError::ConnectionClosed);
        }
        if !inner.ids.claim(id) {
            return Err(ClientError::DuplicateId(id));
        }
        Ok(insert(&mut inner, id, timeout))
    }

    /// Resolve the entry for `id`.
    ///
    /// Returns `false` when no such entry exists, which is the case for a
    /// response arriving after its request timed out.
    pub fn complete(&self, id: u16, result: Completion) -> bool {
        let Some(entry) = self.take(id) else {
            tracing::debug!(id, "response for unknown request id dropped");
            return false;
        };
        // The caller may have gone away in the meantime.
        let _ = entry.tx.send(result);
        true
    }

    /// Resolve the entry for `id` with a timeout, if it is still present.
    pub fn expire(&self, id: u16) -> bool {
        let Some(entry) = self.take(id) else {
            return false;
        };
        let elapsed = entry.timeout.unwrap_or_default();
        tracing::debug!(id, "request timed out after {:?}", elapsed);
        let _ = entry.tx.send(Err(ClientError::Timeout(elapsed)));
        true
    }

    /// Drop the entry for `id` if its caller has gone away.
    ///
    /// An entry whose receiver is still alive is left alone, so a stale
    /// `forget` cannot remove a newer request that reused the id.
    pub fn forget(&self, id: u16) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get(&id) {
            Some(entry) if entry.tx.is_closed() => {}
            _ => return false,
        }
        inner.entries.remove(&id);
        inner.ids.release(id);
        tracing::trace!(id, "forgot abandoned request");
        true
    }

    /// Resolve every entry with `reason` and refuse further registrations.
    ///
    /// Returns the number of requests that were cancelled.
    pub fn cancel_all(&self, reason: &ClientError) -> usize {
        let drained: Vec<Entry> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.ids.clear();
            inner.entries.drain().map(|(_, e)| e).collect()
        };

        let count = drained.len();
        if count > 0 {
            tracing::debug!(count, "cancelling pending requests: {}", reason);
        }
        for entry in drained {
            let _ = entry.tx.send(Err(reason.fan_out()));
        }
        count
    }

    /// Number of requests currently waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no request is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a request with `id` is waiting.
    pub fn contains(&self, id: u16) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Whether [`cancel_all`](Self::cancel_all) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn take(&self, id: u16) -> Option<Entry> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(&id)?;
        inner.ids.release(id);
        Some(entry)
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

fn insert(inner: &mut Inner, id: u16, timeout: Option<Duration>) -> PendingHandle {
    let (tx, rx) = oneshot::channel();
    let submitted_at = Instant::now();
    inner.entries.insert(id, Entry { tx, timeout });
    tracing::trace!(id, pending = inner.entries.len(), "registered request");
    PendingHandle {
        id,
        submitted_at,
        deadline: timeout.map(|t| submitted_at + t),
        rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_complete() {
        let table = PendingTable::new();
        let mut handle = table.register(None).unwrap();
        assert!(table.contains(handle.id));
        assert_eq!(table.len(), 1);

        assert!(table.complete(handle.id, Ok(Bytes::from_static(b"\x02"))));
        assert!(table.is_empty());

        let result = handle.rx.try_recv().unwrap().unwrap();
        assert_eq!(&result[..], b"\x02");
    }

    #[test]
    fn test_complete_unknown_id_is_noop() {
        let table = PendingTable::new();
        let _handle = table.register(None).unwrap();
        assert!(!table.complete(999, Ok(Bytes::new())));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expire_then_late_complete() {
        let table = PendingTable::new();
        let mut late = table.register(Some(Duration::from_millis(50))).unwrap();
        let mut other = table.register(None).unwrap();

        assert!(table.expire(late.id));
        assert!(!table.expire(late.id));
        assert!(matches!(
            late.rx.try_recv().unwrap(),
            Err(ClientError::Timeout(d)) if d == Duration::from_millis(50)
        ));

        // Late response is dropped; the other request is untouched.
        assert!(!table.complete(late.id, Ok(Bytes::from_static(b"late"))));
        assert!(table.contains(other.id));
        assert!(table.complete(other.id, Ok(Bytes::from_static(b"ok"))));
        assert_eq!(&other.rx.try_recv().unwrap().unwrap()[..], b"ok");
    }

    #[test]
    fn test_complete_wins_over_expire() {
        let table = PendingTable::new();
        let mut handle = table.register(Some(Duration::from_secs(1))).unwrap();

        assert!(table.complete(handle.id, Ok(Bytes::new())));
        assert!(!table.expire(handle.id));
        assert!(handle.rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_cancel_all_resolves_everything_once() {
        let table = PendingTable::new();
        let mut handles: Vec<_> = (0..5).map(|_| table.register(None).unwrap()).collect();

        assert_eq!(table.cancel_all(&ClientError::ConnectionClosed), 5);
        assert!(table.is_empty());
        assert!(table.is_closed());

        for h in handles.iter_mut() {
            assert!(matches!(
                h.rx.try_recv().unwrap(),
                Err(ClientError::ConnectionClosed)
            ));
            assert!(!table.complete(h.id, Ok(Bytes::new())));
        }

        assert!(matches!(
            table.register(None),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_register_id_duplicate() {
        let table = PendingTable::new();
        let _first = table.register_id(7, None).unwrap();
        assert!(matches!(
            table.register_id(7, None),
            Err(ClientError::DuplicateId(7))
        ));

        // allocated ids never collide with explicit ones
        let ids: Vec<u16> = (0..10).map(|_| table.register(None).unwrap().id).collect();
        assert!(!ids.contains(&7));
    }

    #[test]
    fn test_forget_frees_id() {
        let table = PendingTable::new();
        let PendingHandle { id, rx, .. } = table.register(None).unwrap();

        // caller still waiting
        assert!(!table.forget(id));
        assert!(table.contains(id));

        drop(rx);
        assert!(table.forget(id));
        assert!(!table.forget(id));
        assert!(table.is_empty());
        assert!(table.register_id(id, None).is_ok());
    }

    #[test]
    fn test_stale_forget_keeps_reused_id() {
        let table = PendingTable::new();
        let first = table.register_id(3, None).unwrap();
        table.complete(3, Ok(Bytes::new()));
        drop(first);

        let _second = table.register_id(3, None).unwrap();
        assert!(!table.forget(3));
        assert!(table.contains(3));
    }

    #[test]
    fn test_completed_id_becomes_reusable() {
        let table = PendingTable::new();
        let handle = table.register(None).unwrap();
        let id = handle.id;
        table.complete(id, Ok(Bytes::new()));
        assert!(table.register_id(id, None).is_ok());
    }

    #[test]
    fn test_deadline_from_timeout() {
        let table = PendingTable::new();
        let handle = table.register(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(
            handle.deadline,
            Some(handle.submitted_at + Duration::from_secs(2))
        );
        assert!(table.register(None).unwrap().deadline.is_none());
    }

    #[test]
    fn test_concurrent_registrations_have_unique_ids() {
        let table = Arc::new(PendingTable::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| table.register(None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u16> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .map(|h| h.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4000);
        assert_eq!(table.len(), 4000);
    }
}
