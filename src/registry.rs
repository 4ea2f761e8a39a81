//! Request/response correlation.
//!
//! Each outstanding request owns a oneshot channel keyed by its id. The
//! reader thread delivers the matching response into it; the caller blocks
//! on the receiving side through a [`DeferredResponse`].
//!
//! ```text
//! query_async ──register(id)──► { id → oneshot::Sender }
//!                                     │ deliver(id, frame)   (reader thread)
//!                                     ▼
//! DeferredResponse::wait ◄── oneshot::Receiver::blocking_recv
//! ```
//!
//! The map lock only covers membership changes. Nobody blocks while holding
//! it, so a slow caller never delays unrelated requests.
//!
//! The daemon is trusted to answer each id at most once. A second response
//! for an id that was already delivered finds no entry and is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::frame::{Frame, RequestId};

#[derive(Debug)]
struct Slot {
    /// Distinguishes reuses of the same id.
    seq: u64,
    tx: oneshot::Sender<Frame>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<RequestId, Slot>,
    next_seq: u64,
    closed: bool,
}

/// Thread-safe map from request id to its single-slot handoff.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

impl PendingRequests {
    /// Create an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the handoff for `id` and return the handle that waits on it.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Disconnected`] once the registry has been closed.
    /// - [`RpcError::DuplicateId`] if `id` is already waiting.
    pub fn register(self: &Arc<Self>, id: RequestId) -> Result<DeferredResponse> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RpcError::Disconnected);
        }
        if inner.pending.contains_key(&id) {
            return Err(RpcError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.pending.insert(id.clone(), Slot { seq, tx });
        drop(inner);

        Ok(DeferredResponse {
            id,
            seq,
            rx: Some(rx),
            registry: Arc::clone(self),
        })
    }

    /// Hand `frame` to the caller waiting on `id`.
    ///
    /// Returns `false` (and drops the frame) if nobody is waiting on `id`.
    pub fn deliver(&self, id: &RequestId, frame: Frame) -> bool {
        let Some(slot) = self.lock().pending.remove(id) else {
            return false;
        };
        // Receiver gone means the handle was dropped between remove and send.
        slot.tx.send(frame).is_ok()
    }

    /// Forget `id` without delivering anything.
    ///
    /// Returns `true` if an entry was removed.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.lock().pending.remove(id).is_some()
    }

    /// Forget `id` only if it still belongs to registration `seq`.
    fn cancel_registration(&self, id: &RequestId, seq: u64) {
        let mut inner = self.lock();
        if inner.pending.get(id).is_some_and(|slot| slot.seq == seq) {
            inner.pending.remove(id);
        }
    }

    /// Refuse new registrations and wake every waiter with
    /// [`RpcError::Disconnected`].
    ///
    /// Returns the number of requests that were still pending.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.pending.drain().collect()
        };
        // Senders drop here, outside the lock.
        drained.len()
    }

    /// Returns `true` after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of requests waiting for a response.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Returns `true` if no request is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to the future response of one request.
///
/// Obtained from [`Session::query_async`](crate::Session::query_async).
/// Dropping the handle without waiting cancels the pending entry.
#[derive(Debug)]
pub struct DeferredResponse {
    id: RequestId,
    seq: u64,
    rx: Option<oneshot::Receiver<Frame>>,
    registry: Arc<PendingRequests>,
}

impl DeferredResponse {
    /// Id of the request this handle answers.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Block the calling thread until the response arrives.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Disconnected`] if the reader stopped (shutdown,
    /// peer closed, protocol error) before the response arrived.
    pub fn wait(mut self) -> Result<Frame> {
        let rx = self.rx.take().ok_or(RpcError::Disconnected)?;
        rx.blocking_recv().map_err(|_closed| RpcError::Disconnected)
    }

    /// Return the response if it has already arrived, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Disconnected`] if the response can no longer
    /// arrive, or if the response was already taken.
    pub fn try_get(&mut self) -> Result<Option<Frame>> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(RpcError::Disconnected);
        };
        match rx.try_recv() {
            Ok(frame) => {
                self.rx = None;
                Ok(Some(frame))
            }
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => {
                self.rx = None;
                Err(RpcError::Disconnected)
            }
        }
    }
}

impl Drop for DeferredResponse {
    fn drop(&mut self) {
        // An undelivered entry would otherwise linger until the daemon answers.
        // The id may already belong to a newer request if delivery is in flight.
        if let Some(mut rx) = self.rx.take() {
            if matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                self.registry.cancel_registration(&self.id, self.seq);
            }
        }
    }
}
