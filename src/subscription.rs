//! Streaming subscriptions on dedicated connections.
//!
//! Endpoints such as `adxl345/dump_adxl345` or `objects/subscribe` answer a
//! single request with an open-ended series of pushes. Each subscription
//! gets its own socket so a busy stream never delays queries on the primary
//! connection, and cancelling one never touches another.
//!
//! The caller's thread drives the stream: [`Subscription`] is an
//! [`Iterator`] that blocks between frames. Cancellation is cooperative. It
//! shuts the socket down, and the blocked read returns end-of-stream.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::FrameStream;
use crate::connection::Connection;
use crate::error::Result;
use crate::frame::{Frame, Request, RequestId};

/// Cloneable cancel switch for one subscription.
///
/// Usable from any thread, including from inside the loop consuming the
/// subscription. Cancelling twice is harmless.
#[derive(Debug, Clone)]
pub struct SubscriptionCanceller {
    conn: Arc<Connection>,
    cancelled: Arc<AtomicBool>,
}

impl SubscriptionCanceller {
    /// Stop the subscription.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.conn.half_close() {
            log::debug!("[Subscription] shutdown failed: {e}");
        }
        log::debug!("[Subscription] cancelled on {}", self.conn.path().display());
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Lazy sequence of frames pushed for one subscription request.
///
/// Ends when the daemon closes the connection or after
/// [`cancel`](Self::cancel). Dropping the subscription cancels it.
#[derive(Debug)]
pub struct Subscription {
    id: RequestId,
    frames: FrameStream<UnixStream>,
    canceller: SubscriptionCanceller,
}

impl Subscription {
    /// Send `request` on `conn` and start streaming its replies.
    ///
    /// `request.id` must already be set.
    pub(crate) fn start(id: RequestId, request: &Request, conn: Connection) -> Result<Self> {
        let reader = conn.try_clone_stream()?;
        conn.write(request)?;
        log::debug!("[Subscription] {} opened for '{}'", id, request.method);

        Ok(Self {
            id,
            frames: FrameStream::new(reader),
            canceller: SubscriptionCanceller {
                conn: Arc::new(conn),
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    /// Id of the request that opened the subscription.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Stop the subscription. Equivalent to `self.canceller().cancel()`.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// A handle that can cancel this subscription from elsewhere.
    pub fn canceller(&self) -> SubscriptionCanceller {
        self.canceller.clone()
    }

    /// Returns `true` once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.canceller.is_cancelled()
    }
}

impl Iterator for Subscription {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.canceller.is_cancelled() {
            self.frames.finish();
            return None;
        }
        let item = self.frames.next()?;
        // Cancelled while blocked: the read may have returned a buffered frame.
        if self.canceller.is_cancelled() {
            self.frames.finish();
            return None;
        }
        Some(item)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.canceller.cancel();
    }
}
