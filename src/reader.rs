//! Background reader for the primary connection.
//!
//! One OS thread (`krpc-reader`) pulls frames off the primary socket and
//! routes each one:
//!
//! ```text
//! FrameStream ──► frame.id             ──► PendingRequests::deliver
//!             └─► frame.remote_method  ──► RemoteMethods::dispatch (callback runs here)
//! ```
//!
//! A frame carrying both an id and a remote_method goes down both paths.
//! Frames are routed strictly in arrival order, which also means a callback
//! that blocks stalls every later response and push on this connection.
//!
//! The loop ends on end-of-stream (peer closed or local shutdown), on a read
//! or decode error, or at the first frame seen after the session stopped
//! running. However it ends, the thread marks itself [`ReaderState::Stopped`]
//! and closes the request registry so no caller stays blocked.

// Rust guideline compliant 2026-02

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use serde_json::Value;

use crate::actions::RemoteMethods;
use crate::codec::FrameStream;
use crate::error::Result;
use crate::frame::Frame;
use crate::registry::PendingRequests;

/// OS-visible name of the reader thread.
pub const READER_THREAD_NAME: &str = "krpc-reader";

/// Lifecycle of the reader thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Routing frames.
    Running,
    /// Exited; nothing on the primary connection is routed anymore.
    Stopped,
}

/// Shared pieces the reader routes into.
#[derive(Debug, Clone)]
pub(crate) struct Routes {
    pub(crate) pending: Arc<PendingRequests>,
    pub(crate) actions: Arc<RemoteMethods>,
    /// Cleared by the session on shutdown.
    pub(crate) running: Arc<AtomicBool>,
}

/// Owner-side handle of the reader thread.
#[derive(Debug)]
pub(crate) struct ReaderHandle {
    stopped: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReaderHandle {
    /// Start the reader on `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to create the thread.
    pub(crate) fn spawn(stream: UnixStream, routes: Routes) -> Result<Self> {
        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stopped = Arc::clone(&stopped);
        let thread = std::thread::Builder::new()
            .name(READER_THREAD_NAME.to_owned())
            .spawn(move || run(stream, &routes, &thread_stopped))?;

        Ok(Self {
            stopped,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Current state.
    pub(crate) fn state(&self) -> ReaderState {
        if self.stopped.load(Ordering::Acquire) {
            ReaderState::Stopped
        } else {
            ReaderState::Running
        }
    }

    /// Wait for the thread to exit.
    ///
    /// Does nothing if already joined, or if called from the reader thread
    /// itself (a callback shutting the session down).
    pub(crate) fn join(&self) {
        let taken = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(thread) = taken else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            log::debug!("[Reader] join requested from reader thread, not waiting");
            return;
        }
        if thread.join().is_err() {
            log::error!("[Reader] reader thread panicked");
        }
    }
}

fn run(stream: UnixStream, routes: &Routes, stopped: &AtomicBool) {
    let _stop_guard = scopeguard::guard((), |()| {
        stopped.store(true, Ordering::Release);
        let orphaned = routes.pending.close();
        if orphaned > 0 {
            log::warn!("[Reader] stopped with {orphaned} pending request(s), failing them");
        }
        log::debug!("[Reader] thread exiting");
    });

    for item in FrameStream::new(stream) {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[Reader] primary connection failed: {e}");
                return;
            }
        };
        if !routes.running.load(Ordering::Acquire) {
            log::debug!("[Reader] session stopped, discarding frame");
            return;
        }
        route(frame, routes);
    }
    log::info!("[Reader] primary connection closed");
}

/// Deliver `frame` to its waiting query and/or its push callback.
fn route(frame: Frame, routes: &Routes) {
    let push = frame
        .remote_method()
        .map(|name| (name.to_owned(), frame.params().cloned().unwrap_or(Value::Null)));

    if let Some(id) = frame.id() {
        if routes.pending.deliver(&id, frame) {
            log::debug!("[Reader] delivered response {id}");
        } else {
            log::debug!("[Reader] no pending request for id {id}, dropping");
        }
    }

    if let Some((name, params)) = push {
        if !routes.actions.dispatch(&name, params) {
            log::warn!("[Reader] push for unregistered remote method '{name}'");
        }
    }
}
