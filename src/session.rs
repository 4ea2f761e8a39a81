//! Client session: the public face of the protocol engine.
//!
//! A [`Session`] owns the primary connection, the reader thread, the pending
//! request map and the remote-method callbacks.
//!
//! # Architecture
//!
//! ```text
//!  caller threads                         krpc-reader thread
//! ┌────────────────────┐                ┌──────────────────────────┐
//! │ query / query_async│──write──┐      │ FrameStream(primary)     │
//! │ register_remote_.. │──write──┤      │   id → PendingRequests   │
//! └─────────┬──────────┘         ▼      │   remote_method → cb     │
//!           │ wait()       primary socket ◄──────────────────────────┘
//!           ▼
//!   DeferredResponse
//!
//!  subscribe() ──► new socket ──► Subscription (iterated by the caller)
//! ```
//!
//! # Failure policy
//!
//! When the reader stops for any reason (shutdown, daemon closed the socket,
//! undecodable frame) every request still waiting fails with
//! [`RpcError::Disconnected`], and so does every later query. Nothing stays
//! blocked on a connection that can no longer answer. There are no
//! timeouts: a daemon that keeps the socket open but never answers an id
//! blocks that caller.
//!
//! # Example
//!
//! ```no_run
//! use klippy_rpc::{Request, Session};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), klippy_rpc::RpcError> {
//! let session = Session::connect("/home/pi/printer_data/comms/klippy.sock")?;
//! let info = session.query(Request::new("info", json!({"client_info": {"program": "KRPC"}})))?;
//! println!("{}", info.as_value());
//! session.shutdown();
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::actions::RemoteMethods;
use crate::connection::Connection;
use crate::error::{Result, RpcError};
use crate::frame::{Frame, Request, RequestId};
use crate::reader::{ReaderHandle, ReaderState, Routes};
use crate::registry::{DeferredResponse, PendingRequests};
use crate::subscription::Subscription;

/// Prefix of generated request ids.
pub const ID_PREFIX: &str = "KRPC_";

/// Method name of the remote-method registration endpoint.
pub const REGISTER_REMOTE_METHOD: &str = "register_remote_method";

/// A connected client.
///
/// `Session` is `Send + Sync`; wrap it in an `Arc` to issue queries from
/// several threads at once. Dropping it shuts it down.
#[derive(Debug)]
pub struct Session {
    conn: Connection,
    routes: Routes,
    reader: ReaderHandle,
    next_id: AtomicU64,
}

impl Session {
    /// Connect to the daemon socket and start the reader thread.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connect`] if the socket cannot be reached.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::connect(path)?;
        let routes = Routes {
            pending: Arc::new(PendingRequests::new()),
            actions: Arc::new(RemoteMethods::new()),
            running: Arc::new(AtomicBool::new(true)),
        };
        let reader = ReaderHandle::spawn(conn.try_clone_stream()?, routes.clone())?;
        log::info!("[Session] connected to {}", path.display());

        Ok(Self {
            conn,
            routes,
            reader,
            next_id: AtomicU64::new(1),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.routes.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RpcError::Disconnected)
        }
    }

    fn next_generated_id(&self) -> RequestId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        RequestId::Str(format!("{ID_PREFIX}{n:#x}"))
    }

    /// Fill in a generated id if the request has none, and return the id.
    fn assign_id(&self, request: &mut Request) -> RequestId {
        request.id.get_or_insert_with(|| self.next_generated_id()).clone()
    }

    /// Register the request's id, generating one if it has none.
    ///
    /// A generated id that collides with a caller-chosen pending id is
    /// skipped; only caller-chosen duplicates are reported.
    fn register_pending(&self, request: &mut Request) -> Result<DeferredResponse> {
        if let Some(id) = &request.id {
            return self.routes.pending.register(id.clone());
        }
        loop {
            let id = self.next_generated_id();
            match self.routes.pending.register(id.clone()) {
                Err(RpcError::DuplicateId(taken)) => {
                    log::debug!("[Session] generated id {taken} already pending, skipping");
                }
                result => {
                    request.id = Some(id);
                    return result;
                }
            }
        }
    }

    /// Send `request` and return a handle to its future response.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Disconnected`] after shutdown or once the reader stopped.
    /// - [`RpcError::DuplicateId`] if a caller-chosen id is already pending.
    /// - [`RpcError::Io`] if the write fails.
    pub fn query_async(&self, mut request: Request) -> Result<DeferredResponse> {
        self.ensure_running()?;
        let deferred = self.register_pending(&mut request)?;
        // On failure the handle drops and takes its pending entry with it.
        self.conn.write(&request)?;
        Ok(deferred)
    }

    /// Send `request` and block until its response arrives.
    ///
    /// A response carrying `error` is returned as `Ok`; use
    /// [`Frame::into_result`] to turn it into an `Err`.
    ///
    /// # Errors
    ///
    /// Same as [`query_async`](Self::query_async), plus
    /// [`RpcError::Disconnected`] if the connection dies while waiting.
    pub fn query(&self, request: Request) -> Result<Frame> {
        self.query_async(request)?.wait()
    }

    /// Open a dedicated connection, send `request` on it, and stream the
    /// frames the daemon pushes back.
    ///
    /// Works independently of the primary connection, including after
    /// [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connect`] if the socket cannot be reached, or
    /// [`RpcError::Io`] if the request cannot be written.
    pub fn subscribe(&self, mut request: Request) -> Result<Subscription> {
        let id = self.assign_id(&mut request);
        let conn = Connection::connect(self.conn.path())?;
        Subscription::start(id, &request, conn)
    }

    /// Ask the daemon to push frames tagged `remote_method = name` and route
    /// them to `callback`.
    ///
    /// `response_template` (a JSON object, default `{}`) tells the daemon
    /// what to put in each push; its `remote_method` key is always set to
    /// `name`. Registering a name again replaces the earlier callback.
    ///
    /// `callback` runs on the reader thread and receives the push's
    /// `params` (`null` if absent). It blocks delivery of every later
    /// response and push until it returns.
    ///
    /// # Errors
    ///
    /// - [`RpcError::InvalidRequest`] if the template is not an object.
    /// - [`RpcError::Disconnected`] after shutdown.
    /// - [`RpcError::Io`] if the registration cannot be written; the callback
    ///   is not kept in that case.
    pub fn register_remote_method<F>(&self, name: &str, response_template: Option<Value>, callback: F) -> Result<()>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let mut template = match response_template {
            None => serde_json::Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(RpcError::InvalidRequest(format!(
                    "response_template must be a JSON object, got {other}"
                )))
            }
        };
        template.insert("remote_method".to_owned(), Value::String(name.to_owned()));

        let mut request = Request::new(
            REGISTER_REMOTE_METHOD,
            json!({
                "response_template": template,
                "remote_method": name,
            }),
        );
        self.assign_id(&mut request);

        // Bind first so a push racing the registration reply is not lost.
        if self.routes.actions.register(name, Arc::new(callback)) {
            log::debug!("[Session] replacing callback for remote method '{name}'");
        }
        if let Err(e) = self.conn.write(&request) {
            self.routes.actions.unregister(name);
            return Err(e);
        }
        log::debug!("[Session] registered remote method '{name}'");
        Ok(())
    }

    /// Stop routing pushes for `name` locally.
    ///
    /// The daemon is not told; pushes that still arrive are logged and
    /// dropped. Returns `true` if a callback was removed.
    pub fn unregister_remote_method(&self, name: &str) -> bool {
        self.routes.actions.unregister(name)
    }

    /// Stop the primary connection.
    ///
    /// Shuts the socket down, waits for the reader thread, then clears the
    /// pending map (failing any waiter with [`RpcError::Disconnected`]) and
    /// the callback map. Subscriptions are not affected; cancel them
    /// separately. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        if !self.routes.running.swap(false, Ordering::AcqRel) {
            return;
        }
        log::info!("[Session] shutting down {}", self.conn.path().display());
        if let Err(e) = self.conn.half_close() {
            log::debug!("[Session] shutdown of primary socket failed: {e}");
        }
        self.reader.join();
        self.routes.pending.close();
        self.routes.actions.clear();
    }

    /// Returns `true` until shutdown or until the reader stops.
    pub fn is_running(&self) -> bool {
        self.routes.running.load(Ordering::Acquire) && self.reader_state() == ReaderState::Running
    }

    /// State of the reader thread.
    pub fn reader_state(&self) -> ReaderState {
        self.reader.state()
    }

    /// Socket path the session is connected to.
    pub fn socket_path(&self) -> &Path {
        self.conn.path()
    }

    /// Number of queries waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.routes.pending.len()
    }

    /// Number of registered remote-method callbacks.
    pub fn remote_method_count(&self) -> usize {
        self.routes.actions.len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
