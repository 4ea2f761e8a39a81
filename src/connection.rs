//! One Unix-socket connection to the daemon.
//!
//! The session keeps a long-lived primary connection; every subscription
//! dials its own short-lived one. Reads happen on a cloned handle (see
//! [`Connection::try_clone_stream`]) so a reader can block while other
//! threads keep writing. Shutdown goes through a third handle outside the
//! write lock, so it still runs while a write is stuck on a full socket.
//!
//! # Lifecycle
//!
//! ```text
//! connect(path) ──► write(frame)* ──► half_close() ──► close()
//!                                       │
//!                            readers observe EOF
//! ```

use std::io::{ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{Result, RpcError};
use crate::frame::encode_frame;

/// A connected Unix stream plus a write lock.
#[derive(Debug)]
pub struct Connection {
    path: PathBuf,
    /// Guards writes so concurrent callers never interleave partial frames.
    stream: Mutex<UnixStream>,
    /// Same socket, used only for `shutdown`.
    control: UnixStream,
}

impl Connection {
    /// Connect to the daemon socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connect`] if the socket does not exist or the
    /// connection is refused.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|source| RpcError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_stream(path.to_path_buf(), stream)
    }

    /// Wrap an already-connected stream.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Io`] if the descriptor cannot be duplicated.
    pub fn from_stream(path: PathBuf, stream: UnixStream) -> Result<Self> {
        let control = stream.try_clone()?;
        Ok(Self {
            path,
            stream: Mutex::new(stream),
            control,
        })
    }

    /// Endpoint this connection was opened against.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `message`, append the delimiter and write it in one call.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Io`] if the peer is gone or the connection was
    /// half-closed.
    pub fn write<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let bytes = encode_frame(message)?;
        let mut stream = self.stream.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        stream.write_all(&bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Shut down both directions so blocked reads observe end-of-stream.
    ///
    /// Safe to call repeatedly and on a connection the peer already closed.
    /// Does not wait for the write lock; a writer blocked on a full socket
    /// fails with [`RpcError::Io`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Io`] only for unexpected OS failures.
    pub fn half_close(&self) -> Result<()> {
        match self.control.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(RpcError::Io(e)),
        }
    }

    /// Release the handle.
    pub fn close(self) {
        drop(self);
    }

    /// Clone the underlying socket for use in a reader.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Io`] if the descriptor cannot be duplicated.
    pub fn try_clone_stream(&self) -> Result<UnixStream> {
        let stream = self.stream.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(stream.try_clone()?)
    }
}
