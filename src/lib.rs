//! Klippy RPC - blocking client for the Klipper API Unix socket.
//!
//! Multiplexes concurrent queries and daemon-initiated pushes over one
//! persistent socket, and opens extra sockets on demand for streaming
//! subscriptions.
//!
//! # Architecture
//!
//! - **Session** - public API; owns the primary connection and reader thread
//! - **Reader** - background thread routing inbound frames by id or by
//!   remote-method name
//! - **Registry** - pending queries, one single-slot handoff per id
//! - **Actions** - remote-method callbacks
//! - **Subscription** - independent connection consumed by the caller's
//!   thread
//! - **Codec / Connection** - ETX-delimited JSON framing over a Unix stream
//!
//! # Modules
//!
//! - [`session`] - [`Session`] and its operations
//! - [`frame`] - wire message types
//! - [`codec`] - incremental frame decoding
//! - [`config`] - socket path resolution

pub mod actions;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod reader;
pub mod registry;
pub mod session;
pub mod subscription;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, RpcError};
pub use frame::{Frame, Request, RequestId};
pub use reader::ReaderState;
pub use registry::DeferredResponse;
pub use session::Session;
pub use subscription::{Subscription, SubscriptionCanceller};
