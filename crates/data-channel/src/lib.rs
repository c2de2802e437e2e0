//! Transports carrying the upload protocol.
//!
//! [`LocalTransport`] calls a [`Coordinator`](chunkup_coordinator::Coordinator)
//! in the same process. [`TcpTransport`] and [`CoordinatorServer`] carry the
//! same requests over TCP, one frame per request and one per response.
//!
//! # Wire format
//!
//! See [`wire`] module for the frame layout.

pub mod client;
pub mod error;
pub mod local;
pub mod server;
pub mod wire;

pub use client::TcpTransport;
pub use error::DataChannelError;
pub use local::LocalTransport;
pub use server::{CoordinatorServer, dispatch};
pub use wire::Frame;

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the server waits for the next request on an open connection.
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
