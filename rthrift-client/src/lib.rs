//! # rthrift-client
//!
//! Client side of the rthrift RPC stack.
//!
//! This crate provides:
//! - A per-address connection pool with idle expiry and connection limits
//! - Request/reply invocation with sequence and method name checks
//! - Deadlines and cancellation for in-flight calls
//! - One transparent retry when a reused connection was closed by the peer

pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod pool;

pub use client::Client;
pub use config::{ClientConfig, PoolConfig};
pub use connection::PooledConnection;
pub use context::{CallContext, CancellationToken};
pub use error::ClientError;
pub use pool::{Pool, PoolStats};
