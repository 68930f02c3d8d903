//! # rthrift-server
//!
//! RPC server for rthrift.
//!
//! This crate provides:
//! - TCP accept loop with a connection limit and graceful shutdown
//! - Blocking per-connection dispatch to a [`Processor`]
//! - Panic containment at the connection boundary
//! - Pooled channel buffers shared across connections
//! - YAML and environment based configuration

pub mod buffers;
pub mod config;
pub mod error;
pub mod processor;
pub mod server;

pub use buffers::BufferPool;
pub use config::{Config, ConfigError, NetworkConfig};
pub use error::ServerError;
pub use processor::{
    expect_request, reject_unknown_method, write_exception, write_reply, Processor,
};
pub use server::{Server, ServerConfig, ServerStats};
