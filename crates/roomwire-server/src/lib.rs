//! # roomwire-server
//!
//! Room-scoped pub/sub and RPC broker over WebSocket.
//!
//! - `connection`: per-socket reader/writer tasks and the connection registry
//! - `registry`: rooms, master election, publish fan-out and the call relay
//! - `broker`: per-room function table and pending-call correlation
//! - `server`: axum router, inbound processing task and lifecycle

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod health;
pub mod registry;
pub mod room;
pub mod server;
pub mod shutdown;

pub use config::ServerConfig;
pub use error::ServerError;
pub use registry::{RegistryOptions, RoomRegistry, RoomSnapshot};
pub use server::{start, ServerHandle};
