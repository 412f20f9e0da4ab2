//! # roomwire-client
//!
//! Client side of the roomwire protocol.
//!
//! - `transport`: text-frame links (`WsTransport`, in-memory `ChannelTransport`)
//! - `client`: event client with acknowledgements and automatic reconnection
//! - `session`: one joined room with publish/subscribe, RPC and rejoin

pub mod client;
pub mod error;
pub mod reconnect;
pub mod session;
pub mod transport;

pub use client::{Client, ClientConfig, ConnectionState, ListenerId};
pub use error::ClientError;
pub use reconnect::ReconnectPolicy;
pub use session::{Registration, Session, SessionOptions, Subscription};
pub use transport::{ChannelConnector, ChannelTransport, Connector, Transport, WsConnector, WsTransport};
