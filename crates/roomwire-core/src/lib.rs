//! Shared vocabulary for the roomwire server and client: identifiers, invoke
//! policies, the RPC error taxonomy, wire frames and room-scoped event names.

pub mod errors;
pub mod events;
pub mod ids;
pub mod policy;
pub mod protocol;

pub use errors::{ProtocolError, RpcError};
pub use ids::{BlankId, CallId, ConnectionId, UserId};
pub use policy::InvokePolicy;
pub use protocol::{Frame, RpcOutcome};
