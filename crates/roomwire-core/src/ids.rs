//! Identifiers that cross the wire (`UserId`, `CallId`) and the server-local
//! connection handle (`ConnectionId`).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} id must not be blank")]
pub struct BlankId(&'static str);

fn non_blank(kind: &'static str, raw: String) -> Result<String, BlankId> {
    if raw.trim().is_empty() {
        Err(BlankId(kind))
    } else {
        Ok(raw)
    }
}

/// A member's identity within a room. Supplied by the client on join so it
/// can survive reconnects, otherwise minted by the server.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn generate() -> Self {
        Self(format!("user_{}", Uuid::now_v7()))
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self, BlankId> {
        non_blank("user", raw.into()).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = BlankId;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlates one relayed call with its `_result.<callId>` event. Minted by
/// the server; time-ordered and unique across all rooms.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(format!("call_{}", Uuid::now_v7()))
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self, BlankId> {
        non_blank("call", raw.into()).map(Self)
    }
}

impl TryFrom<String> for CallId {
    type Error = BlankId;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<CallId> for String {
    fn from(id: CallId) -> Self {
        id.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Server-local handle for one WebSocket. Never sent to clients as an
/// address; only shown in logs and room snapshots.
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
