//! Room-scoped event names.
//!
//! Everything after the join handshake is namespaced as `<room>.<suffix>`.
//! Room names may themselves contain dots, so inbound names are resolved
//! against the rooms a connection has actually joined.

use crate::ids::CallId;

/// Handshake event emitted by a client to enter a room.
pub const JOIN: &str = "joinSuperSocket";

pub const PUBLISH: &str = "publish";
pub const REGISTER: &str = "register";
pub const UNREGISTER: &str = "unregister";
pub const CALL: &str = "call";
pub const LEAVE: &str = "leave";
pub const INVOKE: &str = "_call";
pub const RESULT_PREFIX: &str = "_result.";
pub const ROOM_JOINED: &str = "roomJoined";
pub const IS_MASTER: &str = "isMaster";
pub const USER_ENTER: &str = "userEnter";
pub const USER_LEAVE: &str = "userLeave";

/// Server-to-client notifications a member must not be able to forge.
const CONTROL: [&str; 4] = [ROOM_JOINED, IS_MASTER, USER_ENTER, USER_LEAVE];

/// Whether `name` may not be used as a published event. Covers the control
/// notifications and every `_`-prefixed name (`_call`, `_result.<id>`), also
/// as a dotted tail, since `<room>.<name>` may address a dotted sub-room.
pub fn is_reserved(name: &str) -> bool {
    std::iter::once(name)
        .chain(name.match_indices('.').map(|(i, _)| &name[i + 1..]))
        .any(|tail| tail.starts_with('_') || CONTROL.contains(&tail))
}

pub fn scoped(room: &str, suffix: &str) -> String {
    format!("{room}.{suffix}")
}

pub fn result(room: &str, call_id: &CallId) -> String {
    format!("{room}.{RESULT_PREFIX}{call_id}")
}

/// A client-to-server event inside a room.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoomEvent {
    Publish,
    Register,
    Unregister,
    Call,
    Result(CallId),
    Leave,
    /// Anything else; clients reach other members only through `publish`.
    Other(String),
}

impl RoomEvent {
    pub fn from_suffix(suffix: &str) -> Self {
        match suffix {
            PUBLISH => Self::Publish,
            REGISTER => Self::Register,
            UNREGISTER => Self::Unregister,
            CALL => Self::Call,
            LEAVE => Self::Leave,
            s => match s.strip_prefix(RESULT_PREFIX).map(CallId::parse) {
                Some(Ok(call_id)) => Self::Result(call_id),
                _ => Self::Other(s.to_string()),
            },
        }
    }
}

/// Resolve `event` against the joined `rooms`, preferring the longest room
/// name that prefixes it.
pub fn split<'a, I>(event: &str, rooms: I) -> Option<(String, RoomEvent)>
where
    I: IntoIterator<Item = &'a str>,
{
    rooms
        .into_iter()
        .filter_map(|room| {
            event
                .strip_prefix(room)
                .and_then(|rest| rest.strip_prefix('.'))
                .map(|suffix| (room, suffix))
        })
        .max_by_key(|(room, _)| room.len())
        .map(|(room, suffix)| (room.to_string(), RoomEvent::from_suffix(suffix)))
}
