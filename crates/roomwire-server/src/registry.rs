//! Process-wide room table: membership, master election, publish fan-out
//! and the RPC relay.
//!
//! Every mutation of a room happens while holding that room's map guard.
//! Emission never blocks (outbound queues use `try_send`), so guards are
//! never held across an await point.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use roomwire_core::events::{self, IS_MASTER, ROOM_JOINED, USER_ENTER, USER_LEAVE};
use roomwire_core::protocol::{InvokeRequest, PublishRequest, RpcOutcome};
use roomwire_core::{CallId, ConnectionId, InvokePolicy, ProtocolError, RpcError, UserId};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::broker::PendingCalls;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionRegistry};
use crate::room::{Member, Room};

#[derive(Clone, Debug)]
pub struct RegistryOptions {
    pub reclaim_empty_rooms: bool,
    pub call_timeout: Option<Duration>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            reclaim_empty_rooms: true,
            call_timeout: None,
        }
    }
}

impl From<&ServerConfig> for RegistryOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            reclaim_empty_rooms: config.reclaim_empty_rooms,
            call_timeout: config.call_timeout(),
        }
    }
}

/// Read-only view of one room.
#[derive(Clone, Debug, Serialize)]
pub struct RoomSnapshot {
    pub name: String,
    pub members: Vec<Member>,
    pub functions: Vec<String>,
}

impl RoomSnapshot {
    pub fn master(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.is_master)
    }
}

pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    connections: Arc<ConnectionRegistry>,
    pending: PendingCalls,
    options: RegistryOptions,
}

impl RoomRegistry {
    pub fn new(connections: Arc<ConnectionRegistry>, options: RegistryOptions) -> Self {
        Self {
            rooms: DashMap::new(),
            connections,
            pending: PendingCalls::new(),
            options,
        }
    }

    /// Add `conn` to `room`, creating the room if needed. Returns the user id
    /// the connection joined as.
    pub fn join(&self, room: &str, conn: &Connection, user_id: Option<UserId>) -> UserId {
        let user_id = user_id.unwrap_or_else(UserId::generate);
        {
            let mut entry = self
                .rooms
                .entry(room.to_string())
                .or_insert_with(|| Room::new(room));

            if entry.member_by_connection(&conn.id).is_some() {
                debug!(room, conn_id = %conn.id, "rejoin on same connection");
                self.remove_locked(&mut entry, &conn.id);
            }

            let stale = entry
                .member_by_user(&user_id)
                .map(|m| m.connection_id.clone());
            if let Some(stale) = stale {
                info!(room, user_id = %user_id, stale_conn = %stale, "evicting stale member");
                self.remove_locked(&mut entry, &stale);
                if let Some(stale_conn) = self.connections.get(&stale) {
                    stale_conn.leave_room(room);
                }
            }

            let is_master = entry.add_member(user_id.clone(), conn.id.clone());
            conn.join_room(room, user_id.clone());
            info!(room, user_id = %user_id, conn_id = %conn.id, is_master, "member joined");

            if is_master {
                conn.emit(&events::scoped(room, IS_MASTER), Value::Null);
            }
            let enter = events::scoped(room, USER_ENTER);
            for other in entry.others(&conn.id) {
                self.connections
                    .emit_to(&other, &enter, Value::String(user_id.to_string()));
            }
            conn.emit(
                &events::scoped(room, ROOM_JOINED),
                Value::String(user_id.to_string()),
            );
        }
        user_id
    }

    /// Remove the member on `conn_id` from `room`.
    pub fn leave(&self, room: &str, conn_id: &ConnectionId) -> Option<Member> {
        if let Some(conn) = self.connections.get(conn_id) {
            conn.leave_room(room);
        }
        let removed = {
            let mut entry = self.rooms.get_mut(room)?;
            self.remove_locked(&mut entry, conn_id)
        };
        self.reclaim(room);
        removed
    }

    /// Leave every room `conn_id` belongs to and fail calls relayed to it.
    pub fn disconnect(&self, conn_id: &ConnectionId) {
        let rooms = self
            .connections
            .get(conn_id)
            .map(|c| c.rooms())
            .unwrap_or_default();
        for room in rooms {
            self.leave(&room, conn_id);
        }
        let failed = self.pending.drop_callee(conn_id);
        if !failed.is_empty() {
            warn!(conn_id = %conn_id, calls = failed.len(), "failed calls to disconnected callee");
        }
    }

    /// Departure bookkeeping while the room guard is held: member removal,
    /// master promotion, callback cleanup and `userLeave` broadcast.
    fn remove_locked(&self, room: &mut Room, conn_id: &ConnectionId) -> Option<Member> {
        let (removed, promoted) = room.remove_member(conn_id)?;

        let functions = room.rpc.remove_owner(conn_id);
        if !functions.is_empty() {
            debug!(room = %room.name, conn_id = %conn_id, ?functions, "dropped callbacks of departing member");
        }
        self.pending.drop_callee_in(conn_id, &room.name);

        if let Some(next) = promoted {
            info!(room = %room.name, user_id = %next.user_id, "master transferred");
            self.connections.emit_to(
                &next.connection_id,
                &events::scoped(&room.name, IS_MASTER),
                Value::Null,
            );
        }

        let leave = events::scoped(&room.name, USER_LEAVE);
        for other in room.others(conn_id) {
            self.connections
                .emit_to(&other, &leave, Value::String(removed.user_id.to_string()));
        }
        info!(room = %room.name, user_id = %removed.user_id, "member left");
        Some(removed)
    }

    fn reclaim(&self, room: &str) {
        if self.options.reclaim_empty_rooms && self.rooms.remove_if(room, |_, r| r.is_empty()).is_some() {
            debug!(room, "reclaimed empty room");
        }
    }

    /// Fan `req.params` out under `<room>.<req.name>` to every other member,
    /// and to the sender too when `include_self` is set. Reserved names are
    /// refused; unknown rooms and non-members are dropped silently.
    pub fn publish(&self, room: &str, sender: &ConnectionId, req: PublishRequest) -> Result<(), ProtocolError> {
        if events::is_reserved(&req.name) {
            warn!(room, conn_id = %sender, name = %req.name, "publish of reserved event refused");
            return Err(ProtocolError::ReservedEvent(req.name));
        }
        let Some(entry) = self.rooms.get(room) else {
            warn!(room, conn_id = %sender, "publish to unknown room dropped");
            return Ok(());
        };
        if entry.member_by_connection(sender).is_none() {
            warn!(room, conn_id = %sender, "publish from non-member dropped");
            return Ok(());
        }

        let event = events::scoped(room, &req.name);
        let targets = entry.others(sender);
        debug!(room, event = %event, targets = targets.len(), include_self = req.include_self, "publish");
        for target in targets {
            self.connections.emit_to(&target, &event, req.params.clone());
        }
        if req.include_self {
            self.connections.emit_to(sender, &event, req.params);
        }
        Ok(())
    }

    pub fn register(
        &self,
        room: &str,
        owner: &ConnectionId,
        name: &str,
        policy: InvokePolicy,
    ) -> Result<(), RpcError> {
        // Only members are routed here; a vanished room reads as not registered.
        let mut entry = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| RpcError::not_registered(name))?;
        match entry.rpc.register(name, policy, owner) {
            Ok(()) => {
                info!(room, function = name, policy = %policy, conn_id = %owner, "function registered");
                Ok(())
            }
            Err(e) => {
                debug!(room, function = name, error = %e, "registration rejected");
                Err(e)
            }
        }
    }

    pub fn unregister(&self, room: &str, owner: &ConnectionId, name: &str) -> bool {
        let removed = self
            .rooms
            .get_mut(room)
            .map(|mut entry| entry.rpc.unregister(name, owner))
            .unwrap_or(false);
        if removed {
            info!(room, function = name, conn_id = %owner, "function unregistered");
        }
        removed
    }

    /// Relay a call to the callback chosen by the function's policy and wait
    /// for its `_result`.
    pub async fn call(&self, room: &str, name: &str, params: Value) -> Result<Value, RpcError> {
        let call_id = CallId::generate();
        let rx = {
            let mut entry = self
                .rooms
                .get_mut(room)
                .ok_or_else(|| RpcError::not_registered(name))?;
            let handle = entry.rpc.select(name)?;

            if !self.connections.is_open(&handle.owner) {
                warn!(room, function = name, conn_id = %handle.owner, "owner gone, removing function");
                entry.rpc.remove_entry(name);
                return Err(RpcError::not_registered(name));
            }

            let invoke = InvokeRequest {
                name: name.to_string(),
                params,
                call_id: call_id.clone(),
            };
            let payload = serde_json::to_value(&invoke)
                .map_err(|e| RpcError::Handler(e.to_string()))?;

            let rx = self
                .pending
                .insert(call_id.clone(), handle.owner.clone(), room, name);
            if !self.connections.emit_to(
                &handle.owner,
                &events::scoped(room, events::INVOKE),
                payload,
            ) {
                self.pending.cancel(&call_id);
                return Err(RpcError::CalleeDisconnected {
                    name: name.to_string(),
                });
            }
            debug!(room, function = name, call_id = %call_id, callee = %handle.owner, "call relayed");
            rx
        };

        let received = match self.options.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.cancel(&call_id);
                    warn!(room, function = name, call_id = %call_id, "call timed out");
                    return Err(RpcError::Timeout {
                        name: name.to_string(),
                    });
                }
            },
            None => rx.await,
        };

        match received {
            Ok(RpcOutcome::Ok(value)) => Ok(value),
            Ok(RpcOutcome::Err(message)) => Err(RpcError::Handler(message)),
            Err(_) => Err(RpcError::CalleeDisconnected {
                name: name.to_string(),
            }),
        }
    }

    /// Complete the pending call `call_id` with the callee's `_result` payload.
    pub fn resolve_result(&self, room: &str, sender: &ConnectionId, call_id: &CallId, data: Value) {
        let outcome = serde_json::from_value::<RpcOutcome>(data)
            .unwrap_or_else(|e| RpcOutcome::Err(format!("malformed result: {e}")));
        if !self.pending.resolve(call_id, sender, room, outcome) {
            warn!(room, call_id = %call_id, conn_id = %sender, "stray result ignored");
        }
    }

    pub fn room_snapshot(&self, room: &str) -> Option<RoomSnapshot> {
        self.rooms.get(room).map(|r| {
            let mut functions = r.rpc.names();
            functions.sort();
            RoomSnapshot {
                name: r.name.clone(),
                members: r.members().to_vec(),
                functions,
            }
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}
