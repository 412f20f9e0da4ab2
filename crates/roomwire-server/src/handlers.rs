//! Per-frame dispatch from a connection into the room registry.

use std::sync::Arc;

use roomwire_core::events::{self, RoomEvent};
use roomwire_core::protocol::{
    parse_payload, CallRequest, Frame, JoinRequest, PublishRequest, RegisterRequest, RpcOutcome,
    UnregisterRequest,
};
use roomwire_core::ProtocolError;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::registry::RoomRegistry;

/// Decode and handle one inbound text frame. Malformed input is logged and
/// dropped; it never closes the connection.
pub fn handle_frame(registry: &Arc<RoomRegistry>, conn: &Arc<Connection>, text: &str, compat: bool) {
    let frame = match Frame::decode(text, compat) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn_id = %conn.id, error = %e, "dropping malformed frame");
            return;
        }
    };

    match frame {
        Frame::Event { event, data, ack } => {
            if let Err(e) = dispatch_event(registry, conn, &event, data, ack) {
                warn!(conn_id = %conn.id, event = %event, error = %e, "rejected event");
                if let Some(id) = ack {
                    conn.ack(id, RpcOutcome::Err(e.to_string()).to_value());
                }
            }
        }
        Frame::Ack { id, .. } => {
            debug!(conn_id = %conn.id, ack_id = id, "ignoring unsolicited ack");
        }
    }
}

fn dispatch_event(
    registry: &Arc<RoomRegistry>,
    conn: &Arc<Connection>,
    event: &str,
    data: Value,
    ack: Option<u64>,
) -> Result<(), ProtocolError> {
    if event == events::JOIN {
        let req: JoinRequest = parse_payload(event, data)?;
        let user_id = registry.join(&req.room, conn, req.user_id);
        if let Some(id) = ack {
            conn.ack(id, RpcOutcome::Ok(Value::String(user_id.to_string())).to_value());
        }
        return Ok(());
    }

    let rooms = conn.rooms();
    let Some((room, kind)) = events::split(event, rooms.iter().map(String::as_str)) else {
        return Err(ProtocolError::Unsupported(format!(
            "event {event} does not belong to a joined room"
        )));
    };
    debug!(conn_id = %conn.id, room = %room, event, "dispatch");

    match kind {
        RoomEvent::Publish => {
            let req: PublishRequest = parse_payload(event, data)?;
            registry.publish(&room, &conn.id, req)?;
            reply(conn, ack, RpcOutcome::Ok(Value::Bool(true)));
        }
        RoomEvent::Register => {
            let req: RegisterRequest = parse_payload(event, data)?;
            let outcome = RpcOutcome::from(registry.register(&room, &conn.id, &req.name, req.invoke));
            reply(conn, ack, outcome);
        }
        RoomEvent::Unregister => {
            let req: UnregisterRequest = parse_payload(event, data)?;
            registry.unregister(&room, &conn.id, &req.name);
            reply(conn, ack, RpcOutcome::Ok(Value::Bool(true)));
        }
        RoomEvent::Call => {
            let req: CallRequest = parse_payload(event, data)?;
            let registry = Arc::clone(registry);
            let conn = Arc::clone(conn);
            tokio::spawn(async move {
                let result = registry.call(&room, &req.name, req.params).await;
                if let Err(e) = &result {
                    debug!(room = %room, function = %req.name, error_kind = e.error_kind(), "call failed");
                }
                reply(&conn, ack, RpcOutcome::from(result));
            });
        }
        RoomEvent::Result(call_id) => {
            registry.resolve_result(&room, &conn.id, &call_id, data);
        }
        RoomEvent::Leave => {
            registry.leave(&room, &conn.id);
            reply(conn, ack, RpcOutcome::Ok(Value::Bool(true)));
        }
        RoomEvent::Other(name) => {
            // Clients reach other members only through `publish`.
            warn!(conn_id = %conn.id, room = %room, event = %name, "unknown room event ignored");
        }
    }
    Ok(())
}

fn reply(conn: &Connection, ack: Option<u64>, outcome: RpcOutcome) {
    if let Some(id) = ack {
        conn.ack(id, outcome.to_value());
    }
}
