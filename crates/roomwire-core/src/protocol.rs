//! Wire frames and event payloads.
//!
//! Every WebSocket text frame carries one JSON [`Frame`]:
//!
//! - `{"type":"event","event":"<name>","data":...,"ack":7}`: a named event;
//!   `ack` is set when the sender expects an acknowledgement
//! - `{"type":"ack","id":7,"data":...}`: the acknowledgement for request 7
//!
//! RPC results (acks of `call`/`register` and `_result.<callId>` events) use
//! the [`RpcOutcome`] shape `{"ok": value}` / `{"err": "message"}`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, RpcError};
use crate::ids::{CallId, UserId};
use crate::policy::InvokePolicy;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Event {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    Ack {
        id: u64,
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: event.into(),
            data,
            ack: None,
        }
    }

    pub fn request(event: impl Into<String>, data: Value, ack: u64) -> Self {
        Self::Event {
            event: event.into(),
            data,
            ack: Some(ack),
        }
    }

    pub fn ack(id: u64, data: Value) -> Self {
        Self::Ack { id, data }
    }

    /// Parse one inbound frame.
    ///
    /// With `compat` set, the legacy positional encoding `["event", data]`
    /// is accepted as well.
    pub fn decode(text: &str, compat: bool) -> Result<Self, ProtocolError> {
        if compat && text.trim_start().starts_with('[') {
            let parts: Vec<Value> = serde_json::from_str(text)?;
            let mut parts = parts.into_iter();
            let Some(Value::String(event)) = parts.next() else {
                return Err(ProtocolError::Unsupported(
                    "positional frame without event name".into(),
                ));
            };
            return Ok(Self::event(event, parts.next().unwrap_or(Value::Null)));
        }
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Result of one remote invocation as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Ok(Value),
    Err(String),
}

impl RpcOutcome {
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err(e) => Err(e),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<Result<Value, RpcError>> for RpcOutcome {
    fn from(result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::Err(e.to_string()),
        }
    }
}

impl From<Result<(), RpcError>> for RpcOutcome {
    fn from(result: Result<(), RpcError>) -> Self {
        match result {
            Ok(()) => Self::Ok(Value::Bool(true)),
            Err(e) => Self::Err(e.to_string()),
        }
    }
}

/// `joinSuperSocket` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    // Early clients sent the room as `name`.
    #[serde(alias = "name")]
    pub room: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "blank_as_absent"
    )]
    pub user_id: Option<UserId>,
}

fn blank_as_absent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<UserId>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|raw| UserId::parse(raw).ok()))
}

/// `<room>.publish` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, rename = "self")]
    pub include_self: bool,
}

/// `<room>.register` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(default)]
    pub invoke: InvokePolicy,
}

/// `<room>.unregister` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub name: String,
}

/// `<room>.call` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// `<room>._call` payload, sent by the broker to the callee.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub name: String,
    #[serde(default)]
    pub params: Value,
    pub call_id: CallId,
}

/// Decode an event payload, tagging failures with the event name.
pub fn parse_payload<T: serde::de::DeserializeOwned>(
    event: &str,
    data: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::invalid_payload(event, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_frame_wire_shape() {
        let frame = Frame::event("test.userEnter", json!("user_1"));
        let v: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(v["type"], "event");
        assert_eq!(v["event"], "test.userEnter");
        assert_eq!(v["data"], "user_1");
        assert!(v.get("ack").is_none());
    }

    #[test]
    fn request_frame_carries_ack() {
        let frame = Frame::request("test.call", json!({"name": "f"}), 42);
        let v: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(v["ack"], 42);
    }

    #[test]
    fn decode_ack_frame() {
        let frame = Frame::decode(r#"{"type":"ack","id":3,"data":{"ok":1}}"#, false).unwrap();
        assert_eq!(frame, Frame::ack(3, json!({"ok": 1})));
    }

    #[test]
    fn decode_event_without_data() {
        let frame = Frame::decode(r#"{"type":"event","event":"test.leave"}"#, false).unwrap();
        assert_eq!(frame, Frame::event("test.leave", Value::Null));
    }

    #[test]
    fn positional_frame_needs_compat() {
        let text = r#"["joinSuperSocket",{"room":"test"}]"#;
        assert!(Frame::decode(text, false).is_err());
        let frame = Frame::decode(text, true).unwrap();
        assert_eq!(frame, Frame::event("joinSuperSocket", json!({"room": "test"})));
    }

    #[test]
    fn positional_frame_without_name_rejected() {
        let err = Frame::decode("[1, 2]", true).unwrap_err();
        assert!(matches!(err, ProtocolError::Unsupported(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            Frame::decode("not json", false),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn outcome_shapes() {
        assert_eq!(RpcOutcome::Ok(json!(42)).to_value(), json!({"ok": 42}));
        assert_eq!(RpcOutcome::Err("nope".into()).to_value(), json!({"err": "nope"}));
        let back: RpcOutcome = serde_json::from_value(json!({"ok": null})).unwrap();
        assert_eq!(back, RpcOutcome::Ok(Value::Null));
    }

    #[test]
    fn outcome_from_rpc_error() {
        let outcome: RpcOutcome = Err::<Value, _>(RpcError::not_registered("f")).into();
        assert_eq!(outcome, RpcOutcome::Err("Function f is not registered".into()));
    }

    #[test]
    fn join_request_accepts_legacy_name() {
        let req: JoinRequest = serde_json::from_value(json!({"name": "lobby"})).unwrap();
        assert_eq!(req.room, "lobby");
        assert!(req.user_id.is_none());
    }

    #[test]
    fn join_request_with_user_id() {
        let req: JoinRequest =
            serde_json::from_value(json!({"room": "lobby", "userId": "u1"})).unwrap();
        assert_eq!(req.user_id, Some(UserId::parse("u1").unwrap()));
    }

    #[test]
    fn join_request_blank_user_id_is_absent() {
        for raw in [json!(""), json!("   "), Value::Null] {
            let req: JoinRequest =
                serde_json::from_value(json!({"room": "lobby", "userId": raw})).unwrap();
            assert!(req.user_id.is_none());
        }
    }

    #[test]
    fn publish_self_flag_defaults_false() {
        let req: PublishRequest =
            serde_json::from_value(json!({"name": "evt", "params": [1]})).unwrap();
        assert!(!req.include_self);
        let req: PublishRequest =
            serde_json::from_value(json!({"name": "evt", "self": true})).unwrap();
        assert!(req.include_self);
        assert_eq!(req.params, Value::Null);
    }

    #[test]
    fn register_defaults_to_single() {
        let req: RegisterRequest = serde_json::from_value(json!({"name": "f"})).unwrap();
        assert_eq!(req.invoke, InvokePolicy::Single);
    }

    #[test]
    fn invoke_request_uses_camel_case() {
        let req = InvokeRequest {
            name: "f".into(),
            params: json!(1),
            call_id: CallId::parse("call_1").unwrap(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["callId"], "call_1");
    }

    #[test]
    fn parse_payload_names_event() {
        let err = parse_payload::<CallRequest>("test.call", json!({"params": 1})).unwrap_err();
        assert!(err.to_string().contains("test.call"));
    }
}
