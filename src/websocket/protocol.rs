use serde::Deserialize;
use serde_json::{json, Value};

use crate::models::EventCursor;

// ============================================================================
// Close codes
// ============================================================================

pub mod close_codes {
    /// Auth required, invalid, or expired.
    pub const AUTH_INVALID: u16 = 4001;
    /// Client mapping lost and unrecoverable after a restart.
    pub const MAPPING_LOST: u16 = 4002;
    /// No subscribe arrived within the auth window.
    pub const AUTH_TIMEOUT: u16 = 4008;
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL: u16 = 1011;
}

// ============================================================================
// Client → server frames
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Subscribe {
        token: String,
        client_id: String,
    },
    Prompt {
        content: String,
        model: Option<String>,
        reasoning_effort: Option<String>,
        attachments: Option<Value>,
        request_id: Option<String>,
    },
    Stop,
    Typing,
    FetchHistory {
        cursor: EventCursor,
        limit: Option<i64>,
    },
    Presence {
        status: String,
        #[allow(dead_code)]
        cursor: Option<Value>,
    },
}

// ============================================================================
// Server → client frames
// ============================================================================

/// Server frames are built as JSON values tagged by `type`; most payloads are
/// thin wrappers over already-serialized state.
pub mod server_frames {
    use super::*;

    pub fn pong(timestamp: i64) -> Value {
        json!({ "type": "pong", "timestamp": timestamp })
    }

    pub fn prompt_queued(message_id: &str, position: i64, request_id: Option<&str>) -> Value {
        json!({
            "type": "prompt_queued",
            "message_id": message_id,
            "position": position,
            "request_id": request_id,
        })
    }

    pub fn sandbox_event(event: &Value) -> Value {
        json!({ "type": "sandbox_event", "event": event })
    }

    pub fn processing_status(is_processing: bool) -> Value {
        json!({ "type": "processing_status", "is_processing": is_processing })
    }

    pub fn sandbox_status(status: &str) -> Value {
        json!({ "type": "sandbox_status", "status": status })
    }

    pub fn sandbox_warming() -> Value {
        json!({ "type": "sandbox_warming" })
    }

    pub fn sandbox_spawning() -> Value {
        json!({ "type": "sandbox_spawning" })
    }

    pub fn sandbox_restored(message: &str) -> Value {
        json!({ "type": "sandbox_restored", "message": message })
    }

    pub fn sandbox_error(error: &str) -> Value {
        json!({ "type": "sandbox_error", "error": error })
    }

    pub fn sandbox_warning(message: &str) -> Value {
        json!({ "type": "sandbox_warning", "message": message })
    }

    pub fn snapshot_saved(image_id: &str, reason: &str) -> Value {
        json!({ "type": "snapshot_saved", "image_id": image_id, "reason": reason })
    }

    pub fn artifact_created(artifact: &Value) -> Value {
        json!({ "type": "artifact_created", "artifact": artifact })
    }

    pub fn session_status(status: &str) -> Value {
        json!({ "type": "session_status", "status": status })
    }

    pub fn history_page(items: &Value, has_more: bool, cursor: Option<&Value>) -> Value {
        json!({
            "type": "history_page",
            "items": items,
            "has_more": has_more,
            "cursor": cursor,
        })
    }

    pub fn presence_sync(participants: &Value) -> Value {
        json!({ "type": "presence_sync", "participants": participants })
    }

    pub fn presence_update(participant_id: &str, status: &str) -> Value {
        json!({
            "type": "presence_update",
            "participant_id": participant_id,
            "status": status,
        })
    }

    pub fn presence_leave(participant_id: &str) -> Value {
        json!({ "type": "presence_leave", "participant_id": participant_id })
    }

    pub fn error(code: &str, message: &str) -> Value {
        json!({ "type": "error", "code": code, "message": message })
    }
}

// ============================================================================
// Server → sandbox commands
// ============================================================================

pub mod sandbox_commands {
    use super::*;

    #[allow(clippy::too_many_arguments)]
    pub fn prompt(
        message_id: &str,
        content: &str,
        model: &str,
        reasoning_effort: Option<&str>,
        author_name: Option<&str>,
        attachments: Option<&Value>,
    ) -> Value {
        json!({
            "type": "prompt",
            "message_id": message_id,
            "content": content,
            "model": model,
            "reasoning_effort": reasoning_effort,
            "author": author_name,
            "attachments": attachments,
        })
    }

    pub fn stop() -> Value {
        json!({ "type": "stop" })
    }

    pub fn shutdown() -> Value {
        json!({ "type": "shutdown" })
    }

    pub fn push(push_spec: &Value) -> Value {
        json!({ "type": "push", "push_spec": push_spec })
    }

    pub fn ack(ack_id: &str) -> Value {
        json!({ "type": "ack", "ack_id": ack_id })
    }

    pub fn credential_refresh(token: &str) -> Value {
        json!({ "type": "credential_refresh", "token": token })
    }
}

// ============================================================================
// Sandbox → server events
// ============================================================================

/// An event frame received from the sandbox. The full payload is kept
/// verbatim in `data`; typed fields are pulled out for routing only.
#[derive(Debug, Clone)]
pub struct SandboxEvent {
    pub event_type: String,
    pub message_id: Option<String>,
    pub ack_id: Option<String>,
    pub data: Value,
}

impl SandboxEvent {
    /// Returns `None` for frames that are not JSON objects or carry no string
    /// `type` — the caller drops those without disconnecting the sandbox.
    pub fn parse(text: &str) -> Option<Self> {
        let data: Value = serde_json::from_str(text).ok()?;
        Self::from_value(data)
    }

    pub fn from_value(data: Value) -> Option<Self> {
        let event_type = data.get("type")?.as_str()?.to_owned();
        let message_id = data
            .get("message_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let ack_id = data
            .get("ack_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        Some(Self {
            event_type,
            message_id,
            ack_id,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_by_type_tag() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"subscribe","token":"t","client_id":"c1"}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { .. }));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"fetch_history","cursor":{"timestamp":5,"id":"e1"},"limit":10}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::FetchHistory { cursor, limit } => {
                assert_eq!(cursor.timestamp, 5);
                assert_eq!(limit, Some(10));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_client_frame_is_an_error() {
        let result = serde_json::from_str::<ClientFrame>(r#"{"type":"reboot"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn sandbox_event_keeps_payload_verbatim() {
        let event = SandboxEvent::parse(
            r#"{"type":"tool_call","message_id":"m1","status":"running","name":"bash"}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "tool_call");
        assert_eq!(event.message_id.as_deref(), Some("m1"));
        assert!(event.ack_id.is_none());
        assert_eq!(event.data["name"], "bash");
    }

    #[test]
    fn sandbox_event_without_type_is_dropped() {
        assert!(SandboxEvent::parse(r#"{"message_id":"m1"}"#).is_none());
        assert!(SandboxEvent::parse("not json").is_none());
    }

    #[test]
    fn ack_command_round_trips() {
        let ack = sandbox_commands::ack("a-17");
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["ack_id"], "a-17");
    }
}
