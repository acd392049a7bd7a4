//! Server → Browser envelopes

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::*;

/// The uniform message record crossing every fan-out boundary.
///
/// `seq` is stamped by the per-session bridge; envelopes that are
/// reconstructions rather than ring entries (e.g. `message_history`)
/// carry no `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub meta: EventMeta,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Envelope {
    pub fn new(source: EventSource, session_id: Option<String>, payload: EventPayload) -> Self {
        Self {
            seq: None,
            meta: EventMeta::new(source, session_id),
            payload,
        }
    }

    /// The event kind, matching the wire `type` tag.
    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

/// One variant per event kind. Backend dialect fields the core does not
/// interpret ride along in the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        backend_session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    SessionUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        git_branch: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ahead: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        behind: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        lines_added: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        lines_removed: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_turns: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        context_used_percent: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        containerized: Option<bool>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Assistant {
        message: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    StreamEvent {
        event: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    Result {
        #[serde(skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_turns: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    PermissionRequest {
        request: PermissionRequestData,
    },
    PermissionCancelled {
        request_id: String,
    },
    ToolProgress {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<Value>,
    },
    ToolUseSummary {
        tool_use_id: String,
        summary: String,
    },
    SystemEvent {
        subtype: String,
        #[serde(default)]
        data: Value,
    },
    StatusChange {
        status: String,
    },
    AuthStatus {
        #[serde(default)]
        authenticated: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
    },
    CliDisconnected {
        reason: String,
    },
    CliConnected {},
    SessionNameUpdate {
        name: String,
    },
    PrStatusUpdate {
        #[serde(default)]
        status: Value,
    },
    McpStatus {
        #[serde(default)]
        servers: Value,
    },
    Insight {
        insight: crate::types::Insight,
    },
    MessageHistory {
        messages: Vec<HistoryMessage>,
    },
    EventReplay {
        events: Vec<Envelope>,
    },
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::SessionInit { .. } => "session_init",
            EventPayload::SessionUpdate { .. } => "session_update",
            EventPayload::Assistant { .. } => "assistant",
            EventPayload::StreamEvent { .. } => "stream_event",
            EventPayload::Result { .. } => "result",
            EventPayload::PermissionRequest { .. } => "permission_request",
            EventPayload::PermissionCancelled { .. } => "permission_cancelled",
            EventPayload::ToolProgress { .. } => "tool_progress",
            EventPayload::ToolUseSummary { .. } => "tool_use_summary",
            EventPayload::SystemEvent { .. } => "system_event",
            EventPayload::StatusChange { .. } => "status_change",
            EventPayload::AuthStatus { .. } => "auth_status",
            EventPayload::Error { .. } => "error",
            EventPayload::CliDisconnected { .. } => "cli_disconnected",
            EventPayload::CliConnected {} => "cli_connected",
            EventPayload::SessionNameUpdate { .. } => "session_name_update",
            EventPayload::PrStatusUpdate { .. } => "pr_status_update",
            EventPayload::McpStatus { .. } => "mcp_status",
            EventPayload::Insight { .. } => "insight",
            EventPayload::MessageHistory { .. } => "message_history",
            EventPayload::EventReplay { .. } => "event_replay",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventMeta, EventSource};

    fn envelope(payload: EventPayload) -> Envelope {
        Envelope {
            seq: Some(7),
            meta: EventMeta::new(EventSource::WsBridge, Some("s1".into())),
            payload,
        }
    }

    #[test]
    fn payload_tag_matches_name() {
        let env = envelope(EventPayload::StatusChange {
            status: "compacting".into(),
        });
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "status_change");
        assert_eq!(json["seq"], 7);
        assert_eq!(env.name(), "status_change");
    }

    #[test]
    fn unknown_backend_fields_ride_in_extra() {
        let line = r#"{"type":"session_update","model":"opus","apiKeySource":"env"}"#;
        let payload: EventPayload = serde_json::from_str(line).unwrap();
        match &payload {
            EventPayload::SessionUpdate { model, extra, .. } => {
                assert_eq!(model.as_deref(), Some("opus"));
                assert_eq!(extra["apiKeySource"], "env");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn history_envelope_has_no_seq() {
        let env = Envelope::new(
            EventSource::WsBridge,
            Some("s1".into()),
            EventPayload::MessageHistory { messages: vec![] },
        );
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("seq").is_none());
    }
}
