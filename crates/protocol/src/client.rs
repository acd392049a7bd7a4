//! Browser → Server frames

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::PermissionBehavior;

/// Typed JSON frames sent by browser clients over the per-session WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserCommand {
    // Subscription protocol
    SessionSubscribe {
        last_seq: u64,
    },
    SessionAck {
        last_seq: u64,
    },

    // Outbound commands (idempotent via client_msg_id)
    UserMessage {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    Interrupt {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    SetModel {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    SetPermissionMode {
        mode: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpGetStatus {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpToggle {
        server_name: String,
        enabled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpReconnect {
        server_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpSetServers {
        servers: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
}

impl BrowserCommand {
    /// The `client_msg_id` carried by idempotent command frames, if any.
    pub fn client_msg_id(&self) -> Option<&str> {
        match self {
            BrowserCommand::SessionSubscribe { .. } | BrowserCommand::SessionAck { .. } => None,
            BrowserCommand::UserMessage { client_msg_id, .. }
            | BrowserCommand::PermissionResponse { client_msg_id, .. }
            | BrowserCommand::Interrupt { client_msg_id }
            | BrowserCommand::SetModel { client_msg_id, .. }
            | BrowserCommand::SetPermissionMode { client_msg_id, .. }
            | BrowserCommand::McpGetStatus { client_msg_id }
            | BrowserCommand::McpToggle { client_msg_id, .. }
            | BrowserCommand::McpReconnect { client_msg_id, .. }
            | BrowserCommand::McpSetServers { client_msg_id, .. } => client_msg_id.as_deref(),
        }
    }

    /// True for command frames covered by the outbound dedup window.
    pub fn is_idempotent_command(&self) -> bool {
        !matches!(
            self,
            BrowserCommand::SessionSubscribe { .. } | BrowserCommand::SessionAck { .. }
        )
    }

    /// Stamp a `client_msg_id` if the frame is an idempotent command and
    /// the client omitted one.
    pub fn ensure_client_msg_id(&mut self) {
        let slot = match self {
            BrowserCommand::SessionSubscribe { .. } | BrowserCommand::SessionAck { .. } => return,
            BrowserCommand::UserMessage { client_msg_id, .. }
            | BrowserCommand::PermissionResponse { client_msg_id, .. }
            | BrowserCommand::Interrupt { client_msg_id }
            | BrowserCommand::SetModel { client_msg_id, .. }
            | BrowserCommand::SetPermissionMode { client_msg_id, .. }
            | BrowserCommand::McpGetStatus { client_msg_id }
            | BrowserCommand::McpToggle { client_msg_id, .. }
            | BrowserCommand::McpReconnect { client_msg_id, .. }
            | BrowserCommand::McpSetServers { client_msg_id, .. } => client_msg_id,
        };
        if slot.is_none() {
            *slot = Some(crate::new_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_round_trips() {
        let frame = r#"{"type":"session_subscribe","last_seq":42}"#;
        let cmd: BrowserCommand = serde_json::from_str(frame).unwrap();
        assert!(matches!(cmd, BrowserCommand::SessionSubscribe { last_seq: 42 }));
        assert!(!cmd.is_idempotent_command());
    }

    #[test]
    fn ensure_id_stamps_only_when_missing() {
        let mut cmd = BrowserCommand::Interrupt {
            client_msg_id: None,
        };
        cmd.ensure_client_msg_id();
        let stamped = cmd.client_msg_id().unwrap().to_string();

        cmd.ensure_client_msg_id();
        assert_eq!(cmd.client_msg_id(), Some(stamped.as_str()));
    }

    #[test]
    fn subscribe_is_never_stamped() {
        let mut cmd = BrowserCommand::SessionAck { last_seq: 3 };
        cmd.ensure_client_msg_id();
        assert!(cmd.client_msg_id().is_none());
    }
}
