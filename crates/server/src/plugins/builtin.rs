//! Built-in plugins registered at boot.

use std::sync::Arc;
use std::time::Duration;

use companion_protocol::{
    EventPayload, Insight, InsightChannel, InsightLevel, PermissionBehavior, PermissionDecision,
};
use serde_json::json;

use super::{Capability, FailPolicy, PluginDefinition, PluginOutput, RiskLevel};

/// Rule-driven automatic permission decisions.
///
/// Config: `{ "rules": [{ "toolName": "Read", "action": "allow" }] }`.
/// The first rule matching the request's tool name wins.
pub fn permission_automation() -> PluginDefinition {
    PluginDefinition {
        id: "permission-automation",
        name: "Permission automation",
        version: "1.0.0",
        events: vec!["permission_request"],
        priority: 100,
        blocking: true,
        timeout: Duration::from_millis(500),
        fail_policy: FailPolicy::Continue,
        default_enabled: true,
        default_config: json!({ "rules": [] }),
        config_validator: Some(Arc::new(|config| {
            let rules = config
                .get("rules")
                .and_then(|r| r.as_array())
                .ok_or("rules must be an array")?;
            for rule in rules {
                let tool = rule.get("toolName").and_then(|t| t.as_str());
                let action = rule.get("action").and_then(|a| a.as_str());
                if tool.is_none() {
                    return Err("rule missing toolName".into());
                }
                if !matches!(action, Some("allow") | Some("deny")) {
                    return Err("rule action must be allow or deny".into());
                }
            }
            Ok(())
        })),
        capabilities: vec![Capability::PermissionAutoDecide],
        risk: RiskLevel::High,
        handler: Arc::new(|envelope, config| {
            Box::pin(async move {
                let EventPayload::PermissionRequest { ref request } = envelope.payload else {
                    return Ok(PluginOutput::default());
                };

                let rules = config
                    .get("rules")
                    .and_then(|r| r.as_array())
                    .cloned()
                    .unwrap_or_default();
                for rule in rules {
                    let tool = rule.get("toolName").and_then(|t| t.as_str());
                    if tool != Some(request.tool_name.as_str()) {
                        continue;
                    }
                    let behavior = match rule.get("action").and_then(|a| a.as_str()) {
                        Some("allow") => PermissionBehavior::Allow,
                        Some("deny") => PermissionBehavior::Deny,
                        _ => continue,
                    };
                    return Ok(PluginOutput {
                        permission_decision: Some(PermissionDecision {
                            request_id: request.request_id.clone(),
                            behavior,
                            message: Some(format!(
                                "Auto-{} by rule for {}",
                                match behavior {
                                    PermissionBehavior::Allow => "allowed",
                                    PermissionBehavior::Deny => "denied",
                                },
                                request.tool_name
                            )),
                        }),
                        ..Default::default()
                    });
                }
                Ok(PluginOutput::default())
            })
        }),
    }
}

/// Turns turn results and pending permissions into toast insights.
pub fn notifications() -> PluginDefinition {
    PluginDefinition {
        id: "notifications",
        name: "Notifications",
        version: "1.0.0",
        events: vec!["result", "permission_request"],
        priority: 0,
        blocking: false,
        timeout: Duration::from_millis(1000),
        fail_policy: FailPolicy::Continue,
        default_enabled: true,
        default_config: json!({}),
        config_validator: None,
        capabilities: vec![
            Capability::InsightToast,
            Capability::InsightSound,
            Capability::InsightDesktop,
        ],
        risk: RiskLevel::Low,
        handler: Arc::new(|envelope, _config| {
            Box::pin(async move {
                let insight = match envelope.payload {
                    EventPayload::Result { is_error, .. } => Insight {
                        level: if is_error {
                            InsightLevel::Warning
                        } else {
                            InsightLevel::Info
                        },
                        message: if is_error {
                            "Turn finished with an error".into()
                        } else {
                            "Turn complete".into()
                        },
                        channel: Some(InsightChannel::Toast),
                        plugin_id: None,
                    },
                    EventPayload::PermissionRequest { ref request } => Insight {
                        level: InsightLevel::Info,
                        message: format!("Permission requested: {}", request.tool_name),
                        channel: Some(InsightChannel::Desktop),
                        plugin_id: None,
                    },
                    _ => return Ok(PluginOutput::default()),
                };
                Ok(PluginOutput {
                    insights: vec![insight],
                    ..Default::default()
                })
            })
        }),
    }
}

/// The default registry.
pub fn all() -> Vec<PluginDefinition> {
    vec![permission_automation(), notifications()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{state::PluginState, PluginBus};
    use companion_protocol::{Envelope, EventSource, NormalizedToolInput, PermissionRequestData};
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn permission_envelope(tool: &str) -> Envelope {
        Envelope::new(
            EventSource::BackendAdapter,
            Some("s1".into()),
            EventPayload::PermissionRequest {
                request: PermissionRequestData {
                    request_id: "r1".into(),
                    tool_name: tool.into(),
                    tool_use_id: None,
                    input: Value::Null,
                    normalized_input: NormalizedToolInput::default(),
                    permission_mode: None,
                    request_hash: None,
                },
            },
        )
    }

    #[tokio::test]
    async fn rule_match_produces_allow_decision() {
        let _guard = crate::test_data_dir();
        let state = PluginState::load();
        state.set_config(
            "permission-automation",
            json!({ "rules": [{ "toolName": "Read", "action": "allow" }] }),
        );
        let bus = std::sync::Arc::new(PluginBus::new(vec![permission_automation()], state));

        let (tx, _rx) = mpsc::channel(8);
        let outcome = bus.dispatch("permission_request", &permission_envelope("Read"), tx).await;
        let decision = outcome.permission_decision.unwrap();
        assert_eq!(decision.behavior, PermissionBehavior::Allow);
        assert_eq!(decision.request_id, "r1");
    }

    #[tokio::test]
    async fn no_rule_means_no_decision() {
        let _guard = crate::test_data_dir();
        let bus = std::sync::Arc::new(PluginBus::new(
            vec![permission_automation()],
            PluginState::load(),
        ));
        let (tx, _rx) = mpsc::channel(8);
        let outcome = bus.dispatch("permission_request", &permission_envelope("Bash"), tx).await;
        assert!(outcome.permission_decision.is_none());
    }

    #[test]
    fn validator_rejects_bad_rules() {
        let def = permission_automation();
        let validator = def.config_validator.unwrap();
        assert!(validator(&json!({ "rules": [] })).is_ok());
        assert!(validator(&json!({ "rules": [{ "toolName": "X", "action": "allow" }] })).is_ok());
        assert!(validator(&json!({ "rules": "nope" })).is_err());
        assert!(validator(&json!({ "rules": [{ "action": "allow" }] })).is_err());
        assert!(validator(&json!({ "rules": [{ "toolName": "X", "action": "maybe" }] })).is_err());
    }

    #[tokio::test]
    async fn notifications_emit_through_insight_channel() {
        let _guard = crate::test_data_dir();
        let bus = std::sync::Arc::new(PluginBus::new(vec![notifications()], PluginState::load()));
        let envelope = Envelope::new(
            EventSource::BackendAdapter,
            Some("s1".into()),
            EventPayload::Result {
                subtype: Some("success".into()),
                is_error: false,
                num_turns: Some(1),
                total_cost_usd: None,
                duration_ms: None,
                usage: None,
                extra: Default::default(),
            },
        );
        let (tx, mut rx) = mpsc::channel(8);
        let outcome = bus.dispatch("result", &envelope, tx).await;
        // Non-blocking: nothing inline, insight arrives via the channel.
        assert!(outcome.insights.is_empty());
        let insight = rx.recv().await.unwrap();
        assert_eq!(insight.message, "Turn complete");
        assert_eq!(insight.channel, Some(InsightChannel::Toast));
    }
}
