//! Plugin event bus.
//!
//! Registry of plugin definitions plus dispatch of envelopes to enabled
//! plugins in priority order. Blocking plugins run inline on the bridge
//! task under a per-plugin timeout; non-blocking plugins are fire-and-forget
//! and deliver insights through a callback channel. Every plugin output is
//! filtered through its capability grants before it surfaces anywhere.

pub mod builtin;
pub mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use companion_protocol::{
    Envelope, Insight, InsightChannel, InsightLevel, PermissionDecision,
};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use state::PluginState;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Content transformer returned for `user.message.before_send` events.
/// The bridge folds these lowest-priority-first, so the highest-priority
/// transformer runs last over already-mutated content.
pub type MessageMutator = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Async handler invoked per matching event.
pub type PluginHandler =
    Arc<dyn Fn(Envelope, Value) -> BoxFuture<'static, Result<PluginOutput, String>> + Send + Sync>;

/// Optional config validator; returns a rejection reason on invalid input.
pub type ConfigValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    Continue,
    AbortCurrentAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    #[serde(rename = "insight:toast")]
    InsightToast,
    #[serde(rename = "insight:sound")]
    InsightSound,
    #[serde(rename = "insight:desktop")]
    InsightDesktop,
    #[serde(rename = "permission:auto-decide")]
    PermissionAutoDecide,
    #[serde(rename = "message:mutate")]
    MessageMutate,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::InsightToast => "insight:toast",
            Capability::InsightSound => "insight:sound",
            Capability::InsightDesktop => "insight:desktop",
            Capability::PermissionAutoDecide => "permission:auto-decide",
            Capability::MessageMutate => "message:mutate",
        }
    }

    fn for_channel(channel: InsightChannel) -> Self {
        match channel {
            InsightChannel::Toast => Capability::InsightToast,
            InsightChannel::Sound => Capability::InsightSound,
            InsightChannel::Desktop => Capability::InsightDesktop,
        }
    }
}

/// What a plugin handler may return.
#[derive(Default)]
pub struct PluginOutput {
    pub insights: Vec<Insight>,
    pub permission_decision: Option<PermissionDecision>,
    pub message_mutation: Option<MessageMutator>,
}

/// A registered plugin.
pub struct PluginDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    /// Event names this plugin subscribes to; `"*"` matches everything.
    pub events: Vec<&'static str>,
    /// Higher runs first.
    pub priority: i32,
    pub blocking: bool,
    pub timeout: Duration,
    pub fail_policy: FailPolicy,
    pub default_enabled: bool,
    pub default_config: Value,
    pub config_validator: Option<ConfigValidator>,
    pub capabilities: Vec<Capability>,
    pub risk: RiskLevel,
    pub handler: PluginHandler,
}

impl PluginDefinition {
    fn matches(&self, event_name: &str) -> bool {
        self.events.iter().any(|e| *e == "*" || *e == event_name)
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

const DEGRADE_AFTER_CONSECUTIVE_FAILURES: u32 = 3;
const RECOVER_AFTER_CONSECUTIVE_SUCCESSES: u32 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct PluginHealth {
    pub successes: u64,
    pub failures: u64,
    pub aborted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub status: HealthStatus,
}

impl Default for PluginHealth {
    fn default() -> Self {
        Self {
            successes: 0,
            failures: 0,
            aborted: 0,
            last_error: None,
            status: HealthStatus::Healthy,
        }
    }
}

#[derive(Default)]
struct RuntimeCell {
    health: PluginHealth,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Effective config after one-time validation of persisted input.
    resolved_config: Option<Value>,
}

impl RuntimeCell {
    fn record_success(&mut self) {
        self.health.successes += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        if self.health.status == HealthStatus::Degraded
            && self.consecutive_successes >= RECOVER_AFTER_CONSECUTIVE_SUCCESSES
        {
            self.health.status = HealthStatus::Healthy;
        }
    }

    fn record_failure(&mut self, error: String) {
        self.health.failures += 1;
        self.health.last_error = Some(error);
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= DEGRADE_AFTER_CONSECUTIVE_FAILURES {
            self.health.status = HealthStatus::Degraded;
        }
    }

    fn record_aborted(&mut self) {
        self.health.aborted += 1;
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Outcome of dispatching one envelope through the blocking chain.
#[derive(Default)]
pub struct DispatchOutcome {
    pub insights: Vec<Insight>,
    /// First permission decision only.
    pub permission_decision: Option<PermissionDecision>,
    /// `(priority, mutator)` pairs for the bridge to fold.
    pub mutations: Vec<(i32, MessageMutator)>,
    /// True when a failing plugin's policy aborted the chain.
    pub aborted: bool,
}

/// Introspection record for `list()`.
#[derive(Serialize)]
pub struct PluginInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    pub events: Vec<&'static str>,
    pub priority: i32,
    pub blocking: bool,
    pub timeout_ms: u64,
    pub fail_policy: FailPolicy,
    pub risk: RiskLevel,
    pub enabled: bool,
    pub config: Value,
    pub capabilities: HashMap<&'static str, bool>,
    pub health: PluginHealth,
}

/// Result of `dry_run` — raw handler output, ungated, counters untouched.
#[derive(Serialize)]
pub struct DryRunOutcome {
    pub insights: Vec<Insight>,
    pub permission_decision: Option<PermissionDecision>,
    pub produced_mutation: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct PluginBus {
    definitions: Vec<PluginDefinition>,
    state: PluginState,
    runtime: Mutex<HashMap<&'static str, RuntimeCell>>,
}

impl PluginBus {
    /// Build the bus. The registry is append-only after boot.
    pub fn new(definitions: Vec<PluginDefinition>, state: PluginState) -> Self {
        let runtime = definitions
            .iter()
            .map(|d| (d.id, RuntimeCell::default()))
            .collect();
        Self {
            definitions,
            state,
            runtime: Mutex::new(runtime),
        }
    }

    pub fn is_enabled(&self, def: &PluginDefinition) -> bool {
        self.state.enabled(def.id).unwrap_or(def.default_enabled)
    }

    fn is_granted(&self, def: &PluginDefinition, capability: Capability) -> bool {
        if !def.capabilities.contains(&capability) {
            return false;
        }
        self.state.grant(def.id, capability.as_str()).unwrap_or(true)
    }

    /// Effective config: validated persisted value, or the default.
    /// Invalid persisted input warns once, persists the default, and falls
    /// back to it.
    fn effective_config(&self, def: &PluginDefinition) -> Value {
        {
            let runtime = self.runtime.lock().expect("plugin runtime poisoned");
            if let Some(cell) = runtime.get(def.id) {
                if let Some(ref config) = cell.resolved_config {
                    return config.clone();
                }
            }
        }

        let resolved = match self.state.config(def.id) {
            Some(persisted) => {
                let valid = def
                    .config_validator
                    .as_ref()
                    .map(|v| v(&persisted))
                    .unwrap_or(Ok(()));
                match valid {
                    Ok(()) => persisted,
                    Err(reason) => {
                        warn!(
                            component = "plugin_bus",
                            event = "plugin_bus.config.invalid",
                            plugin_id = %def.id,
                            reason = %reason,
                            "Persisted config invalid, falling back to default"
                        );
                        self.state.set_config(def.id, def.default_config.clone());
                        def.default_config.clone()
                    }
                }
            }
            None => def.default_config.clone(),
        };

        let mut runtime = self.runtime.lock().expect("plugin runtime poisoned");
        if let Some(cell) = runtime.get_mut(def.id) {
            cell.resolved_config = Some(resolved.clone());
        }
        resolved
    }

    /// Dispatch an envelope to every matching enabled plugin.
    ///
    /// `event_name` is usually `envelope.name()`, but bridge-internal
    /// chains (e.g. `user.message.before_send`) dispatch under their own
    /// name. Blocking plugins run inline here, in non-increasing priority
    /// order (stable within a priority). Non-blocking plugins are spawned
    /// and report insights through `insight_tx`; they never contribute
    /// decisions or mutations.
    pub async fn dispatch(
        self: &Arc<Self>,
        event_name: &str,
        envelope: &Envelope,
        insight_tx: mpsc::Sender<Insight>,
    ) -> DispatchOutcome {
        let mut matching: Vec<&PluginDefinition> = self
            .definitions
            .iter()
            .filter(|d| d.matches(event_name) && self.is_enabled(d))
            .collect();
        matching.sort_by_key(|d| std::cmp::Reverse(d.priority));

        let mut outcome = DispatchOutcome::default();

        for def in matching {
            let config = self.effective_config(def);

            if !def.blocking {
                self.spawn_non_blocking(def, envelope.clone(), config, insight_tx.clone());
                continue;
            }

            let run = (def.handler)(envelope.clone(), config);
            match tokio::time::timeout(def.timeout, run).await {
                Ok(Ok(output)) => {
                    self.with_cell(def.id, |cell| cell.record_success());
                    self.gate_blocking_output(def, output, &mut outcome);
                }
                Ok(Err(error)) => {
                    if self.handle_failure(def, error, &mut outcome) {
                        break;
                    }
                }
                Err(_) => {
                    let error = format!("timed out after {} ms", def.timeout.as_millis());
                    if self.handle_failure(def, error, &mut outcome) {
                        break;
                    }
                }
            }
        }

        outcome
    }

    /// Returns true when dispatch must stop (abort policy).
    fn handle_failure(
        &self,
        def: &PluginDefinition,
        error: String,
        outcome: &mut DispatchOutcome,
    ) -> bool {
        warn!(
            component = "plugin_bus",
            event = "plugin_bus.plugin.failed",
            plugin_id = %def.id,
            error = %error,
            "Plugin invocation failed"
        );
        self.with_cell(def.id, |cell| cell.record_failure(error.clone()));
        outcome.insights.push(Insight {
            level: InsightLevel::Error,
            message: format!("Plugin {} failed: {error}", def.id),
            channel: None,
            plugin_id: Some(def.id.to_string()),
        });
        if def.fail_policy == FailPolicy::AbortCurrentAction {
            self.with_cell(def.id, |cell| cell.record_aborted());
            outcome.aborted = true;
            return true;
        }
        false
    }

    fn gate_blocking_output(
        &self,
        def: &PluginDefinition,
        output: PluginOutput,
        outcome: &mut DispatchOutcome,
    ) {
        outcome
            .insights
            .extend(self.gate_insights(def, output.insights));

        if let Some(decision) = output.permission_decision {
            if !self.is_granted(def, Capability::PermissionAutoDecide) {
                outcome.insights.push(capability_blocked(def.id, Capability::PermissionAutoDecide));
            } else if outcome.permission_decision.is_none() {
                outcome.permission_decision = Some(decision);
            }
        }

        if let Some(mutator) = output.message_mutation {
            if !self.is_granted(def, Capability::MessageMutate) {
                outcome.insights.push(capability_blocked(def.id, Capability::MessageMutate));
            } else {
                outcome.mutations.push((def.priority, mutator));
            }
        }
    }

    fn gate_insights(&self, def: &PluginDefinition, insights: Vec<Insight>) -> Vec<Insight> {
        insights
            .into_iter()
            .map(|mut insight| {
                insight.plugin_id = Some(def.id.to_string());
                match insight.channel {
                    Some(channel) if !self.is_granted(def, Capability::for_channel(channel)) => {
                        capability_blocked(def.id, Capability::for_channel(channel))
                    }
                    _ => insight,
                }
            })
            .collect()
    }

    fn spawn_non_blocking(
        self: &Arc<Self>,
        def: &PluginDefinition,
        envelope: Envelope,
        config: Value,
        insight_tx: mpsc::Sender<Insight>,
    ) {
        let bus = self.clone();
        let id = def.id;
        let timeout = def.timeout;
        let handler = def.handler.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, handler(envelope, config)).await;
            let Some(def) = bus.definitions.iter().find(|d| d.id == id) else {
                return;
            };
            match result {
                Ok(Ok(output)) => {
                    bus.with_cell(id, |cell| cell.record_success());
                    for insight in bus.gate_insights(def, output.insights) {
                        let _ = insight_tx.send(insight).await;
                    }
                    if output.permission_decision.is_some() || output.message_mutation.is_some() {
                        debug!(
                            component = "plugin_bus",
                            event = "plugin_bus.non_blocking.output_dropped",
                            plugin_id = %id,
                            "Non-blocking plugins cannot decide or mutate"
                        );
                    }
                }
                Ok(Err(error)) => {
                    bus.with_cell(id, |cell| cell.record_failure(error.clone()));
                    let _ = insight_tx
                        .send(Insight {
                            level: InsightLevel::Error,
                            message: format!("Plugin {id} failed: {error}"),
                            channel: None,
                            plugin_id: Some(id.to_string()),
                        })
                        .await;
                }
                Err(_) => {
                    let error = format!("timed out after {} ms", timeout.as_millis());
                    bus.with_cell(id, |cell| cell.record_failure(error.clone()));
                    let _ = insight_tx
                        .send(Insight {
                            level: InsightLevel::Error,
                            message: format!("Plugin {id} failed: {error}"),
                            channel: None,
                            plugin_id: Some(id.to_string()),
                        })
                        .await;
                }
            }
        });
    }

    fn with_cell<F: FnOnce(&mut RuntimeCell)>(&self, id: &str, f: F) {
        let mut runtime = self.runtime.lock().expect("plugin runtime poisoned");
        if let Some(cell) = runtime.get_mut(id) {
            f(cell);
        }
    }

    // -- Introspection & management -----------------------------------------

    pub fn list(&self) -> Vec<PluginInfo> {
        self.definitions
            .iter()
            .map(|def| {
                let health = {
                    let runtime = self.runtime.lock().expect("plugin runtime poisoned");
                    runtime
                        .get(def.id)
                        .map(|c| c.health.clone())
                        .unwrap_or_default()
                };
                PluginInfo {
                    id: def.id,
                    name: def.name,
                    version: def.version,
                    events: def.events.clone(),
                    priority: def.priority,
                    blocking: def.blocking,
                    timeout_ms: def.timeout.as_millis() as u64,
                    fail_policy: def.fail_policy,
                    risk: def.risk,
                    enabled: self.is_enabled(def),
                    config: self.effective_config(def),
                    capabilities: def
                        .capabilities
                        .iter()
                        .map(|c| (c.as_str(), self.is_granted(def, *c)))
                        .collect(),
                    health,
                }
            })
            .collect()
    }

    pub fn definition(&self, id: &str) -> Option<&PluginDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        if self.definition(id).is_none() {
            return false;
        }
        self.state.set_enabled(id, enabled);
        info!(
            component = "plugin_bus",
            event = "plugin_bus.plugin.toggled",
            plugin_id = %id,
            enabled = enabled,
            "Plugin toggled"
        );
        true
    }

    /// Validate and persist a new config. Rejects invalid input.
    pub fn set_config(&self, id: &str, config: Value) -> Result<(), String> {
        let def = self.definition(id).ok_or("unknown plugin")?;
        if let Some(ref validator) = def.config_validator {
            validator(&config)?;
        }
        self.state.set_config(id, config.clone());
        self.with_cell(id, |cell| cell.resolved_config = Some(config.clone()));
        Ok(())
    }

    pub fn set_grant(&self, id: &str, capability: &str, granted: bool) -> bool {
        let Some(def) = self.definition(id) else {
            return false;
        };
        if !def.capabilities.iter().any(|c| c.as_str() == capability) {
            return false;
        }
        self.state.set_grant(id, capability, granted);
        true
    }

    /// Execute one plugin against an event without touching health counters
    /// or capability gating — debugging only.
    pub async fn dry_run(&self, id: &str, envelope: Envelope) -> Option<DryRunOutcome> {
        let def = self.definition(id)?;
        let config = self.effective_config(def);
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(def.timeout, (def.handler)(envelope, config)).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        Some(match result {
            Ok(Ok(output)) => DryRunOutcome {
                insights: output.insights,
                permission_decision: output.permission_decision,
                produced_mutation: output.message_mutation.is_some(),
                duration_ms,
                error: None,
            },
            Ok(Err(error)) => DryRunOutcome {
                insights: vec![],
                permission_decision: None,
                produced_mutation: false,
                duration_ms,
                error: Some(error),
            },
            Err(_) => DryRunOutcome {
                insights: vec![],
                permission_decision: None,
                produced_mutation: false,
                duration_ms,
                error: Some(format!("timed out after {} ms", def.timeout.as_millis())),
            },
        })
    }

    #[cfg(test)]
    pub fn health_of(&self, id: &str) -> PluginHealth {
        let runtime = self.runtime.lock().expect("plugin runtime poisoned");
        runtime.get(id).map(|c| c.health.clone()).unwrap_or_default()
    }
}

fn capability_blocked(plugin_id: &str, capability: Capability) -> Insight {
    Insight {
        level: InsightLevel::Info,
        message: format!("Capability blocked: {}", capability.as_str()),
        channel: None,
        plugin_id: Some(plugin_id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_protocol::{EventPayload, EventSource, PermissionBehavior};
    use serde_json::json;

    fn test_envelope() -> Envelope {
        Envelope::new(
            EventSource::BackendAdapter,
            Some("s1".into()),
            EventPayload::StatusChange {
                status: "working".into(),
            },
        )
    }

    fn simple_plugin(
        id: &'static str,
        priority: i32,
        output: impl Fn() -> PluginOutput + Send + Sync + 'static,
    ) -> PluginDefinition {
        let output = Arc::new(output);
        PluginDefinition {
            id,
            name: id,
            version: "1.0.0",
            events: vec!["*"],
            priority,
            blocking: true,
            timeout: DEFAULT_TIMEOUT,
            fail_policy: FailPolicy::Continue,
            default_enabled: true,
            default_config: json!({}),
            config_validator: None,
            capabilities: vec![
                Capability::PermissionAutoDecide,
                Capability::MessageMutate,
                Capability::InsightToast,
            ],
            risk: RiskLevel::Low,
            handler: Arc::new(move |_event, _config| {
                let output = output.clone();
                Box::pin(async move { Ok(output()) })
            }),
        }
    }

    fn failing_plugin(id: &'static str, priority: i32, policy: FailPolicy) -> PluginDefinition {
        let mut def = simple_plugin(id, priority, PluginOutput::default);
        def.fail_policy = policy;
        def.handler = Arc::new(|_event, _config| Box::pin(async { Err("boom".to_string()) }));
        def
    }

    fn bus(defs: Vec<PluginDefinition>) -> Arc<PluginBus> {
        Arc::new(PluginBus::new(defs, PluginState::load()))
    }

    fn decision(behavior: PermissionBehavior) -> PluginOutput {
        PluginOutput {
            permission_decision: Some(PermissionDecision {
                request_id: "r1".into(),
                behavior,
                message: None,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_decision_wins_in_priority_order() {
        let _guard = crate::test_data_dir();
        let bus = bus(vec![
            simple_plugin("low", 10, || decision(PermissionBehavior::Deny)),
            simple_plugin("high", 90, || decision(PermissionBehavior::Allow)),
        ]);
        let (tx, _rx) = mpsc::channel(8);
        let outcome = bus.dispatch("status_change", &test_envelope(), tx).await;
        assert_eq!(
            outcome.permission_decision.unwrap().behavior,
            PermissionBehavior::Allow
        );
    }

    #[tokio::test]
    async fn abort_policy_stops_lower_priority_plugins() {
        let _guard = crate::test_data_dir();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();
        let mut late = simple_plugin("late", 1, PluginOutput::default);
        late.handler = Arc::new(move |_e, _c| {
            let ran = ran_clone.clone();
            Box::pin(async move {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(PluginOutput::default())
            })
        });

        let bus = bus(vec![
            failing_plugin("bad", 100, FailPolicy::AbortCurrentAction),
            late,
        ]);
        let (tx, _rx) = mpsc::channel(8);
        let outcome = bus.dispatch("status_change", &test_envelope(), tx).await;
        assert!(outcome.aborted);
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        // No decision made — the request stays pending for the browser.
        assert!(outcome.permission_decision.is_none());
    }

    #[tokio::test]
    async fn continue_policy_keeps_dispatching() {
        let _guard = crate::test_data_dir();
        let bus = bus(vec![
            failing_plugin("bad", 100, FailPolicy::Continue),
            simple_plugin("good", 1, || decision(PermissionBehavior::Allow)),
        ]);
        let (tx, _rx) = mpsc::channel(8);
        let outcome = bus.dispatch("status_change", &test_envelope(), tx).await;
        assert!(!outcome.aborted);
        assert!(outcome.permission_decision.is_some());
        // Failure surfaced as an error insight
        assert!(outcome
            .insights
            .iter()
            .any(|i| i.level == InsightLevel::Error));
    }

    #[tokio::test]
    async fn revoked_grant_suppresses_decision_with_blocked_insight() {
        let _guard = crate::test_data_dir();
        let state = PluginState::load();
        state.set_grant("auto", "permission:auto-decide", false);
        let bus = Arc::new(PluginBus::new(
            vec![simple_plugin("auto", 50, || {
                decision(PermissionBehavior::Allow)
            })],
            state,
        ));
        let (tx, _rx) = mpsc::channel(8);
        let outcome = bus.dispatch("status_change", &test_envelope(), tx).await;
        assert!(outcome.permission_decision.is_none());
        assert!(outcome
            .insights
            .iter()
            .any(|i| i.message.starts_with("Capability blocked")));
    }

    #[tokio::test]
    async fn channel_insight_requires_grant() {
        let _guard = crate::test_data_dir();
        let state = PluginState::load();
        state.set_grant("toasty", "insight:toast", false);
        let bus = Arc::new(PluginBus::new(
            vec![simple_plugin("toasty", 0, || PluginOutput {
                insights: vec![Insight {
                    level: InsightLevel::Info,
                    message: "done".into(),
                    channel: Some(InsightChannel::Toast),
                    plugin_id: None,
                }],
                ..Default::default()
            })],
            state,
        ));
        let (tx, _rx) = mpsc::channel(8);
        let outcome = bus.dispatch("status_change", &test_envelope(), tx).await;
        assert_eq!(outcome.insights.len(), 1);
        assert!(outcome.insights[0].message.starts_with("Capability blocked"));
    }

    #[tokio::test]
    async fn non_blocking_never_contributes_decisions() {
        let _guard = crate::test_data_dir();
        let mut def = simple_plugin("bg", 100, || decision(PermissionBehavior::Allow));
        def.blocking = false;
        let bus = bus(vec![def]);
        let (tx, mut _rx) = mpsc::channel(8);
        let outcome = bus.dispatch("status_change", &test_envelope(), tx).await;
        assert!(outcome.permission_decision.is_none());
        assert!(outcome.mutations.is_empty());
    }

    #[tokio::test]
    async fn three_consecutive_failures_degrade() {
        let _guard = crate::test_data_dir();
        let bus = bus(vec![failing_plugin("flaky", 0, FailPolicy::Continue)]);
        let (tx, _rx) = mpsc::channel(32);
        for _ in 0..3 {
            bus.dispatch("status_change", &test_envelope(), tx.clone()).await;
        }
        let health = bus.health_of("flaky");
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.failures, 3);
    }

    #[tokio::test]
    async fn sustained_success_recovers() {
        let _guard = crate::test_data_dir();
        let bus = bus(vec![simple_plugin("p", 0, PluginOutput::default)]);
        bus.with_cell("p", |cell| {
            cell.health.status = HealthStatus::Degraded;
        });
        let (tx, _rx) = mpsc::channel(8);
        for _ in 0..RECOVER_AFTER_CONSECUTIVE_SUCCESSES {
            bus.dispatch("status_change", &test_envelope(), tx.clone()).await;
        }
        assert_eq!(bus.health_of("p").status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn invalid_persisted_config_falls_back_and_persists_default() {
        let _guard = crate::test_data_dir();
        let state = PluginState::load();
        state.set_config("strict", json!({"rules": "not-a-list"}));

        let mut def = simple_plugin("strict", 0, PluginOutput::default);
        def.default_config = json!({"rules": []});
        def.config_validator = Some(Arc::new(|config| {
            if config.get("rules").map(|r| r.is_array()).unwrap_or(false) {
                Ok(())
            } else {
                Err("rules must be an array".into())
            }
        }));
        let bus = Arc::new(PluginBus::new(vec![def], state));

        let def = bus.definition("strict").unwrap();
        assert_eq!(bus.effective_config(def), json!({"rules": []}));
        // The default was persisted back
        assert_eq!(bus.state.config("strict"), Some(json!({"rules": []})));
    }

    #[tokio::test]
    async fn dry_run_does_not_touch_counters() {
        let _guard = crate::test_data_dir();
        let bus = bus(vec![simple_plugin("p", 0, PluginOutput::default)]);
        let outcome = bus.dry_run("p", test_envelope()).await.unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(bus.health_of("p").successes, 0);
    }
}
