//! Connection lifecycle: state machine and capability tracking.
//!
//! ```text
//! NotStarted -> Starting -> AwaitingHandshake -> Ready -> ShuttingDown -> Stopped
//!                  \               \                                  /
//!                   `---------------`------------ (stream died) -----'
//! ```
//!
//! `Ready` is reached only when the initialize response has arrived and every
//! required capability and readiness notification was observed, in whichever
//! order they happen.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{Notify, watch};

use crate::types::{HandshakeConfig, RequiredNotification};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    AwaitingHandshake,
    Ready,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::{AwaitingHandshake, NotStarted, Ready, ShuttingDown, Starting, Stopped};
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped)
            | (NotStarted, Starting)
            | (Starting, AwaitingHandshake)
            | (AwaitingHandshake, Ready)
            | (Starting | AwaitingHandshake | Ready, ShuttingDown) => true,
            _ => false,
        }
    }

    /// Whether the transport write path may be used in this state.
    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::AwaitingHandshake | Self::Ready | Self::ShuttingDown
        )
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::AwaitingHandshake => "awaiting handshake",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Current lifecycle state, observable by any number of watchers.
pub(crate) struct StateMachine {
    tx: watch::Sender<LifecycleState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::NotStarted);
        Self { tx }
    }

    pub fn current(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the transition is legal.
    pub fn advance(&self, next: LifecycleState) -> Result<(), InvalidTransition> {
        let mut from = LifecycleState::NotStarted;
        let moved = self.tx.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!(from = %from, to = %next, "lifecycle transition");
            Ok(())
        } else {
            Err(InvalidTransition { from, to: next })
        }
    }

    /// Move to `Stopped`. Returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        self.advance(LifecycleState::Stopped).is_ok()
    }
}

/// Static capability key advertised in the initialize result for a method.
fn static_provider(method: &str) -> Option<&'static str> {
    Some(match method {
        "textDocument/completion" | "completionItem/resolve" => "completionProvider",
        "textDocument/signatureHelp" => "signatureHelpProvider",
        "textDocument/definition" => "definitionProvider",
        "textDocument/implementation" => "implementationProvider",
        "textDocument/references" => "referencesProvider",
        "textDocument/hover" => "hoverProvider",
        "textDocument/codeAction" | "codeAction/resolve" => "codeActionProvider",
        "textDocument/diagnostic" => "diagnosticProvider",
        "workspace/executeCommand" => "executeCommandProvider",
        _ => return None,
    })
}

fn provider_present(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null | Value::Bool(false)))
}

#[derive(Default)]
struct Observed {
    initialized: bool,
    methods: HashSet<String>,
    commands: HashSet<String>,
    /// Registration id -> method, for `client/unregisterCapability`.
    registrations: HashMap<String, String>,
    /// Indices into `required_notifications` already seen.
    notifications: HashSet<usize>,
}

/// Records which methods and commands the server has made available, either
/// statically in the initialize result or through dynamic registration.
pub(crate) struct CapabilityTracker {
    required_methods: Vec<String>,
    required_commands: Vec<String>,
    required_notifications: Vec<RequiredNotification>,
    observed: Mutex<Observed>,
    changed: Notify,
}

impl CapabilityTracker {
    pub fn new(config: &HandshakeConfig) -> Self {
        Self {
            required_methods: config.required_methods.clone(),
            required_commands: config.required_commands.clone(),
            required_notifications: config.required_notifications.clone(),
            observed: Mutex::new(Observed::default()),
            changed: Notify::new(),
        }
    }

    fn with_observed<T>(&self, f: impl FnOnce(&mut Observed) -> T) -> T {
        let mut guard = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut guard);
        drop(guard);
        self.changed.notify_waiters();
        out
    }

    /// Record the `capabilities` of an initialize result.
    pub fn observe_initialize_result(&self, result: &Value) {
        let capabilities = &result["capabilities"];
        self.with_observed(|observed| {
            observed.initialized = true;
            for method in self
                .required_methods
                .iter()
                .filter(|m| Self::statically_provided(capabilities, m))
            {
                observed.methods.insert(method.clone());
            }
            if let Some(commands) = capabilities["executeCommandProvider"]["commands"].as_array() {
                observed
                    .commands
                    .extend(commands.iter().filter_map(Value::as_str).map(String::from));
            }
        });
    }

    fn statically_provided(capabilities: &Value, method: &str) -> bool {
        let Some(key) = static_provider(method) else {
            return false;
        };
        let provider = capabilities.get(key);
        match method {
            "completionItem/resolve" | "codeAction/resolve" => {
                provider.and_then(|p| p.get("resolveProvider")) == Some(&Value::Bool(true))
            }
            _ => provider_present(provider),
        }
    }

    /// Record the params of a `client/registerCapability` request.
    pub fn observe_registrations(&self, params: Option<&Value>) {
        let Some(registrations) = params.and_then(|p| p["registrations"].as_array()) else {
            tracing::debug!("registerCapability without registrations");
            return;
        };
        self.with_observed(|observed| {
            for registration in registrations {
                let Some(method) = registration["method"].as_str() else {
                    continue;
                };
                tracing::debug!(method, "capability registered");
                observed.methods.insert(method.to_string());
                if let Some(id) = registration["id"].as_str() {
                    observed
                        .registrations
                        .insert(id.to_string(), method.to_string());
                }
                if let Some(commands) = registration["registerOptions"]["commands"].as_array() {
                    observed
                        .commands
                        .extend(commands.iter().filter_map(Value::as_str).map(String::from));
                }
            }
        });
    }

    /// Record the params of a `client/unregisterCapability` request.
    pub fn observe_unregistrations(&self, params: Option<&Value>) {
        // LSP spells this key "unregisterations".
        let Some(entries) = params.and_then(|p| p["unregisterations"].as_array()) else {
            return;
        };
        self.with_observed(|observed| {
            for entry in entries {
                let id = entry["id"].as_str();
                let method = id
                    .and_then(|id| observed.registrations.remove(id))
                    .or_else(|| entry["method"].as_str().map(String::from));
                if let Some(method) = method {
                    tracing::debug!(method = %method, "capability unregistered");
                    observed.methods.remove(&method);
                }
            }
        });
    }

    /// Record a server notification; counts if it matches a required one.
    pub fn observe_notification(&self, method: &str, params: Option<&Value>) {
        let matched: Vec<usize> = self
            .required_notifications
            .iter()
            .enumerate()
            .filter(|(_, required)| required.matches(method, params))
            .map(|(i, _)| i)
            .collect();
        if matched.is_empty() {
            return;
        }
        tracing::debug!(method, "readiness notification observed");
        self.with_observed(|observed| observed.notifications.extend(matched));
    }

    /// Required methods, commands and notifications not yet observed.
    pub fn missing(&self) -> Vec<String> {
        let observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        let mut missing: Vec<String> = self
            .required_methods
            .iter()
            .filter(|m| !observed.methods.contains(*m))
            .cloned()
            .collect();
        missing.extend(
            self.required_commands
                .iter()
                .filter(|c| !observed.commands.contains(*c))
                .map(|c| format!("command {c}")),
        );
        missing.extend(
            self.required_notifications
                .iter()
                .enumerate()
                .filter(|(i, _)| !observed.notifications.contains(i))
                .map(|(_, n)| n.to_string()),
        );
        if !observed.initialized {
            missing.insert(0, "initialize response".to_string());
        }
        missing
    }

    pub fn is_satisfied(&self) -> bool {
        self.missing().is_empty()
    }

    /// Whether `method` is currently available.
    pub fn has_method(&self, method: &str) -> bool {
        self.observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .methods
            .contains(method)
    }

    /// Wait until [`Self::is_satisfied`].
    pub async fn wait_satisfied(&self) {
        loop {
            let notified = self.changed.notified();
            if self.is_satisfied() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn tracker(methods: &[&str], commands: &[&str]) -> CapabilityTracker {
        CapabilityTracker::new(&HandshakeConfig {
            required_methods: methods.iter().map(ToString::to_string).collect(),
            required_commands: commands.iter().map(ToString::to_string).collect(),
            required_notifications: Vec::new(),
            timeout_secs: 1,
        })
    }

    #[test]
    fn test_legal_transitions() {
        use LifecycleState::*;
        assert!(NotStarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(AwaitingHandshake));
        assert!(AwaitingHandshake.can_transition_to(Ready));
        assert!(Ready.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Stopped));
        assert!(AwaitingHandshake.can_transition_to(Stopped));
    }

    #[test]
    fn test_illegal_transitions() {
        use LifecycleState::*;
        assert!(!NotStarted.can_transition_to(Ready));
        assert!(!Starting.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(AwaitingHandshake));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn test_write_path_valid_only_between_starting_and_shutting_down() {
        use LifecycleState::*;
        assert!(!NotStarted.can_write());
        assert!(Starting.can_write());
        assert!(Ready.can_write());
        assert!(ShuttingDown.can_write());
        assert!(!Stopped.can_write());
    }

    #[test]
    fn test_state_machine_rejects_skipping_handshake() {
        let sm = StateMachine::new();
        sm.advance(LifecycleState::Starting).unwrap();
        let err = sm.advance(LifecycleState::Ready).unwrap_err();
        assert_eq!(err.from, LifecycleState::Starting);
        assert_eq!(sm.current(), LifecycleState::Starting);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let sm = StateMachine::new();
        sm.advance(LifecycleState::Starting).unwrap();
        assert!(sm.stop());
        assert!(!sm.stop());
        assert!(sm.advance(LifecycleState::Starting).is_err());
        assert_eq!(sm.current(), LifecycleState::Stopped);
    }

    #[test]
    fn test_initialize_result_alone_satisfies_static_capabilities() {
        let t = tracker(&["textDocument/completion", "textDocument/signatureHelp"], &[]);
        assert!(!t.is_satisfied());
        t.observe_initialize_result(&serde_json::json!({
            "capabilities": {
                "completionProvider": { "triggerCharacters": ["."] },
                "signatureHelpProvider": {}
            }
        }));
        assert!(t.is_satisfied());
    }

    #[test]
    fn test_false_provider_does_not_count() {
        let t = tracker(&["textDocument/definition"], &[]);
        t.observe_initialize_result(&serde_json::json!({
            "capabilities": { "definitionProvider": false }
        }));
        assert_eq!(t.missing(), vec!["textDocument/definition".to_string()]);
    }

    #[test]
    fn test_registration_before_initialize_response() {
        let t = tracker(&["textDocument/completion"], &["java.intellicode.enable"]);
        t.observe_registrations(Some(&serde_json::json!({
            "registrations": [
                { "id": "1", "method": "textDocument/completion", "registerOptions": {} },
                { "id": "2", "method": "workspace/executeCommand",
                  "registerOptions": { "commands": ["java.intellicode.enable"] } }
            ]
        })));
        // Registrations alone are not enough.
        assert_eq!(t.missing(), vec!["initialize response".to_string()]);

        t.observe_initialize_result(&serde_json::json!({ "capabilities": {} }));
        assert!(t.is_satisfied());
    }

    #[test]
    fn test_unregistration_removes_method() {
        let t = tracker(&["textDocument/codeAction"], &[]);
        t.observe_initialize_result(&serde_json::json!({ "capabilities": {} }));
        t.observe_registrations(Some(&serde_json::json!({
            "registrations": [{ "id": "ca", "method": "textDocument/codeAction" }]
        })));
        assert!(t.has_method("textDocument/codeAction"));
        t.observe_unregistrations(Some(&serde_json::json!({
            "unregisterations": [{ "id": "ca", "method": "textDocument/codeAction" }]
        })));
        assert!(!t.has_method("textDocument/codeAction"));
        assert!(!t.is_satisfied());
    }

    #[test]
    fn test_resolve_requires_resolve_provider() {
        let t = tracker(&["codeAction/resolve"], &[]);
        t.observe_initialize_result(&serde_json::json!({
            "capabilities": { "codeActionProvider": true }
        }));
        assert!(!t.is_satisfied());

        let t = tracker(&["codeAction/resolve"], &[]);
        t.observe_initialize_result(&serde_json::json!({
            "capabilities": { "codeActionProvider": { "resolveProvider": true } }
        }));
        assert!(t.is_satisfied());
    }

    #[test]
    fn test_readiness_notification_required() {
        let t = CapabilityTracker::new(&HandshakeConfig {
            required_notifications: vec![RequiredNotification::new(
                "language/status",
                Some(serde_json::json!({ "type": "ServiceReady" })),
            )],
            ..HandshakeConfig::default()
        });
        t.observe_initialize_result(&serde_json::json!({ "capabilities": {} }));
        assert_eq!(
            t.missing(),
            vec![r#"notification language/status {"type":"ServiceReady"}"#.to_string()]
        );

        t.observe_notification(
            "language/status",
            Some(&serde_json::json!({ "type": "Starting", "message": "Init..." })),
        );
        assert!(!t.is_satisfied());
        t.observe_notification(
            "language/status",
            Some(&serde_json::json!({ "type": "ServiceReady", "message": "ServiceReady" })),
        );
        assert!(t.is_satisfied());
    }

    #[tokio::test]
    async fn test_wait_satisfied_wakes_on_registration() {
        let t = Arc::new(tracker(&["textDocument/completion"], &[]));
        t.observe_initialize_result(&serde_json::json!({ "capabilities": {} }));

        let waiter = tokio::spawn({
            let t = t.clone();
            async move { t.wait_satisfied().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        t.observe_registrations(Some(&serde_json::json!({
            "registrations": [{ "id": "c", "method": "textDocument/completion" }]
        })));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
