//! Routing of inbound messages.
//!
//! Responses go to the [`RequestRegistry`]; server-initiated requests and
//! notifications go to handlers registered by method name. Registration
//! traffic and notifications are also fed to the [`CapabilityTracker`]
//! regardless of which handler answers them.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RpcError;
use crate::lifecycle::CapabilityTracker;
use crate::protocol::{Message, RequestId, ResponseError};
use crate::registry::RequestRegistry;

pub type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync>;
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Handlers for server-initiated traffic, keyed by method.
///
/// Registering a method twice replaces the earlier handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    requests: HashMap<String, RequestHandler>,
    notifications: HashMap<String, NotificationHandler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut requests: Vec<_> = self.requests.keys().collect();
        let mut notifications: Vec<_> = self.notifications.keys().collect();
        requests.sort();
        notifications.sort();
        f.debug_struct("HandlerRegistry")
            .field("requests", &requests)
            .field("notifications", &notifications)
            .finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_request<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync + 'static,
    {
        self.requests.insert(method.into(), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_notification<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.notifications.insert(method.into(), Arc::new(handler));
        self
    }

    /// Handlers every client needs so servers don't stall waiting on us.
    pub(crate) fn defaults(settings: Option<Value>) -> Self {
        Self::new()
            .on_request("client/registerCapability", |_| Ok(Value::Null))
            .on_request("client/unregisterCapability", |_| Ok(Value::Null))
            .on_request("window/workDoneProgress/create", |_| Ok(Value::Null))
            .on_request("window/showMessageRequest", |_| Ok(Value::Null))
            .on_request("workspace/configuration", move |params| {
                Ok(configuration_items(settings.as_ref(), params.as_ref()))
            })
            .on_notification("window/logMessage", log_server_message)
            .on_notification("window/showMessage", log_server_message)
            .on_notification("$/progress", |_| {})
    }

    /// `self` with every handler of `overrides` layered on top.
    #[must_use]
    pub(crate) fn overridden_by(mut self, overrides: Self) -> Self {
        self.requests.extend(overrides.requests);
        self.notifications.extend(overrides.notifications);
        self
    }
}

/// Answer a `workspace/configuration` request from the configured settings.
///
/// Each item's dotted `section` is looked up in `settings`; an item without
/// a section receives the whole settings object.
fn configuration_items(settings: Option<&Value>, params: Option<&Value>) -> Value {
    let items = params
        .and_then(|p| p["items"].as_array())
        .map_or(&[][..], Vec::as_slice);
    let answers = items
        .iter()
        .map(|item| {
            let Some(settings) = settings else {
                return Value::Null;
            };
            match item["section"].as_str() {
                Some(section) => section
                    .split('.')
                    .try_fold(settings, |node, key| node.get(key))
                    .cloned()
                    .unwrap_or(Value::Null),
                None => settings.clone(),
            }
        })
        .collect();
    Value::Array(answers)
}

fn log_server_message(params: Option<Value>) {
    let Some(params) = params else { return };
    let message = params["message"].as_str().unwrap_or_default();
    match params["type"].as_u64() {
        Some(1 | 2) => tracing::warn!(target: "classbench_lsp::server", "{message}"),
        Some(3) => tracing::debug!(target: "classbench_lsp::server", "{message}"),
        _ => tracing::trace!(target: "classbench_lsp::server", "{message}"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

type WaiterKey = (String, String);

pub(crate) struct Dispatcher {
    registry: Arc<RequestRegistry>,
    capabilities: Arc<CapabilityTracker>,
    handlers: HandlerRegistry,
    waiters: Mutex<HashMap<WaiterKey, oneshot::Sender<Value>>>,
    /// Params of the most recent notification per (method, uri).
    latest: Mutex<HashMap<WaiterKey, Value>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RequestRegistry>,
        capabilities: Arc<CapabilityTracker>,
        handlers: HandlerRegistry,
    ) -> Self {
        tracing::debug!(?handlers, "dispatcher handlers");
        Self {
            registry,
            capabilities,
            handlers,
            waiters: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Route one inbound message. Returns the reply to write back, if any.
    pub fn dispatch(&self, message: Message) -> Option<Message> {
        match message {
            Message::Response { id, outcome } => {
                self.handle_response(&id, outcome);
                None
            }
            Message::Request { id, method, params } => {
                Some(self.handle_request(id, &method, params))
            }
            Message::Notification { method, params } => {
                self.handle_notification(&method, params);
                None
            }
        }
    }

    fn handle_response(&self, id: &RequestId, outcome: Result<Value, ResponseError>) {
        let delivered = id
            .as_local()
            .is_some_and(|local| self.registry.resolve(local, outcome.map_err(RpcError::from)));
        if delivered {
            tracing::debug!(%id, "response delivered");
        } else {
            tracing::warn!(%id, "dropping response for unknown request id");
        }
    }

    fn handle_request(&self, id: RequestId, method: &str, params: Option<Value>) -> Message {
        tracing::debug!(%id, method, "server request");
        match method {
            "client/registerCapability" => self.capabilities.observe_registrations(params.as_ref()),
            "client/unregisterCapability" => {
                self.capabilities.observe_unregistrations(params.as_ref());
            }
            _ => {}
        }

        let Some(handler) = self.handlers.requests.get(method) else {
            tracing::debug!(method, "no handler, replying method not found");
            return Message::response(id, Err(ResponseError::method_not_found(method)));
        };
        let outcome = match catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::warn!(method, "request handler panicked: {reason}");
                Err(ResponseError::internal(format!("handler for '{method}' panicked: {reason}")))
            }
        };
        if let Err(e) = &outcome {
            tracing::debug!(method, code = e.code, "handler returned error");
        }
        Message::response(id, outcome)
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        self.capabilities.observe_notification(method, params.as_ref());

        let uri = params.as_ref().and_then(|p| p["uri"].as_str());
        if let (Some(uri), Some(params)) = (uri, &params) {
            self.latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((method.to_string(), uri.to_string()), params.clone());
        }
        let waiter = uri.and_then(|uri| self.take_waiter(method, uri));

        match self.handlers.notifications.get(method) {
            Some(handler) => {
                let arg = params.clone();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(arg))) {
                    tracing::warn!(
                        method,
                        "notification handler panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            None if waiter.is_none() => tracing::trace!(method, "ignoring notification"),
            None => {}
        }

        if let Some(tx) = waiter {
            let _ = tx.send(params.unwrap_or(Value::Null));
        }
    }

    fn take_waiter(&self, method: &str, uri: &str) -> Option<oneshot::Sender<Value>> {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(method.to_string(), uri.to_string()))
    }

    /// Completed by the next `method` notification whose params carry `uri`.
    ///
    /// A second waiter for the same key replaces the first, whose receiver
    /// then observes a closed channel.
    pub fn wait_for_notification(&self, method: &str, uri: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((method.to_string(), uri.to_string()), tx);
        if previous.is_some() {
            tracing::debug!(method, uri, "replaced existing notification waiter");
        }
        rx
    }

    /// Params of the last `method` notification whose params carried `uri`.
    pub fn latest_notification(&self, method: &str, uri: &str) -> Option<Value> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(method.to_string(), uri.to_string()))
            .cloned()
    }

    /// Drop every waiter and remembered notification, e.g. when the
    /// connection stops.
    pub fn clear_waiters(&self) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
    use crate::types::{HandshakeConfig, RequiredNotification};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(handlers: HandlerRegistry) -> (Dispatcher, Arc<RequestRegistry>, Arc<CapabilityTracker>) {
        let registry = Arc::new(RequestRegistry::new());
        let capabilities = Arc::new(CapabilityTracker::new(&HandshakeConfig {
            required_methods: vec!["textDocument/completion".to_string()],
            required_commands: Vec::new(),
            required_notifications: vec![RequiredNotification::new(
                "language/status",
                Some(serde_json::json!({ "type": "ServiceReady" })),
            )],
            timeout_secs: 1,
        }));
        let d = Dispatcher::new(registry.clone(), capabilities.clone(), handlers);
        (d, registry, capabilities)
    }

    fn error_code(reply: Option<Message>) -> i64 {
        match reply {
            Some(Message::Response { outcome: Err(e), .. }) => e.code,
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_routes_to_pending() {
        let (d, registry, _) = dispatcher(HandlerRegistry::new());
        let pending = registry.register().unwrap();
        let reply = d.dispatch(Message::response(
            RequestId::from(pending.id()),
            Ok(serde_json::json!({ "capabilities": {} })),
        ));
        assert!(reply.is_none());
        let result = pending.wait().await.unwrap();
        assert!(result["capabilities"].is_object());
    }

    #[tokio::test]
    async fn test_error_response_is_protocol_error() {
        let (d, registry, _) = dispatcher(HandlerRegistry::new());
        let pending = registry.register().unwrap();
        d.dispatch(Message::response(
            RequestId::from(pending.id()),
            Err(ResponseError::new(INVALID_PARAMS, "bad position")),
        ));
        let err = pending.wait().await.unwrap_err();
        assert_eq!(err.code(), Some(INVALID_PARAMS));
    }

    #[test]
    fn test_unknown_and_foreign_ids_are_dropped() {
        let (d, registry, _) = dispatcher(HandlerRegistry::new());
        let _pending = registry.register().unwrap();
        assert!(d.dispatch(Message::response(RequestId::from(999), Ok(Value::Null))).is_none());
        assert!(
            d.dispatch(Message::response(RequestId::String("1".into()), Ok(Value::Null)))
                .is_none()
        );
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn test_unhandled_request_gets_method_not_found() {
        let (d, _, _) = dispatcher(HandlerRegistry::new());
        let reply = d.dispatch(Message::request(5u64, "custom/thing", None));
        match &reply {
            Some(Message::Response { id, outcome: Err(e) }) => {
                assert_eq!(*id, RequestId::from(5));
                assert!(e.message.contains("custom/thing"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(error_code(reply), METHOD_NOT_FOUND);
    }

    #[test]
    fn test_last_registration_wins() {
        let handlers = HandlerRegistry::new()
            .on_request("x/y", |_| Ok(Value::from(1)))
            .on_request("x/y", |_| Ok(Value::from(2)));
        let (d, _, _) = dispatcher(handlers);
        match d.dispatch(Message::request(RequestId::String("s1".into()), "x/y", None)) {
            Some(Message::Response { id, outcome: Ok(v) }) => {
                assert_eq!(id, RequestId::String("s1".into()));
                assert_eq!(v, 2);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_handler_error_becomes_error_response() {
        let handlers = HandlerRegistry::new()
            .on_request("x/fail", |_| Err(ResponseError::new(INVALID_PARAMS, "nope")));
        let (d, _, _) = dispatcher(handlers);
        assert_eq!(error_code(d.dispatch(Message::request(1u64, "x/fail", None))), INVALID_PARAMS);
    }

    #[test]
    fn test_panicking_handler_becomes_internal_error() {
        let handlers = HandlerRegistry::new().on_request("x/boom", |_| panic!("kaboom"));
        let (d, _, _) = dispatcher(handlers);
        assert_eq!(error_code(d.dispatch(Message::request(1u64, "x/boom", None))), INTERNAL_ERROR);
        // Still dispatching afterwards.
        assert_eq!(
            error_code(d.dispatch(Message::request(2u64, "x/missing", None))),
            METHOD_NOT_FOUND
        );
    }

    #[test]
    fn test_notification_handler_runs_and_panics_are_contained() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handlers = HandlerRegistry::new()
            .on_notification("x/count", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .on_notification("x/boom", |_| panic!("bad notification"));
        let (d, _, _) = dispatcher(handlers);

        assert!(d.dispatch(Message::notification("x/count", None)).is_none());
        assert!(d.dispatch(Message::notification("x/boom", None)).is_none());
        assert!(d.dispatch(Message::notification("x/unknown", None)).is_none());
        assert!(d.dispatch(Message::notification("x/count", None)).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_capability_feeds_tracker() {
        let (d, _, capabilities) =
            dispatcher(HandlerRegistry::defaults(None));
        let reply = d.dispatch(Message::request(
            7u64,
            "client/registerCapability",
            Some(serde_json::json!({
                "registrations": [{ "id": "r", "method": "textDocument/completion" }]
            })),
        ));
        assert!(matches!(reply, Some(Message::Response { outcome: Ok(Value::Null), .. })));
        assert!(capabilities.has_method("textDocument/completion"));
    }

    #[test]
    fn test_registration_observed_even_when_user_overrides_handler() {
        let handlers = HandlerRegistry::defaults(None).overridden_by(
            HandlerRegistry::new().on_request("client/registerCapability", |_| {
                Err(ResponseError::new(INVALID_PARAMS, "refused"))
            }),
        );
        let (d, _, capabilities) = dispatcher(handlers);
        let reply = d.dispatch(Message::request(
            1u64,
            "client/registerCapability",
            Some(serde_json::json!({
                "registrations": [{ "id": "r", "method": "textDocument/completion" }]
            })),
        ));
        assert_eq!(error_code(reply), INVALID_PARAMS);
        assert!(capabilities.has_method("textDocument/completion"));
    }

    #[test]
    fn test_workspace_configuration_answers_per_item() {
        let settings = serde_json::json!({ "java": { "format": { "enabled": false } } });
        let (d, _, _) = dispatcher(HandlerRegistry::defaults(Some(settings.clone())));
        let reply = d.dispatch(Message::request(
            3u64,
            "workspace/configuration",
            Some(serde_json::json!({
                "items": [{ "section": "java.format" }, { "section": "missing" }, {}]
            })),
        ));
        match reply {
            Some(Message::Response { outcome: Ok(v), .. }) => {
                assert_eq!(v[0], serde_json::json!({ "enabled": false }));
                assert_eq!(v[1], Value::Null);
                assert_eq!(v[2], settings);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_notification_waiter_keyed_by_uri() {
        let (d, _, _) = dispatcher(HandlerRegistry::new());
        let a = d.wait_for_notification("textDocument/publishDiagnostics", "file:///A.java");
        let b = d.wait_for_notification("textDocument/publishDiagnostics", "file:///B.java");

        d.dispatch(Message::notification(
            "textDocument/publishDiagnostics",
            Some(serde_json::json!({ "uri": "file:///B.java", "diagnostics": [1] })),
        ));
        let got = b.await.unwrap();
        assert_eq!(got["diagnostics"], serde_json::json!([1]));

        d.dispatch(Message::notification(
            "textDocument/publishDiagnostics",
            Some(serde_json::json!({ "uri": "file:///A.java", "diagnostics": [] })),
        ));
        assert_eq!(a.await.unwrap()["uri"], "file:///A.java");
    }

    #[test]
    fn test_notifications_feed_tracker_even_with_handler() {
        let handlers = HandlerRegistry::new().on_notification("language/status", |_| {});
        let (d, _, capabilities) = dispatcher(handlers);
        capabilities.observe_initialize_result(&serde_json::json!({
            "capabilities": { "completionProvider": {} }
        }));
        assert!(!capabilities.is_satisfied());
        d.dispatch(Message::notification(
            "language/status",
            Some(serde_json::json!({ "type": "ServiceReady", "message": "ServiceReady" })),
        ));
        assert!(capabilities.is_satisfied());
    }

    #[test]
    fn test_latest_notification_remembered_per_uri() {
        let (d, _, _) = dispatcher(HandlerRegistry::new());
        let publish = |uri: &str, version: i64| {
            d.dispatch(Message::notification(
                "textDocument/publishDiagnostics",
                Some(serde_json::json!({ "uri": uri, "version": version, "diagnostics": [] })),
            ));
        };
        publish("file:///A.java", 1);
        publish("file:///A.java", 2);
        publish("file:///B.java", 7);

        let latest = d
            .latest_notification("textDocument/publishDiagnostics", "file:///A.java")
            .unwrap();
        assert_eq!(latest["version"], 2);
        assert!(d.latest_notification("other", "file:///A.java").is_none());

        d.clear_waiters();
        assert!(
            d.latest_notification("textDocument/publishDiagnostics", "file:///B.java")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_second_waiter_replaces_first() {
        let (d, _, _) = dispatcher(HandlerRegistry::new());
        let first = d.wait_for_notification("m", "u");
        let second = d.wait_for_notification("m", "u");
        assert!(first.await.is_err());
        d.dispatch(Message::notification("m", Some(serde_json::json!({ "uri": "u" }))));
        assert!(second.await.is_ok());
    }
}
