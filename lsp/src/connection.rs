//! Async connection to one language server.
//!
//! Owns the transport, the read loop task, the request registry and the
//! lifecycle. Construction runs the full handshake; callers only ever see a
//! connection that reached `Ready` (or an error).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::dispatcher::{Dispatcher, HandlerRegistry};
use crate::error::{RpcError, RpcResult};
use crate::lifecycle::{CapabilityTracker, LifecycleState, StateMachine};
use crate::protocol::{self, Message};
use crate::registry::RequestRegistry;
use crate::transport::{self, BoxedReader, ReadLoopExit, Transport};
use crate::types::ClientConfig;

/// How long `shutdown` waits for the read loop after the process is gone.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    transport: Arc<Transport>,
    registry: Arc<RequestRegistry>,
    dispatcher: Arc<Dispatcher>,
    capabilities: Arc<CapabilityTracker>,
    state: Arc<StateMachine>,
    stop_tx: watch::Sender<bool>,
    reader_handle: Mutex<Option<JoinHandle<ReadLoopExit>>>,
}

impl Connection {
    /// Spawn the configured server and run the handshake.
    pub async fn start(config: ClientConfig, handlers: HandlerRegistry) -> RpcResult<Self> {
        let (transport, reader) = Transport::spawn(&config.server)?;
        let connection = Self::attach(config, handlers, transport, reader);
        connection.establish().await?;
        Ok(connection)
    }

    /// Run the handshake over an existing pair of streams.
    pub async fn from_streams<R, W>(
        config: ClientConfig,
        handlers: HandlerRegistry,
        reader: R,
        writer: W,
    ) -> RpcResult<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (transport, reader) = Transport::from_streams(reader, writer);
        let connection = Self::attach(config, handlers, transport, reader);
        connection.establish().await?;
        Ok(connection)
    }

    /// Wire up the read loop and move to `Starting`. No traffic is sent yet.
    pub(crate) fn attach(
        config: ClientConfig,
        handlers: HandlerRegistry,
        transport: Transport,
        reader: BoxedReader,
    ) -> Self {
        let transport = Arc::new(transport);
        let registry = Arc::new(RequestRegistry::new());
        let capabilities = Arc::new(CapabilityTracker::new(&config.handshake));
        let handlers = HandlerRegistry::defaults(config.server.settings.clone()).overridden_by(handlers);
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            capabilities.clone(),
            handlers,
        ));
        let state = Arc::new(StateMachine::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let _ = state.advance(LifecycleState::Starting);

        let reader_handle = tokio::spawn({
            let transport = transport.clone();
            let registry = registry.clone();
            let dispatcher = dispatcher.clone();
            let state = state.clone();
            async move {
                let exit = transport::read_loop(reader, stop_rx, |message| {
                    let reply = dispatcher.dispatch(message);
                    let transport = transport.clone();
                    async move {
                        if let Some(reply) = reply
                            && let Err(e) = transport.write_message(&reply).await
                        {
                            tracing::warn!("failed to answer server request: {e}");
                        }
                    }
                })
                .await;

                match &exit {
                    ReadLoopExit::Failed(reason) => tracing::warn!("read loop failed: {reason}"),
                    other => tracing::info!("read loop finished: {}", other.reason()),
                }
                registry.close(&exit.reason());
                dispatcher.clear_waiters();
                state.stop();
                exit
            }
        });

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                registry,
                dispatcher,
                capabilities,
                state,
                stop_tx,
                reader_handle: Mutex::new(Some(reader_handle)),
            }),
        }
    }

    /// Handshake; on any failure the connection is torn down.
    pub(crate) async fn establish(&self) -> RpcResult<()> {
        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("handshake failed: {e}");
                self.teardown("handshake failed").await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> RpcResult<()> {
        let inner = &self.inner;
        let handshake = &inner.config.handshake;
        let deadline = Instant::now() + handshake.timeout();
        self.advance(LifecycleState::AwaitingHandshake)?;

        let root_uri = protocol::path_to_file_uri(&inner.config.server.root)?;
        let params = protocol::initialize_params(&inner.config.server, root_uri.as_str());
        let result = self
            .send_request("initialize", Some(params), remaining(deadline))
            .await?;
        if !result["capabilities"].is_object() {
            return Err(RpcError::InvalidResult {
                method: "initialize".to_string(),
                message: "result has no capabilities object".to_string(),
            });
        }
        inner.capabilities.observe_initialize_result(&result);

        self.send_notification("initialized", Some(serde_json::json!({})))
            .await?;
        if let Some(settings) = &inner.config.server.settings {
            self.send_notification(
                "workspace/didChangeConfiguration",
                Some(serde_json::json!({ "settings": settings })),
            )
            .await?;
        }

        tokio::select! {
            () = inner.capabilities.wait_satisfied() => {}
            () = stopped(inner.state.subscribe()) => {
                return Err(RpcError::ConnectionClosed(self.closed_reason()));
            }
            () = tokio::time::sleep_until(deadline) => {
                return Err(RpcError::Handshake(format!(
                    "timed out after {:?} waiting for: {}",
                    handshake.timeout(),
                    inner.capabilities.missing().join(", ")
                )));
            }
        }

        self.advance(LifecycleState::Ready)
    }

    fn advance(&self, next: LifecycleState) -> RpcResult<()> {
        self.inner.state.advance(next).map_err(|e| {
            if e.from == LifecycleState::Stopped {
                RpcError::ConnectionClosed(self.closed_reason())
            } else {
                RpcError::Handshake(e.to_string())
            }
        })
    }

    fn closed_reason(&self) -> String {
        self.inner
            .registry
            .closed_reason()
            .unwrap_or_else(|| "connection stopped".to_string())
    }

    fn ensure_ready(&self) -> RpcResult<()> {
        match self.inner.state.current() {
            LifecycleState::Ready => Ok(()),
            LifecycleState::Stopped => Err(RpcError::ConnectionClosed(self.closed_reason())),
            other => Err(RpcError::NotReady(other)),
        }
    }

    /// Gate for the raw write path, which the handshake and shutdown use
    /// before and after `Ready`.
    fn ensure_writable(&self) -> RpcResult<()> {
        match self.inner.state.current() {
            state if state.can_write() => Ok(()),
            LifecycleState::Stopped => Err(RpcError::ConnectionClosed(self.closed_reason())),
            other => Err(RpcError::NotReady(other)),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.state.current()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether the server currently offers `method`.
    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.inner.capabilities.has_method(method)
    }

    /// Send a request and wait for its outcome, bounded by `timeout`.
    ///
    /// On timeout the pending entry is dropped (a late response is
    /// discarded) and `$/cancelRequest` is sent.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> RpcResult<Value> {
        self.ensure_ready()?;
        self.send_request(method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        self.ensure_ready()?;
        self.send_notification(method, params).await
    }

    /// Completed by the next `method` notification for `uri`.
    pub fn wait_for_notification(&self, method: &str, uri: &str) -> oneshot::Receiver<Value> {
        self.inner.dispatcher.wait_for_notification(method, uri)
    }

    /// Params of the last `method` notification received for `uri`.
    #[must_use]
    pub fn latest_notification(&self, method: &str, uri: &str) -> Option<Value> {
        self.inner.dispatcher.latest_notification(method, uri)
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> RpcResult<Value> {
        self.ensure_writable()?;
        let inner = &self.inner;
        let pending = inner.registry.register()?;
        let id = pending.id();

        let message = Message::request(id, method, params);
        if let Err(e) = inner.transport.write_message(&message).await {
            inner.registry.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                inner.registry.forget(id);
                tracing::warn!(id, method, "request timed out after {timeout:?}");
                let cancel = Message::notification("$/cancelRequest", Some(serde_json::json!({ "id": id })));
                if let Err(e) = inner.transport.write_message(&cancel).await {
                    tracing::debug!("could not send $/cancelRequest: {e}");
                }
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        self.ensure_writable()?;
        self.inner
            .transport
            .write_message(&Message::notification(method, params))
            .await
    }

    /// Orderly shutdown: `shutdown` request, `exit` notification, process
    /// termination. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.state.advance(LifecycleState::ShuttingDown).is_err() {
            if inner.state.current() != LifecycleState::Stopped {
                tracing::debug!(state = %inner.state.current(), "shutdown already in progress");
            }
            return;
        }

        let grace = inner.config.timeouts.shutdown();
        match self.send_request("shutdown", None, grace).await {
            Ok(_) => {
                if let Err(e) = self.send_notification("exit", None).await {
                    tracing::debug!("could not send exit: {e}");
                }
            }
            Err(e) => tracing::warn!("shutdown request failed: {e}"),
        }
        self.teardown("connection shut down").await;
    }

    /// Release the process and the read loop, leaving the state `Stopped`.
    async fn teardown(&self, reason: &str) {
        let inner = &self.inner;
        inner.transport.terminate(inner.config.timeouts.shutdown()).await;
        let _ = inner.stop_tx.send(true);
        if let Some(handle) = inner.reader_handle.lock().await.take()
            && tokio::time::timeout(READER_JOIN_TIMEOUT, handle).await.is_err()
        {
            tracing::warn!("read loop did not stop in {READER_JOIN_TIMEOUT:?}");
        }
        inner.registry.close(reason);
        inner.dispatcher.clear_waiters();
        inner.state.stop();
    }
}

async fn stopped(mut state_rx: watch::Receiver<LifecycleState>) {
    let _ = state_rx.wait_for(|s| *s == LifecycleState::Stopped).await;
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameReader, FrameWriter};
    use crate::protocol::RequestId;
    use crate::types::{HandshakeConfig, RequiredNotification, ServerConfig};

    fn config(required: &[&str]) -> ClientConfig {
        let mut config = ClientConfig::new(ServerConfig {
            command: "fake".to_string(),
            args: Vec::new(),
            working_dir: None,
            root: std::env::temp_dir(),
            language_id: "java".to_string(),
            initialization_options: None,
            settings: None,
        });
        config.handshake = HandshakeConfig {
            required_methods: required.iter().map(ToString::to_string).collect(),
            required_commands: Vec::new(),
            required_notifications: Vec::new(),
            timeout_secs: 2,
        };
        config
    }

    type ServerSide = (
        FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    );

    fn attached(required: &[&str]) -> (Connection, ServerSide) {
        attached_with(config(required))
    }

    fn attached_with(config: ClientConfig) -> (Connection, ServerSide) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let (transport, reader) = Transport::from_streams(client_read, client_write);
        let connection = Connection::attach(config, HandlerRegistry::new(), transport, reader);
        (
            connection,
            (FrameReader::new(server_read), FrameWriter::new(server_write)),
        )
    }

    async fn expect_request(
        reader: &mut FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        expected: &str,
    ) -> RequestId {
        match reader.read_message().await.unwrap().unwrap() {
            Message::Request { id, method, .. } => {
                assert_eq!(method, expected);
                id
            }
            other => panic!("expected request {expected}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_requests_before_ready_fail_fast() {
        let (connection, _server) = attached(&[]);
        assert_eq!(connection.state(), LifecycleState::Starting);
        let err = connection
            .request("textDocument/completion", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NotReady(LifecycleState::Starting));
        let err = connection.notify("textDocument/didOpen", None).await.unwrap_err();
        assert_eq!(err, RpcError::NotReady(LifecycleState::Starting));
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready_with_static_capabilities() {
        let (connection, (mut reader, mut writer)) = attached(&["textDocument/completion"]);
        let server = tokio::spawn(async move {
            let id = expect_request(&mut reader, "initialize").await;
            writer
                .write_message(&Message::response(
                    id,
                    Ok(serde_json::json!({ "capabilities": { "completionProvider": {} } })),
                ))
                .await
                .unwrap();
            let initialized = reader.read_message().await.unwrap().unwrap();
            assert_eq!(initialized.method(), Some("initialized"));
            (reader, writer)
        });

        connection.establish().await.unwrap();
        assert_eq!(connection.state(), LifecycleState::Ready);
        assert!(connection.has_method("textDocument/completion"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_waits_for_service_ready() {
        let mut config = config(&[]);
        config.handshake.required_notifications = vec![RequiredNotification::new(
            "language/status",
            Some(serde_json::json!({ "type": "ServiceReady" })),
        )];
        let (connection, (mut reader, mut writer)) = attached_with(config);
        let (status_tx, status_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let id = expect_request(&mut reader, "initialize").await;
            writer
                .write_message(&Message::response(id, Ok(serde_json::json!({ "capabilities": {} }))))
                .await
                .unwrap();
            let initialized = reader.read_message().await.unwrap().unwrap();
            assert_eq!(initialized.method(), Some("initialized"));
            writer
                .write_message(&Message::notification(
                    "language/status",
                    Some(serde_json::json!({ "type": "Starting", "message": "Init..." })),
                ))
                .await
                .unwrap();
            status_rx.await.unwrap();
            writer
                .write_message(&Message::notification(
                    "language/status",
                    Some(serde_json::json!({ "type": "ServiceReady", "message": "ServiceReady" })),
                ))
                .await
                .unwrap();
            (reader, writer)
        });

        let establish = tokio::spawn({
            let connection = connection.clone();
            async move { connection.establish().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connection.state(), LifecycleState::AwaitingHandshake);

        status_tx.send(()).unwrap();
        establish.await.unwrap().unwrap();
        assert_eq!(connection.state(), LifecycleState::Ready);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_times_out_naming_missing_capability() {
        let (connection, (mut reader, mut writer)) = attached(&["textDocument/definition"]);
        let server = tokio::spawn(async move {
            let id = expect_request(&mut reader, "initialize").await;
            writer
                .write_message(&Message::response(id, Ok(serde_json::json!({ "capabilities": {} }))))
                .await
                .unwrap();
            // Keep the stream open until the client gives up.
            while let Ok(Some(_)) = reader.read_message().await {}
        });

        let err = connection.establish().await.unwrap_err();
        match err {
            RpcError::Handshake(reason) => assert!(reason.contains("textDocument/definition")),
            other => panic!("expected Handshake, got {other:?}"),
        }
        assert_eq!(connection.state(), LifecycleState::Stopped);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_during_handshake_is_connection_closed() {
        let (connection, (reader, writer)) = attached(&[]);
        drop(reader);
        drop(writer);
        let err = connection.establish().await.unwrap_err();
        assert!(
            matches!(err, RpcError::ConnectionClosed(_) | RpcError::TransportClosed),
            "unexpected {err:?}"
        );
        assert_eq!(connection.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_writes_after_stop_are_connection_closed() {
        let (connection, (reader, writer)) = attached(&[]);
        drop(reader);
        drop(writer);
        let _ = connection.establish().await;
        assert_eq!(connection.state(), LifecycleState::Stopped);

        let err = connection.send_notification("exit", None).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed(_)), "unexpected {err:?}");
        let err = connection
            .send_request("shutdown", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed(_)), "unexpected {err:?}");
    }

    #[tokio::test]
    async fn test_timed_out_request_is_cancelled() {
        let (connection, (mut reader, mut writer)) = attached(&[]);
        let server = tokio::spawn(async move {
            let id = expect_request(&mut reader, "initialize").await;
            writer
                .write_message(&Message::response(id, Ok(serde_json::json!({ "capabilities": {} }))))
                .await
                .unwrap();
            let _initialized = reader.read_message().await.unwrap();
            let slow = expect_request(&mut reader, "textDocument/hover").await;
            match reader.read_message().await.unwrap().unwrap() {
                Message::Notification { method, params } => {
                    assert_eq!(method, "$/cancelRequest");
                    assert_eq!(params.unwrap()["id"], serde_json::to_value(&slow).unwrap());
                }
                other => panic!("expected cancel, got {other:?}"),
            }
            // The late answer must be ignored.
            writer
                .write_message(&Message::response(slow, Ok(Value::from("late"))))
                .await
                .unwrap();
            (reader, writer)
        });

        connection.establish().await.unwrap();
        let err = connection
            .request("textDocument/hover", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let _streams = server.await.unwrap();
        assert_eq!(connection.inner.registry.pending_count(), 0);
    }
}
