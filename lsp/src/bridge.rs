//! Blocking façade over [`Connection`].
//!
//! Each [`Bridge`] owns one OS thread running a current-thread tokio runtime.
//! The connection, its read loop and its writer all live on that runtime;
//! foreground threads submit work with [`call_blocking`] and park until the
//! outcome arrives. Dropping a bridge shuts the server down.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::dispatcher::HandlerRegistry;
use crate::documents::{DocumentStore, DocumentSync};
use crate::error::{RpcError, RpcResult};
use crate::lifecycle::LifecycleState;
use crate::retry::RetryPolicy;
use crate::types::ClientConfig;

const RUNTIME_THREAD_NAME: &str = "classbench-lsp";

/// Run `future` on `handle` and block the current thread until it finishes.
///
/// Must not be called from inside an async context.
pub fn call_blocking<T, F>(handle: &Handle, future: F) -> RpcResult<T>
where
    F: Future<Output = RpcResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    handle.spawn(async move {
        let _ = tx.send(future.await);
    });
    rx.blocking_recv().map_err(|_| RpcError::BridgeStopped)?
}

/// The background thread and its runtime.
struct RuntimeThread {
    handle: Handle,
    stop_tx: oneshot::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl RuntimeThread {
    fn spawn() -> RpcResult<Self> {
        let spawn_err = |message: String| RpcError::Spawn {
            command: RUNTIME_THREAD_NAME.to_string(),
            message,
        };
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(RUNTIME_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                tracing::debug!("bridge runtime stopped");
            })
            .map_err(|e| spawn_err(e.to_string()))?;

        let handle = ready_rx
            .recv()
            .map_err(|e| spawn_err(e.to_string()))?
            .map_err(spawn_err)?;
        Ok(Self {
            handle,
            stop_tx,
            thread,
        })
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            tracing::warn!("bridge runtime thread panicked");
        }
    }
}

/// A language server connection usable from synchronous code.
pub struct Bridge {
    connection: Connection,
    documents: DocumentStore,
    retry: RetryPolicy,
    runtime: Option<RuntimeThread>,
}

impl Bridge {
    /// Spawn the configured server and block until the handshake completes.
    pub fn start(config: ClientConfig, handlers: HandlerRegistry) -> RpcResult<Self> {
        Self::launch(config, move |config| Connection::start(config, handlers))
    }

    /// Like [`Bridge::start`] over an existing pair of streams.
    pub fn from_streams<R, W>(
        config: ClientConfig,
        handlers: HandlerRegistry,
        reader: R,
        writer: W,
    ) -> RpcResult<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::launch(config, move |config| {
            Connection::from_streams(config, handlers, reader, writer)
        })
    }

    fn launch<F, Fut>(config: ClientConfig, connect: F) -> RpcResult<Self>
    where
        F: FnOnce(ClientConfig) -> Fut,
        Fut: Future<Output = RpcResult<Connection>> + Send + 'static,
    {
        let runtime = RuntimeThread::spawn()?;
        let documents = DocumentStore::new(config.server.language_id.clone());
        let retry = RetryPolicy::from(&config.retry);
        match call_blocking(&runtime.handle, connect(config)) {
            Ok(connection) => Ok(Self {
                connection,
                documents,
                retry,
                runtime: Some(runtime),
            }),
            Err(e) => {
                runtime.stop();
                Err(e)
            }
        }
    }

    fn handle(&self) -> RpcResult<&Handle> {
        self.runtime
            .as_ref()
            .map(|r| &r.handle)
            .ok_or(RpcError::BridgeStopped)
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.connection.config()
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.connection.state()
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    /// Send a request and block until its outcome.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        let connection = self.connection.clone();
        let method = method.to_string();
        let timeout = timeout.unwrap_or_else(|| self.config().timeouts.request());
        call_blocking(self.handle()?, async move {
            connection.request(&method, params, timeout).await
        })
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        let connection = self.connection.clone();
        let method = method.to_string();
        call_blocking(self.handle()?, async move {
            connection.notify(&method, params).await
        })
    }

    /// Register interest in the next `method` notification for `uri`.
    ///
    /// Register before triggering the notification, then collect it with
    /// [`Bridge::recv_notification`].
    pub fn wait_for_notification(&self, method: &str, uri: &str) -> oneshot::Receiver<Value> {
        self.connection.wait_for_notification(method, uri)
    }

    /// Block until `rx` completes or `timeout` elapses. `None` on timeout or
    /// if the waiter was dropped.
    pub fn recv_notification(
        &self,
        rx: oneshot::Receiver<Value>,
        timeout: Duration,
    ) -> RpcResult<Option<Value>> {
        call_blocking(self.handle()?, async move {
            Ok(tokio::time::timeout(timeout, rx)
                .await
                .ok()
                .and_then(Result::ok))
        })
    }

    /// Send `didClose` for a document opened by a probe.
    pub fn close_document(&self, path: &Path) -> RpcResult<()> {
        self.documents.close_document(self, path)
    }

    /// Orderly shutdown of the server and the runtime thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            // Blocking here would stall the caller's runtime; the child is
            // killed when the bridge runtime drops it.
            tracing::warn!("bridge dropped inside an async context, skipping graceful shutdown");
            let _ = runtime.stop_tx.send(());
            return;
        }
        let connection = self.connection.clone();
        if let Err(e) = call_blocking(&runtime.handle, async move {
            connection.shutdown().await;
            Ok(())
        }) {
            tracing::debug!("shutdown on bridge runtime failed: {e}");
        }
        runtime.stop();
    }
}

impl DocumentSync for Bridge {
    fn send(&self, method: &str, params: Value) -> RpcResult<()> {
        self.notify(method, Some(params))
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_blocking_returns_future_output() {
        let runtime = RuntimeThread::spawn().unwrap();
        let value = call_blocking(&runtime.handle, async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(41 + 1)
        })
        .unwrap();
        assert_eq!(value, 42);
        runtime.stop();
    }

    #[test]
    fn test_call_blocking_propagates_errors() {
        let runtime = RuntimeThread::spawn().unwrap();
        let err = call_blocking::<(), _>(&runtime.handle, async { Err(RpcError::TransportClosed) })
            .unwrap_err();
        assert_eq!(err, RpcError::TransportClosed);
        runtime.stop();
    }

    #[test]
    fn test_call_blocking_after_runtime_stopped() {
        let runtime = RuntimeThread::spawn().unwrap();
        let handle = runtime.handle.clone();
        runtime.stop();
        let err = call_blocking(&handle, async { Ok(()) }).unwrap_err();
        assert_eq!(err, RpcError::BridgeStopped);
    }

    #[test]
    fn test_concurrent_foreground_callers() {
        let runtime = RuntimeThread::spawn().unwrap();
        let handle = runtime.handle.clone();
        let threads: Vec<_> = (0..4u64)
            .map(|i| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    call_blocking(&handle, async move {
                        tokio::time::sleep(Duration::from_millis(20 - i * 5)).await;
                        Ok(i)
                    })
                    .unwrap()
                })
            })
            .collect();
        let results: Vec<u64> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(results, vec![0, 1, 2, 3]);
        runtime.stop();
    }
}
