//! Query helpers used by the benchmark harness.
//!
//! Every query that takes a probe text runs it through the document's
//! scratch discipline: lock the document, write the probe, ask, restore.
//! The whole write/ask/restore cycle is repeated under the retry policy.

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::Bridge;
use crate::error::RpcResult;
use crate::protocol::{self, Position, Range};
use crate::retry::{Classification, RetryableResult, with_retry, with_retry_by};

const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
const PULL_DIAGNOSTICS: &str = "textDocument/diagnostic";

/// Items of a completion result, which may be an array or a `CompletionList`.
fn completion_items(result: Value) -> Vec<Value> {
    match result {
        Value::Array(items) => items,
        Value::Object(mut list) => match list.remove("items") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn signatures(result: Value) -> Vec<Value> {
    match result {
        Value::Object(mut help) => match help.remove("signatures") {
            Some(Value::Array(signatures)) => signatures,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// A result that may be a single object, a list, or `null`, as a list.
///
/// Definition results come as `Location`, `Location[]` or `LocationLink[]`.
fn into_list(result: Value) -> Vec<Value> {
    match result {
        Value::Array(locations) => locations,
        Value::Null => Vec::new(),
        location => vec![location],
    }
}

fn diagnostic_items(report: &Value) -> Vec<Value> {
    ["diagnostics", "items"]
        .iter()
        .find_map(|key| report[*key].as_array())
        .cloned()
        .unwrap_or_default()
}

impl Bridge {
    /// Completion items at `position` with `probe_text` in place.
    ///
    /// An `isIncomplete` list is retried unless `allow_incomplete` is set.
    pub fn completions(
        &self,
        path: &Path,
        probe_text: Option<&str>,
        position: Position,
        allow_incomplete: bool,
    ) -> RpcResult<Vec<Value>> {
        let policy = *self.retry_policy();
        let classify = |result: &Value| match result.classify() {
            Classification::Incomplete if allow_incomplete => Classification::Complete,
            other => other,
        };
        let result = self.documents().with_document(self, path, |doc| {
            with_retry_by(&policy, classify, |_| {
                doc.probe(probe_text, |uri, _| {
                    self.call(
                        "textDocument/completion",
                        Some(protocol::text_document_position_params(uri, position)),
                        None,
                    )
                })
            })
        })?;
        Ok(completion_items(result))
    }

    /// `completionItem/resolve` for an item returned by [`Bridge::completions`].
    pub fn resolve_completion(&self, item: Value) -> RpcResult<Value> {
        self.call("completionItem/resolve", Some(item), None)
    }

    pub fn signature_help(
        &self,
        path: &Path,
        probe_text: Option<&str>,
        position: Position,
    ) -> RpcResult<Vec<Value>> {
        let result = self.position_query("textDocument/signatureHelp", path, probe_text, position)?;
        Ok(signatures(result))
    }

    pub fn definition(
        &self,
        path: &Path,
        probe_text: Option<&str>,
        position: Position,
    ) -> RpcResult<Vec<Value>> {
        let result = self.position_query("textDocument/definition", path, probe_text, position)?;
        Ok(into_list(result))
    }

    fn position_query(
        &self,
        method: &str,
        path: &Path,
        probe_text: Option<&str>,
        position: Position,
    ) -> RpcResult<Value> {
        let policy = *self.retry_policy();
        self.documents().with_document(self, path, |doc| {
            with_retry(&policy, |_| {
                doc.probe(probe_text, |uri, _| {
                    self.call(
                        method,
                        Some(protocol::text_document_position_params(uri, position)),
                        None,
                    )
                })
            })
        })
    }

    /// Diagnostics for the document with `probe_text` in place.
    ///
    /// Uses `textDocument/diagnostic` when the server offers it. Otherwise
    /// every attempt writes the document (the probe, or the saved text again
    /// when there is none) and waits up to `timeout` for the
    /// `publishDiagnostics` of that version.
    pub fn diagnostics(
        &self,
        path: &Path,
        probe_text: Option<&str>,
        timeout: Duration,
    ) -> RpcResult<Vec<Value>> {
        let policy = *self.retry_policy();
        let pull = self.connection().has_method(PULL_DIAGNOSTICS);
        self.documents().with_document(self, path, |doc| {
            with_retry(&policy, |_| {
                if pull {
                    return doc.probe(probe_text, |uri, _| {
                        let report = self.call(
                            PULL_DIAGNOSTICS,
                            Some(serde_json::json!({ "textDocument": { "uri": uri } })),
                            Some(timeout),
                        )?;
                        Ok(diagnostic_items(&report))
                    });
                }
                let text = probe_text.map_or_else(|| doc.saved_text().to_string(), str::to_string);
                let rx = self.wait_for_notification(PUBLISH_DIAGNOSTICS, doc.uri());
                doc.probe(Some(&text), |uri, version| {
                    self.await_diagnostics(rx, uri, version, timeout)
                })
            })
        })
    }

    /// Wait for a `publishDiagnostics` matching `version`. Reports for an
    /// older version are skipped. Empty on timeout.
    ///
    /// `rx` must be registered before the write that triggers the report.
    fn await_diagnostics(
        &self,
        mut rx: oneshot::Receiver<Value>,
        uri: &str,
        version: i32,
        timeout: Duration,
    ) -> RpcResult<Vec<Value>> {
        let deadline = Instant::now() + timeout;
        loop {
            // A report may have landed between two waiter registrations.
            if let Some(params) = self.connection().latest_notification(PUBLISH_DIAGNOSTICS, uri)
                && params["version"].as_i64() == Some(i64::from(version))
            {
                return Ok(diagnostic_items(&params));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(params) = self.recv_notification(rx, remaining)? else {
                tracing::debug!(uri, "no diagnostics within {timeout:?}");
                return Ok(Vec::new());
            };
            match params["version"].as_i64() {
                Some(seen) if seen != i64::from(version) => {
                    tracing::debug!(uri, seen, version, "skipping stale diagnostics");
                    rx = self.wait_for_notification(PUBLISH_DIAGNOSTICS, uri);
                }
                _ => return Ok(diagnostic_items(&params)),
            }
        }
    }

    /// `textDocument/codeAction` over `range` with `probe_text` in place.
    pub fn code_actions(
        &self,
        path: &Path,
        probe_text: Option<&str>,
        range: Range,
        diagnostics: &[Value],
    ) -> RpcResult<Vec<Value>> {
        let policy = *self.retry_policy();
        self.documents().with_document(self, path, |doc| {
            with_retry(&policy, |_| {
                doc.probe(probe_text, |uri, _| {
                    let result = self.call(
                        "textDocument/codeAction",
                        Some(serde_json::json!({
                            "textDocument": { "uri": uri },
                            "range": range,
                            "context": { "diagnostics": diagnostics }
                        })),
                        None,
                    )?;
                    Ok(into_list(result))
                })
            })
        })
    }

    /// `codeAction/resolve` for an action lacking its edit.
    pub fn resolve_code_action(&self, action: Value) -> RpcResult<Value> {
        self.call("codeAction/resolve", Some(action), None)
    }

    pub fn execute_command(&self, command: &str, arguments: Vec<Value>) -> RpcResult<Value> {
        self.call(
            "workspace/executeCommand",
            Some(serde_json::json!({ "command": command, "arguments": arguments })),
            None,
        )
    }
}
