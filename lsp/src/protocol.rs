//! JSON-RPC message model and LSP param builders.
//!
//! [`Message`] is the tagged union of the three wire shapes. Conversion to and
//! from `serde_json::Value` is done by hand so that `"result": null` survives
//! a round trip and so that responses carrying both or neither of
//! `result`/`error` can be rejected explicitly.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ServerConfig;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const REQUEST_CANCELLED: i64 = -32800;
pub const CONTENT_MODIFIED: i64 = -32801;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// Request id. Locally issued ids are always numbers; servers may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// The id as a locally issued number, if it is one.
    #[must_use]
    pub fn as_local(&self) -> Option<u64> {
        match self {
            Self::Number(n) => u64::try_from(*n).ok(),
            Self::String(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Number(id as i64)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

/// The `error` object of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    /// An explicit `"data": null` decodes as `Some(Value::Null)`, distinct
    /// from an absent field.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            METHOD_NOT_FOUND,
            format!("method '{method}' not handled on client"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// One JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, ResponseError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Why a JSON value is not a JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageShapeError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("response for id {0} carries both result and error")]
    BothResultAndError(RequestId),
    #[error("message has neither method nor id")]
    Unclassifiable,
    #[error("invalid error object: {0}")]
    InvalidError(String),
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, outcome: Result<Value, ResponseError>) -> Self {
        Self::Response { id, outcome }
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                obj.insert("id".into(), id_to_value(id));
                obj.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                obj.insert("id".into(), id_to_value(id));
                match outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert(
                            "error".into(),
                            serde_json::to_value(error).unwrap_or(Value::Null),
                        );
                    }
                }
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
        }
        Value::Object(obj)
    }

    /// Classify a decoded JSON body.
    ///
    /// A response with neither `result` nor `error` is delivered as an
    /// `INVALID_REQUEST` error so the waiting caller is still resolved.
    pub fn from_value(value: Value) -> Result<Self, MessageShapeError> {
        let Value::Object(mut obj) = value else {
            return Err(MessageShapeError::NotAnObject);
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw.clone())
                    .map_err(|_| MessageShapeError::InvalidId(raw.to_string()))?,
            ),
        };
        let method = match obj.remove("method") {
            Some(Value::String(m)) => Some(m),
            _ => None,
        };
        let params = obj.remove("params");

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => {
                let result = obj.remove("result");
                let error = obj.remove("error");
                let outcome = match (result, error) {
                    (Some(result), None) => Ok(result),
                    (None, Some(error)) => Err(serde_json::from_value::<ResponseError>(error)
                        .map_err(|e| MessageShapeError::InvalidError(e.to_string()))?),
                    (Some(_), Some(_)) => return Err(MessageShapeError::BothResultAndError(id)),
                    (None, None) => Err(ResponseError::new(
                        INVALID_REQUEST,
                        "response carries neither result nor error",
                    )),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, None) => Err(MessageShapeError::Unclassifiable),
        }
    }
}

fn id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.as_str()),
    }
}

/// Params of the `initialize` request.
///
/// Dynamic registration is advertised for every feature the query helpers use
/// so that servers announce them through `client/registerCapability`.
pub(crate) fn initialize_params(config: &ServerConfig, root_uri: &str) -> Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": { "name": "classbench", "version": env!("CARGO_PKG_VERSION") },
        "rootPath": config.root.display().to_string(),
        "rootUri": root_uri,
        "capabilities": {
            "workspace": {
                "configuration": true,
                "didChangeConfiguration": { "dynamicRegistration": true },
                "executeCommand": { "dynamicRegistration": true },
                "workspaceFolders": true
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": true,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "completion": {
                    "dynamicRegistration": true,
                    "completionItem": { "snippetSupport": false, "resolveSupport": { "properties": ["documentation", "detail"] } }
                },
                "signatureHelp": { "dynamicRegistration": true },
                "definition": { "dynamicRegistration": true },
                "codeAction": { "dynamicRegistration": true, "resolveSupport": { "properties": ["edit"] } },
                "diagnostic": { "dynamicRegistration": true },
                "publishDiagnostics": { "relatedInformation": false }
            },
            "window": { "workDoneProgress": true }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": config.root.file_name().and_then(|n| n.to_str()).unwrap_or("workspace")
        }]
    });
    if let Some(options) = &config.initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn text_document_position_params(uri: &str, position: Position) -> Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": position
    })
}

/// Zero-based line and UTF-16 character offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// Position of byte offset `offset` in `text`.
///
/// Offsets past the end clamp to the end of the text; offsets inside a
/// multi-byte character resolve to the start of that character.
#[must_use]
pub fn position_at(text: &str, offset: usize) -> Position {
    let mut line = 0u32;
    let mut character = 0u32;
    for (idx, ch) in text.char_indices() {
        if idx >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            character = 0;
        } else {
            character += ch.len_utf16() as u32;
        }
    }
    Position { line, character }
}

/// Position just past the last character of `text`.
#[must_use]
pub fn end_position(text: &str) -> Position {
    position_at(text, text.len())
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
