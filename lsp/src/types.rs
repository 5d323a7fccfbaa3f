//! Public configuration types.
//!
//! These deserialize from the `classbench` TOML config file. Everything except
//! [`ServerConfig`] has defaults, so a minimal config names only the server.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 2;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Top-level client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ClientConfig {
    /// Config with default handshake, timeout and retry sections.
    #[must_use]
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            handshake: HandshakeConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// How to launch a language server and what to tell it about the workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "jdtls"), resolved on `PATH`.
    pub command: String,
    /// Fixed argument list.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the child. Defaults to `root`.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Workspace root sent as `rootUri`.
    pub root: PathBuf,
    /// LSP language identifier used in `didOpen` (e.g. "java", "csharp").
    pub language_id: String,
    /// Passed verbatim as `initializationOptions`.
    #[serde(default)]
    pub initialization_options: Option<Value>,
    /// Sent via `workspace/didChangeConfiguration` after `initialized`, and
    /// returned for `workspace/configuration` requests.
    #[serde(default)]
    pub settings: Option<Value>,
}

impl ServerConfig {
    #[must_use]
    pub fn working_dir(&self) -> &std::path::Path {
        self.working_dir.as_deref().unwrap_or(&self.root)
    }
}

/// What must be observed before the connection is `Ready`.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeConfig {
    /// Methods that must be advertised statically or registered dynamically.
    #[serde(default)]
    pub required_methods: Vec<String>,
    /// `workspace/executeCommand` commands that must be available.
    #[serde(default)]
    pub required_commands: Vec<String>,
    /// Notifications the server must send before it is usable, e.g.
    /// `language/status` with `type = "ServiceReady"`.
    #[serde(default)]
    pub required_notifications: Vec<RequiredNotification>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            required_methods: Vec::new(),
            required_commands: Vec::new(),
            required_notifications: Vec::new(),
            timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

impl HandshakeConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A server notification that signals readiness.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequiredNotification {
    pub method: String,
    /// Fields the notification params must carry. An object matches when
    /// every one of its keys is present with an equal value; anything else
    /// must equal the params exactly. `None` matches any params.
    #[serde(default)]
    pub params: Option<Value>,
}

impl RequiredNotification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn matches(&self, method: &str, params: Option<&Value>) -> bool {
        if self.method != method {
            return false;
        }
        match &self.params {
            None => true,
            Some(Value::Object(expected)) => expected
                .iter()
                .all(|(key, value)| params.and_then(|p| p.get(key)) == Some(value)),
            Some(expected) => params == Some(expected),
        }
    }
}

impl std::fmt::Display for RequiredNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.params {
            Some(params) => write!(f, "notification {} {params}", self.method),
            None => write!(f, "notification {}", self.method),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Default bound for a single request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_secs: u64,
    /// Grace period for the process to exit after `exit` before it is killed.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            shutdown_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    #[must_use]
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
