//! Retry policy for queries whose answer may not be ready yet.
//!
//! Language servers often answer too early: an empty list while the project
//! is still indexing, or a completion list flagged `isIncomplete`.
//!
//! # Retry Policy
//!
//! - Max attempts: 3 (configurable, at least 1)
//! - `Incomplete` or `Empty` result: try again
//! - Any error: return it immediately
//! - Attempts exhausted: return an empty result, not an error

use serde_json::Value;

use crate::error::RpcResult;
use crate::types::RetryConfig;

/// How usable a query result is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Complete,
    /// The server said there is more (e.g. `isIncomplete: true`).
    Incomplete,
    Empty,
}

impl Classification {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Complete)
    }
}

/// A result the retry loop can judge and replace with an empty value.
pub trait RetryableResult: Sized {
    fn classify(&self) -> Classification;
    fn empty() -> Self;
}

impl RetryableResult for Value {
    fn classify(&self) -> Classification {
        match self {
            Value::Null => Classification::Empty,
            Value::Array(items) if items.is_empty() => Classification::Empty,
            Value::Object(obj) => {
                if obj.get("isIncomplete") == Some(&Value::Bool(true)) {
                    return Classification::Incomplete;
                }
                let list_empty = ["items", "signatures", "diagnostics"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(Value::as_array))
                    .is_some_and(Vec::is_empty);
                if list_empty {
                    Classification::Empty
                } else {
                    Classification::Complete
                }
            }
            _ => Classification::Complete,
        }
    }

    fn empty() -> Self {
        Value::Null
    }
}

impl<T> RetryableResult for Vec<T> {
    fn classify(&self) -> Classification {
        if self.is_empty() {
            Classification::Empty
        } else {
            Classification::Complete
        }
    }

    fn empty() -> Self {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts)
    }
}

impl RetryPolicy {
    /// A policy with `max_attempts` total attempts (clamped to at least 1).
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `attempt` until it yields a complete result or attempts run out.
///
/// `attempt` receives the 1-based attempt number.
pub fn with_retry<T, F>(policy: &RetryPolicy, attempt: F) -> RpcResult<T>
where
    T: RetryableResult,
    F: FnMut(u32) -> RpcResult<T>,
{
    with_retry_by(policy, T::classify, attempt)
}

/// [`with_retry`] with a caller-supplied classification.
pub fn with_retry_by<T, C, F>(policy: &RetryPolicy, classify: C, mut attempt: F) -> RpcResult<T>
where
    T: RetryableResult,
    C: Fn(&T) -> Classification,
    F: FnMut(u32) -> RpcResult<T>,
{
    for n in 1..=policy.max_attempts {
        let result = attempt(n)?;
        match classify(&result) {
            Classification::Complete => return Ok(result),
            kind => tracing::debug!(
                attempt = n,
                max = policy.max_attempts,
                ?kind,
                "result not usable yet, retrying"
            ),
        }
    }
    tracing::info!(
        attempts = policy.max_attempts,
        "retries exhausted, returning empty result"
    );
    Ok(T::empty())
}
