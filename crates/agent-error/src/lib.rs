//! Failure taxonomy with stable reason codes for the GPU render agent.
//!
//! Every internal error carries a [`FailureCategory`] and a public
//! [`ReasonCode`] string, a human-readable message, an optional cause
//! chain, and arbitrary key-value context. Use the builder returned by
//! [`AgentError::new`] to construct errors fluently; the resulting
//! [`AgentErrorDto`] is what callback payloads and job logs embed.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum length a user-visible reason string is truncated to.
pub const REASON_TRUNCATE_LEN: usize = 500;

/// Maximum length renderer `node_errors` payloads are truncated to.
pub const NODE_ERRORS_TRUNCATE_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// FailureCategory
// ---------------------------------------------------------------------------

/// Broad family a [`ReasonCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Envelope, parameter, binding, allow-list, or structural graph checks. Not retried.
    Validation,
    /// Renderer submit/transport errors wrapped from the HTTP client.
    Transient,
    /// Renderer poll deadline exceeded.
    Timeout,
    /// Cooperative cancellation.
    Cancelled,
    /// Anything else raised while executing.
    System,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ReasonCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable reason code reported in callback payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Envelope/parameter/binding/allow-list/graph-structure validation failed.
    ValidationError,
    /// Renderer submit or transport error.
    TransientError,
    /// Renderer poll deadline exceeded.
    Timeout,
    /// Cooperative cancellation.
    Canceled,
    /// Anything else raised while executing a job.
    SystemError,
}

impl ReasonCode {
    /// Returns the [`FailureCategory`] this reason code belongs to.
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::ValidationError => FailureCategory::Validation,
            Self::TransientError => FailureCategory::Transient,
            Self::Timeout => FailureCategory::Timeout,
            Self::Canceled => FailureCategory::Cancelled,
            Self::SystemError => FailureCategory::System,
        }
    }

    /// Stable `&'static str` representation, e.g. `"VALIDATION_ERROR"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::TransientError => "TRANSIENT_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Canceled => "CANCELED",
            Self::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AgentError
// ---------------------------------------------------------------------------

/// Unified agent error.
///
/// Carries a stable [`ReasonCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use agent_error::{AgentError, ReasonCode};
///
/// let err = AgentError::new(ReasonCode::TransientError, "renderer submit failed")
///     .with_context("node", "KSampler")
///     .with_context("status", 502);
/// ```
pub struct AgentError {
    /// Machine-readable reason code.
    pub code: ReasonCode,
    /// Human-readable description, truncated at [`REASON_TRUNCATE_LEN`] on construction.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics and callback payloads.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl AgentError {
    /// Create a new error with the given reason code and message.
    ///
    /// `message` is trimmed and truncated at [`REASON_TRUNCATE_LEN`] chars,
    /// appending a `…` marker when truncated.
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: truncate_reason(message.into().trim()),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> FailureCategory {
        self.code.category()
    }

    /// Construct a [`ReasonCode::ValidationError`] aggregating several offenders
    /// into one message, per the parameter-context validation rule.
    pub fn aggregated_validation(offenders: &[String]) -> Self {
        Self::new(
            ReasonCode::ValidationError,
            format!("parameter validation failed: {}", offenders.join(", ")),
        )
    }
}

/// Truncate renderer `node_errors` text at [`NODE_ERRORS_TRUNCATE_LEN`],
/// appending a `…` marker when truncated.
pub fn truncate_node_errors(s: &str) -> String {
    truncate_at(s, NODE_ERRORS_TRUNCATE_LEN)
}

fn truncate_reason(s: &str) -> String {
    truncate_at(s, REASON_TRUNCATE_LEN)
}

fn truncate_at(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

impl fmt::Debug for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AgentError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of an [`AgentError`] (without the opaque source),
/// embedded directly in failure callback payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct AgentErrorDto {
    /// Reason code, serialised as `reason_code` to match the callback schema.
    #[serde(rename = "reason_code")]
    pub code: ReasonCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&AgentError> for AgentErrorDto {
    fn from(err: &AgentError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<AgentErrorDto> for AgentError {
    fn from(dto: AgentErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
