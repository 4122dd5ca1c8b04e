//! Shared Types
//!
//! Provider/model addressing and transport failure classification used by
//! every component of the resilience layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Provider / Model Addressing
// ============================================================================

/// A concrete provider and model pair a request can be sent to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderModel {
    /// Provider name (e.g. "openai")
    pub provider: String,

    /// Model identifier at that provider
    pub model: String,
}

impl ProviderModel {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ProviderModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

// ============================================================================
// Failure Classification
// ============================================================================

/// Transport-level failure reasons
///
/// Every failed provider call is classified into exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RateLimit,
    QuotaExceeded,
    Timeout,
    ServerError,
    NetworkError,
    ProviderUnavailable,
}

impl FailureReason {
    /// All reasons, in classification priority order
    pub const ALL: [FailureReason; 6] = [
        FailureReason::RateLimit,
        FailureReason::QuotaExceeded,
        FailureReason::Timeout,
        FailureReason::ServerError,
        FailureReason::NetworkError,
        FailureReason::ProviderUnavailable,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::ProviderUnavailable => "provider_unavailable",
        }
    }

    /// Reasons that indicate the provider itself cannot serve right now,
    /// so moving to the next candidate is more useful than retrying in place
    #[must_use]
    pub fn triggers_failover(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::QuotaExceeded | Self::ProviderUnavailable
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NETWORK_PATTERNS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "enotfound",
    "connection refused",
    "connection reset",
    "dns",
    "getaddrinfo",
    "name resolution",
];

// ============================================================================
// Provider Error
// ============================================================================

/// Failure reported by an injected execution operation
///
/// Operations that know why they failed should set `reason`; it is treated as
/// authoritative. Without it the error is classified from `status` and the
/// message text, which is only a best-effort guess for opaque errors.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ProviderError {
    /// Human-readable error message
    pub message: String,

    /// HTTP status code, if the failure came from an HTTP response
    pub status: Option<u16>,

    /// Structured reason set by the operation
    pub reason: Option<FailureReason>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            reason: None,
        }
    }

    /// Error for an HTTP response with a non-success status
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(message).with_status(status)
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: FailureReason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Classify into exactly one failure reason
    ///
    /// Heuristic order when no structured reason is present: 429 or
    /// "rate limit", 503 or "quota", "timeout", any 5xx, connection/DNS
    /// failure patterns, "unavailable", and finally `ServerError`.
    #[must_use]
    pub fn classify(&self) -> FailureReason {
        if let Some(reason) = self.reason {
            return reason;
        }

        let message = self.message.to_lowercase();

        if self.status == Some(429) || message.contains("rate limit") {
            FailureReason::RateLimit
        } else if self.status == Some(503) || message.contains("quota") {
            FailureReason::QuotaExceeded
        } else if message.contains("timeout") || message.contains("timed out") {
            FailureReason::Timeout
        } else if self.status.is_some_and(|s| (500..600).contains(&s)) {
            FailureReason::ServerError
        } else if NETWORK_PATTERNS.iter().any(|p| message.contains(p)) {
            FailureReason::NetworkError
        } else if message.contains("unavailable") {
            FailureReason::ProviderUnavailable
        } else {
            FailureReason::ServerError
        }
    }
}

impl From<&str> for ProviderError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ProviderError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}
