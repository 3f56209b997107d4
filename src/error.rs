//! Error types with retry classification.
//!
//! Distinguishes failures that consume the shared retry budget (rate limits,
//! transport problems, timeouts) from failures that only trigger failover to
//! the next chain entry (auth, payment, CLI error output).

use std::time::Duration;
use thiserror::Error;

/// Semantic classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401/403 or a CLI reporting it is not authenticated - permanent
    Auth,
    /// 402 or credit-exhaustion messages - permanent, user should hear about it
    Payment,
    /// 429 - transient, counts against the retry budget
    RateLimit,
    /// Network errors and 5xx - transient, counts against the retry budget
    Transport,
    /// Deadline expiry - transient, counts against the retry budget
    Timeout,
    /// Response body could not be parsed - permanent for this provider
    Parse,
    /// CLI exited with an error payload on stdout - permanent
    CliOutput,
}

impl FailureKind {
    /// Whether a failure of this kind consumes the shared retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimit | FailureKind::Transport | FailureKind::Timeout
        )
    }

    /// Whether a failure of this kind warrants a user-visible notification.
    /// Transient network problems stay silent.
    pub fn should_notify_user(&self) -> bool {
        matches!(self, FailureKind::Payment | FailureKind::RateLimit)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Auth => write!(f, "auth"),
            FailureKind::Payment => write!(f, "payment"),
            FailureKind::RateLimit => write!(f, "rate_limit"),
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Parse => write!(f, "parse"),
            FailureKind::CliOutput => write!(f, "cli_output"),
        }
    }
}

/// Error from a provider adapter call.
#[derive(Debug, Clone)]
pub struct ProviderError {
    /// The kind of failure
    pub kind: FailureKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Suggested retry delay (from a Retry-After header)
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Auth,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn payment(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Payment,
            status_code: Some(402),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::RateLimit,
            status_code: Some(429),
            message: message.into(),
            retry_after,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(deadline: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            status_code: None,
            message: format!("deadline of {:.0?} expired", deadline),
            retry_after: None,
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Parse,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn cli_output(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::CliOutput,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify an HTTP error response by status code and body.
    ///
    /// Payment problems hide behind more than one status: OpenRouter returns
    /// 402, but some gateways report credit exhaustion inside a 403/429 body,
    /// so the body text participates in classification.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let lower = body.to_lowercase();
        if status == 402 || lower.contains("credits exhausted") || lower.contains("insufficient credits")
        {
            return Self {
                kind: FailureKind::Payment,
                status_code: Some(status),
                message: body.to_string(),
                retry_after: None,
            };
        }
        let kind = match status {
            401 | 403 => FailureKind::Auth,
            429 => FailureKind::RateLimit,
            500..=599 => FailureKind::Transport,
            _ => FailureKind::Transport,
        };
        Self {
            kind,
            status_code: Some(status),
            message: body.to_string(),
            retry_after,
        }
    }

    /// Whether this error consumes the shared retry budget.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Fatal errors surfaced directly to the caller instead of being absorbed by
/// the failover loop.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no providers available for tier {tier}")]
    NoProviders { tier: String },

    #[error("all providers failed (attempted: {}): {last}", attempted.join(", "))]
    ChainExhausted {
        attempted: Vec<String>,
        last: String,
    },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FailureKind::RateLimit.is_retryable());
        assert!(FailureKind::Transport.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::Auth.is_retryable());
        assert!(!FailureKind::Payment.is_retryable());
        assert!(!FailureKind::CliOutput.is_retryable());
        assert!(!FailureKind::Parse.is_retryable());
    }

    #[test]
    fn test_notification_policy() {
        assert!(FailureKind::Payment.should_notify_user());
        assert!(FailureKind::RateLimit.should_notify_user());
        assert!(!FailureKind::Transport.should_notify_user());
        assert!(!FailureKind::Auth.should_notify_user());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderError::from_status(401, "", None).kind, FailureKind::Auth);
        assert_eq!(ProviderError::from_status(403, "", None).kind, FailureKind::Auth);
        assert_eq!(ProviderError::from_status(402, "", None).kind, FailureKind::Payment);
        assert_eq!(
            ProviderError::from_status(429, "", None).kind,
            FailureKind::RateLimit
        );
        assert_eq!(
            ProviderError::from_status(503, "", None).kind,
            FailureKind::Transport
        );
    }

    #[test]
    fn test_credit_messages_classify_as_payment() {
        let err = ProviderError::from_status(403, "Insufficient credits to run this model", None);
        assert_eq!(err.kind, FailureKind::Payment);
        let err = ProviderError::from_status(429, "credits exhausted for this key", None);
        assert_eq!(err.kind, FailureKind::Payment);
    }

    #[test]
    fn test_retry_after_carried() {
        let err =
            ProviderError::rate_limited("slow down", Some(Duration::from_secs(30)));
        assert_eq!(err.retry_after, Some(Duration::from_secs(30)));
        assert!(err.is_retryable());
    }
}
