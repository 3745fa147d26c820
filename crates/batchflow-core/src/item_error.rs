//! Per-item failure taxonomy.
//!
//! The error kind decides retry eligibility and the item's terminal status;
//! the message is free text for humans.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Classified failure of a single batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Attempt exceeded its deadline.
    Timeout,
    /// Transport-level failure.
    Network,
    /// Downstream throttling (HTTP 429 and friends).
    RateLimit,
    /// Authorization failure.
    Permission,
    /// The item itself is malformed.
    Validation,
    /// The item exceeds a size limit.
    TooLarge,
    /// The run was cancelled before or while the item was handled.
    Cancelled,
    /// Uncategorized.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::RateLimit,
        ErrorKind::Permission,
        ErrorKind::Validation,
        ErrorKind::TooLarge,
        ErrorKind::Cancelled,
        ErrorKind::Unknown,
    ];

    /// Whether another attempt may succeed.
    ///
    /// Unknown errors are retried conservatively within the normal budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::RateLimit | Self::Unknown
        )
    }

    /// Whether the item ends `skipped` rather than `failed`.
    pub fn skips_item(&self) -> bool {
        matches!(self, Self::Validation | Self::TooLarge)
    }

    /// Stable name used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Permission => "permission",
            Self::Validation => "validation",
            Self::TooLarge => "too_large",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Human-readable prefix used when rendering an [`ItemError`].
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timed out",
            Self::Network => "network error",
            Self::RateLimit => "rate limited",
            Self::Permission => "permission denied",
            Self::Validation => "validation failed",
            Self::TooLarge => "too large",
            Self::Cancelled => "aborted by caller",
            Self::Unknown => "error",
        }
    }

    /// Determine the kind from an HTTP status code.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Permission,
            408 | 504 => Self::Timeout,
            413 => Self::TooLarge,
            429 => Self::RateLimit,
            400 | 404 | 409 | 415 | 422 => Self::Validation,
            500..=599 => Self::Network,
            _ => Self::Unknown,
        }
    }

    /// Best-effort classification of an untyped error message.
    ///
    /// Used for collaborators that only hand back text (CLI tools, SDK
    /// errors rendered to strings). A standalone HTTP error status in the
    /// message decides the kind; otherwise keywords are matched at word
    /// boundaries, so ids such as `item-4130` or `403999` are ignored.
    pub fn classify(message: &str) -> Self {
        let words: Vec<String> = message
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        let status = words
            .iter()
            .filter(|w| w.len() == 3)
            .filter_map(|w| w.parse::<u16>().ok())
            .filter(|code| (400..=599).contains(code))
            .map(Self::from_http_status)
            .find(|kind| *kind != Self::Unknown);
        if let Some(kind) = status {
            return kind;
        }

        // each phrase matches consecutive words, each word by prefix
        let has = |phrases: &[&str]| {
            phrases.iter().any(|phrase| {
                let parts: Vec<&str> = phrase.split(' ').collect();
                words
                    .windows(parts.len())
                    .any(|w| w.iter().zip(&parts).all(|(word, p)| word.starts_with(p)))
            })
        };

        if has(&[
            "too large",
            "file size",
            "size limit",
            "exceeds maximum",
            "exceeds the maximum",
            "exceeds limit",
        ]) {
            Self::TooLarge
        } else if has(&["rate limit", "too many requests", "quota"]) {
            Self::RateLimit
        } else if has(&["timeout", "timed out", "deadline"]) {
            Self::Timeout
        } else if has(&["permission", "forbidden", "unauthorized", "access denied"]) {
            Self::Permission
        } else if has(&["cancelled", "canceled", "aborted"]) {
            Self::Cancelled
        } else if has(&[
            "network",
            "connection",
            "dns",
            "unreachable",
            "econnreset",
            "socket",
        ]) {
            Self::Network
        } else if has(&["invalid", "validation", "malformed", "unsupported"]) {
            Self::Validation
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Serialization(format!("unknown error kind: {s}")))
    }
}

/// Typed failure returned by an item processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
    /// Server-supplied wait hint, honoured by the retry policy and the rate
    /// limiter.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl ItemError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Build an error whose kind is inferred from the message text.
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::classify(&message), message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Size pre-check failure.
    pub fn too_large(size_bytes: i64, limit_bytes: i64) -> Self {
        Self::new(
            ErrorKind::TooLarge,
            format!("payload is {size_bytes} bytes, limit is {limit_bytes} bytes"),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Attach a retry-after hint.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for ItemError {}

impl From<Error> for ItemError {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Database(_) => ErrorKind::Network,
            Error::InvalidInput(_) => ErrorKind::Validation,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            _ => ErrorKind::Unknown,
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_non_retryable_kinds() {
        assert!(!ErrorKind::Permission.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::TooLarge.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_skip_kinds() {
        assert!(ErrorKind::Validation.skips_item());
        assert!(ErrorKind::TooLarge.skips_item());
        assert!(!ErrorKind::Permission.skips_item());
        assert!(!ErrorKind::Network.skips_item());
    }

    #[test]
    fn test_from_http_status() {
        assert_eq!(ErrorKind::from_http_status(401), ErrorKind::Permission);
        assert_eq!(ErrorKind::from_http_status(403), ErrorKind::Permission);
        assert_eq!(ErrorKind::from_http_status(408), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_http_status(413), ErrorKind::TooLarge);
        assert_eq!(ErrorKind::from_http_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_http_status(422), ErrorKind::Validation);
        assert_eq!(ErrorKind::from_http_status(503), ErrorKind::Network);
        assert_eq!(ErrorKind::from_http_status(418), ErrorKind::Unknown);
    }

    #[test]
    fn test_classify_messages() {
        assert_eq!(
            ErrorKind::classify("File too large for processing"),
            ErrorKind::TooLarge
        );
        assert_eq!(
            ErrorKind::classify("HTTP 429 Too Many Requests"),
            ErrorKind::RateLimit
        );
        assert_eq!(
            ErrorKind::classify("request timed out after 30s"),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorKind::classify("The user does not have permission"),
            ErrorKind::Permission
        );
        assert_eq!(
            ErrorKind::classify("connection reset by peer"),
            ErrorKind::Network
        );
        assert_eq!(
            ErrorKind::classify("invalid mime type"),
            ErrorKind::Validation
        );
        assert_eq!(ErrorKind::classify("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn test_classify_ignores_codes_and_words_inside_identifiers() {
        assert_eq!(
            ErrorKind::classify("item 4130-abc not found in cache"),
            ErrorKind::Unknown
        );
        assert_eq!(ErrorKind::classify("record id 403999"), ErrorKind::Unknown);
        assert_eq!(ErrorKind::classify("checksum exceeds8 mismatch"), ErrorKind::Unknown);
        assert_eq!(
            ErrorKind::classify("upload to bucket-429x stalled: connection reset"),
            ErrorKind::Network
        );
    }

    #[test]
    fn test_classify_status_codes_and_phrases() {
        assert_eq!(
            ErrorKind::classify("HTTP 413 Payload Too Large"),
            ErrorKind::TooLarge
        );
        assert_eq!(ErrorKind::classify("status=401"), ErrorKind::Permission);
        assert_eq!(
            ErrorKind::classify("upstream returned 503, connection timeout"),
            ErrorKind::Network
        );
        assert_eq!(
            ErrorKind::classify("document exceeds maximum page count"),
            ErrorKind::TooLarge
        );
        assert_eq!(
            ErrorKind::classify("RATE_LIMIT_EXCEEDED"),
            ErrorKind::RateLimit
        );
        assert_eq!(
            ErrorKind::classify("Permissions missing for scope"),
            ErrorKind::Permission
        );
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_too_large_display_mentions_too_large() {
        let err = ItemError::too_large(2048, 1024);
        assert_eq!(err.kind, ErrorKind::TooLarge);
        assert!(err.to_string().contains("too large"));
        assert!(err.to_string().contains("2048"));
    }

    #[test]
    fn test_cancelled_display() {
        let err = ItemError::cancelled("run stopped");
        assert_eq!(err.to_string(), "aborted by caller: run stopped");
    }

    #[test]
    fn test_with_retry_after() {
        let err = ItemError::rate_limit("slow down").with_retry_after(Duration::from_secs(2));
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classified_constructor() {
        let err = ItemError::classified("403 Forbidden");
        assert_eq!(err.kind, ErrorKind::Permission);
        assert_eq!(err.message, "403 Forbidden");
    }

    #[test]
    fn test_from_engine_error() {
        let err: ItemError = Error::InvalidInput("bad row".into()).into();
        assert_eq!(err.kind, ErrorKind::Validation);

        let err: ItemError = Error::Internal("boom".into()).into();
        assert_eq!(err.kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_kind_serde_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RateLimit).unwrap();
        assert_eq!(json, "\"rate_limit\"");
    }
}
