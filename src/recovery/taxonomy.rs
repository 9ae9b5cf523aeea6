//! Failure taxonomy for language-model provider calls

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad class of a provider failure; selects the recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    RateLimit,
    Network,
    Model,
    Request,
    Configuration,
    Generic,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::Authentication,
        ErrorCategory::RateLimit,
        ErrorCategory::Network,
        ErrorCategory::Model,
        ErrorCategory::Request,
        ErrorCategory::Configuration,
        ErrorCategory::Generic,
    ];

    /// One actionable sentence for the end user
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::Authentication => {
                "The assistant could not authenticate with its language model provider, please check the API credentials."
            }
            ErrorCategory::RateLimit => {
                "The assistant is temporarily rate-limited, please retry shortly."
            }
            ErrorCategory::Network => {
                "The assistant could not reach its language model provider, please check the connection and try again."
            }
            ErrorCategory::Model => {
                "The language model failed to produce a response, please try again."
            }
            ErrorCategory::Request => {
                "The request could not be processed, please rephrase or shorten it."
            }
            ErrorCategory::Configuration => {
                "The assistant is misconfigured, please check the provider and model settings."
            }
            ErrorCategory::Generic => "Something went wrong, please try again.",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::RateLimit => write!(f, "rate_limit"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Model => write!(f, "model"),
            ErrorCategory::Request => write!(f, "request"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Generic => write!(f, "generic"),
        }
    }
}

/// A failure raised by the language-model collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        /// Provider hint for how long to wait
        retry_after: Option<Duration>,
    },

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Context length exceeded: {0}")]
    ContextLength(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Content policy violation: {0}")]
    ContentPolicy(String),

    #[error("Could not parse provider response: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Classify an HTTP status returned by the provider
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Authentication(body),
            402 => Self::QuotaExceeded(body),
            408 => Self::Timeout(body),
            413 => Self::ContextLength(body),
            429 => Self::rate_limit(body, None),
            400 | 404 | 422 => Self::InvalidRequest(body),
            500 => Self::Model(body),
            502..=504 | 529 => Self::ServiceUnavailable(body),
            _ => Self::Other(format!("HTTP {}: {}", status, body)),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LlmError::Authentication(_) => ErrorCategory::Authentication,
            LlmError::RateLimit { .. } | LlmError::QuotaExceeded(_) => ErrorCategory::RateLimit,
            LlmError::Network(_) | LlmError::Timeout(_) | LlmError::ServiceUnavailable(_) => {
                ErrorCategory::Network
            }
            LlmError::Model(_) => ErrorCategory::Model,
            LlmError::ContextLength(_)
            | LlmError::InvalidRequest(_)
            | LlmError::ContentPolicy(_)
            | LlmError::Parse(_) => ErrorCategory::Request,
            LlmError::Configuration(_) | LlmError::Provider(_) => ErrorCategory::Configuration,
            LlmError::Other(_) => ErrorCategory::Generic,
        }
    }

    /// Attach a Retry-After hint; only rate limits carry one
    pub fn with_retry_after(self, hint: Option<Duration>) -> Self {
        match self {
            LlmError::RateLimit { message, retry_after } => LlmError::RateLimit {
                message,
                retry_after: hint.or(retry_after),
            },
            other => other,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// User-facing sentence for this kind of failure
    pub fn user_message(&self) -> &'static str {
        match self {
            LlmError::QuotaExceeded(_) => {
                "The assistant has used up its provider quota, please check the billing plan."
            }
            LlmError::Timeout(_) => {
                "The language model took too long to respond, please try again."
            }
            LlmError::ServiceUnavailable(_) => {
                "The language model service is currently unavailable, please try again later."
            }
            LlmError::ContextLength(_) => {
                "The conversation is too long for the model, please start a new one or shorten the message."
            }
            LlmError::ContentPolicy(_) => {
                "The request was blocked by the provider's content policy, please rephrase it."
            }
            LlmError::Parse(_) => {
                "The language model returned a response that could not be read, please try again."
            }
            LlmError::Provider(_) => {
                "The configured language model provider is not supported, please check the settings."
            }
            other => other.category().user_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_categories() {
        let cases = [
            (LlmError::QuotaExceeded("q".into()), ErrorCategory::RateLimit),
            (LlmError::Timeout("t".into()), ErrorCategory::Network),
            (LlmError::ServiceUnavailable("s".into()), ErrorCategory::Network),
            (LlmError::ContextLength("c".into()), ErrorCategory::Request),
            (LlmError::ContentPolicy("c".into()), ErrorCategory::Request),
            (LlmError::Provider("p".into()), ErrorCategory::Configuration),
            (LlmError::Other("o".into()), ErrorCategory::Generic),
        ];
        for (error, category) in cases {
            assert_eq!(error.category(), category, "{}", error);
        }
    }

    #[test]
    fn status_codes_classify() {
        assert_eq!(LlmError::from_status(401, "").category(), ErrorCategory::Authentication);
        assert_eq!(LlmError::from_status(429, "").category(), ErrorCategory::RateLimit);
        assert_eq!(LlmError::from_status(503, "").category(), ErrorCategory::Network);
        assert_eq!(LlmError::from_status(400, "").category(), ErrorCategory::Request);
        assert_eq!(LlmError::from_status(418, "").category(), ErrorCategory::Generic);
    }

    #[test]
    fn retry_after_hint_sticks_to_rate_limits_only() {
        let hint = Some(Duration::from_secs(7));
        let limited = LlmError::from_status(429, "busy").with_retry_after(hint);
        assert_eq!(limited.retry_after(), hint);
        let unavailable = LlmError::from_status(503, "down").with_retry_after(hint);
        assert_eq!(unavailable.retry_after(), None);
        assert_eq!(unavailable.category(), ErrorCategory::Network);
    }

    #[test]
    fn every_kind_has_a_message() {
        for category in ErrorCategory::ALL {
            assert!(!category.user_message().is_empty());
        }
        let error = LlmError::rate_limit("slow down", Some(Duration::from_secs(3)));
        assert_eq!(error.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(error.user_message(), ErrorCategory::RateLimit.user_message());
    }
}
