//! Error types and handling for Heliograph
//!
//! This module defines the error types used throughout the engine,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Heliograph operations
pub type Result<T> = std::result::Result<T, HeliographError>;

/// Main error type for Heliograph
#[derive(Debug, Error)]
pub enum HeliographError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Transient network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Remote API errors, including an exhausted retry budget
    #[error("API error: {message}")]
    Api { message: String },

    /// The remote service is busy and mandated a cooldown
    #[error("Rate limited: retry after {cooldown_secs}s")]
    RateLimited { cooldown_secs: u64 },

    /// Authentication/authorization failures, fatal until credentials change
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// The daily API quota for a credential is spent
    #[error("API quota exhausted for credential {credential}")]
    QuotaExhausted { credential: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// No cached data exists and the initial fetch failed
    #[error("No forecast cache available: {message}")]
    CacheUnavailable { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl HeliographError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        HeliographError::Config {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        HeliographError::Io {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        HeliographError::Network {
            message: message.into(),
        }
    }

    /// Create a new API error
    pub fn api<S: Into<String>>(message: S) -> Self {
        HeliographError::Api {
            message: message.into(),
        }
    }

    /// Create a new rate-limited error with the mandated cooldown
    pub fn rate_limited(cooldown_secs: u64) -> Self {
        HeliographError::RateLimited { cooldown_secs }
    }

    /// Create a new auth error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        HeliographError::Auth {
            message: message.into(),
        }
    }

    /// Create a new quota-exhausted error for a credential
    pub fn quota_exhausted<S: Into<String>>(credential: S) -> Self {
        HeliographError::QuotaExhausted {
            credential: credential.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        HeliographError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new cache-unavailable error
    pub fn cache_unavailable<S: Into<String>>(message: S) -> Self {
        HeliographError::CacheUnavailable {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        HeliographError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        HeliographError::Generic {
            message: message.into(),
        }
    }

    /// Whether a fetch attempt hitting this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HeliographError::Network { .. }
                | HeliographError::Timeout { .. }
                | HeliographError::RateLimited { .. }
        )
    }
}

impl From<std::io::Error> for HeliographError {
    fn from(err: std::io::Error) -> Self {
        HeliographError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HeliographError {
    fn from(err: serde_yaml::Error) -> Self {
        HeliographError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HeliographError {
    fn from(err: serde_json::Error) -> Self {
        HeliographError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for HeliographError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HeliographError::timeout(err.to_string())
        } else {
            HeliographError::network(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for HeliographError {
    fn from(err: chrono::ParseError) -> Self {
        HeliographError::validation("datetime", &err.to_string())
    }
}
