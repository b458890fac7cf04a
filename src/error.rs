use hyper::StatusCode;
use std::fmt;
use thiserror::Error;

/// Why an outbound fetch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    /// The overall request deadline elapsed
    Timeout,
    /// TCP connect or TLS handshake failed
    Connect,
    /// Any other transport-level failure
    Transport,
    /// Reading the response body failed
    Body,
    /// The outbound request could not be built
    InvalidRequest,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Timeout => write!(f, "timeout"),
            FetchFailure::Connect => write!(f, "connect"),
            FetchFailure::Transport => write!(f, "transport"),
            FetchFailure::Body => write!(f, "body"),
            FetchFailure::InvalidRequest => write!(f, "invalid request"),
        }
    }
}

/// Main error type for the forward proxy
///
/// Cloneable so a single origin failure can be fanned out to every
/// request waiting on the same cache key.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Client sent something we cannot act on
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// Nothing is served at this location
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Origin fetch failed
    #[error("Fetch failed for {target} ({kind}): {message}")]
    FetchFailed {
        target: String,
        kind: FetchFailure,
        message: String,
    },

    /// CONNECT tunnel could not be established
    #[error("Tunnel error to {target}: {message}")]
    Tunnel { target: String, message: String },

    /// The client connection cannot be turned into a raw byte pipe
    #[error("Hijacking not supported: {message}")]
    HijackUnsupported { message: String },

    /// Cache storage errors
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    /// IO related errors
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a fetch failure for the given target URL
    pub fn fetch_failed<T: Into<String>, S: Into<String>>(
        target: T,
        kind: FetchFailure,
        message: S,
    ) -> Self {
        Self::FetchFailed {
            target: target.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn tunnel<T: Into<String>, S: Into<String>>(target: T, message: S) -> Self {
        Self::Tunnel {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn hijack_unsupported<S: Into<String>>(message: S) -> Self {
        Self::HijackUnsupported {
            message: message.into(),
        }
    }

    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn bind<A: Into<String>, S: Into<String>>(addr: A, message: S) -> Self {
        Self::Bind {
            addr: addr.into(),
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status the client sees when a request ends with this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ProxyError::NotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::FetchFailed { .. } | ProxyError::Tunnel { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the fetch failed because its deadline elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProxyError::FetchFailed {
                kind: FetchFailure::Timeout,
                ..
            }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ProxyError::Config { .. } => ErrorSeverity::Critical,
            ProxyError::Bind { .. } => ErrorSeverity::Critical,
            ProxyError::Internal { .. } => ErrorSeverity::High,
            ProxyError::HijackUnsupported { .. } => ErrorSeverity::High,
            ProxyError::Io { .. } => ErrorSeverity::Medium,
            ProxyError::Cache { .. } => ErrorSeverity::Medium,
            ProxyError::FetchFailed { .. } => ErrorSeverity::Medium,
            ProxyError::Tunnel { .. } => ErrorSeverity::Medium,
            ProxyError::BadRequest { .. } => ErrorSeverity::Low,
            ProxyError::NotFound { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::io(err.to_string())
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::config(format!("TOML parsing error: {}", err))
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::internal(format!("HTTP error: {}", err))
    }
}
