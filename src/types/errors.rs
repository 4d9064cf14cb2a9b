//! Runtime error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Runtime result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error raised by listeners, middleware and service hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Return type of every user-supplied callback.
pub type HandlerResult = std::result::Result<(), BoxError>;

/// Main error enum for the runtime core.
#[derive(Error, Debug)]
pub enum Error {
    /// A state write violated a registered predicate, or a path is malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// A listener failed. Never returned to emitters; rendered into the
    /// `error` field of the system error payload.
    #[error("subscriber error on '{topic}': {message}")]
    Subscriber { topic: String, message: String },

    /// A required service failed to initialize.
    #[error("service '{service}' failed to initialize: {message}")]
    Dependency { service: String, message: String },

    /// The service graph contains a cycle.
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// A service depends on a name nobody registered.
    #[error("service '{service}' depends on unknown '{depends_on}'")]
    UnknownDependency { service: String, depends_on: String },

    /// A service name was registered twice.
    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    /// An optional service failed; startup continued without it.
    #[error("optional service '{service}' unavailable: {message}")]
    OptionalServiceFailure { service: String, message: String },

    /// Nested emission exceeded the configured depth.
    #[error("emit depth limit {limit} exceeded while emitting '{topic}'")]
    RecursionLimit { topic: String, limit: usize },

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn subscriber(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscriber {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// True for errors that describe a rejected state write.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}
