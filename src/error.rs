//! Central error types for the package operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use std::time::Duration;

use thiserror::Error;

/// Central error type for the package operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs that has no more specific mapping
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Object does not exist in the store
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Create was rejected because the name is taken
    #[error("Resource already exists: {kind}/{name} in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Write was rejected because the resourceVersion is stale
    #[error("Conflict writing {kind}/{name} in namespace {namespace}: object has been modified")]
    Conflict {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Two different slice contents hashed to the same name
    #[error("ObjectSlice collision with {namespace}/{name}")]
    SliceCollision { namespace: String, name: String },

    /// Read or watch that the dynamic cache refuses to serve
    #[error("Dynamic cache admission error: {0}")]
    CacheAdmission(String),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Spec validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Watch stream failure
    #[error("Watch error: {0}")]
    WatchError(String),

    /// Reconcile pass ran past its deadline
    #[error("Reconcile timed out after {0:?}")]
    Timeout(Duration),

    /// Any of the above, annotated with the step that failed
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wrap this error with a description of the failing operation
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context layers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self.root() {
            Error::AlreadyExists { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 && e.reason == "AlreadyExists",
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self.root() {
            Error::Conflict { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 && e.reason == "Conflict",
            _ => false,
        }
    }

    pub fn is_slice_collision(&self) -> bool {
        matches!(self.root(), Error::SliceCollision { .. })
    }

    /// Check if this error type should trigger a retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.root(),
            Error::KubeError(_)
                | Error::NotFound { .. }
                | Error::AlreadyExists { .. }
                | Error::Conflict { .. }
                | Error::WatchError(_)
                | Error::Timeout(_)
        )
    }

    /// Convert to a human-readable message for status updates
    pub fn status_message(&self) -> String {
        match self.root() {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::ValidationError(msg) => format!("Validation failed: {}", msg),
            Error::SliceCollision { namespace, name } => format!(
                "ObjectSlice name {}/{} is taken by different content",
                namespace, name
            ),
            _ => self.to_string(),
        }
    }
}

/// Attach operation context to errors, so operators can locate the failing step
pub trait ResultExt<T> {
    fn context(self, context: &str) -> Result<T>;

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().context(f()))
    }
}
