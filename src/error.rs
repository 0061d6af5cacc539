//! Engine errors
//!
//! Errors are split by where they originate so callers can tell "your
//! configuration is invalid" apart from "the remote system rejected this
//! change". Validation errors are raised before any network call and carry
//! the attribute path; remote errors carry the HTTP status and URI.

use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors produced by the reconciliation engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// More than one derived-type variant is populated
    #[error("{path}: only one of [{}] may be set", variants.join(", "))]
    AmbiguousVariant {
        /// Attribute path of the union
        path: String,
        /// Names of every populated variant
        variants: Vec<String>,
    },

    /// A required union has no populated variant
    #[error("{path}: exactly one derived type must be set")]
    NoVariantSelected { path: String },

    /// The wire discriminant matches no declared variant
    #[error("{path}: unrecognized derived type '{discriminant}'")]
    UnknownDiscriminant { path: String, discriminant: String },

    /// Any other malformed desired value
    #[error("{path}: {message}")]
    Validation { path: String, message: String },

    /// The remote API answered with a non-success status
    #[error("{method} {uri} failed with status {status}: {message}")]
    Remote {
        status: u16,
        method: String,
        uri: String,
        message: String,
    },

    /// The entity does not exist remotely
    #[error("not found: {uri}")]
    NotFound { uri: String },

    /// Connection, timeout or body decoding failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A modify hook could not establish the entity's identity
    #[error("{resource}: identity discovery failed: {message}")]
    IdentityDiscovery { resource: String, message: String },

    /// A middleware or modify hook rejected the value
    #[error("{hook}: {message}")]
    Hook { hook: String, message: String },

    /// A fatal secondary write
    #[error("sub-action '{action}' failed: {source}")]
    SubAction {
        action: String,
        #[source]
        source: Box<EngineError>,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled before {step}")]
    Cancelled { step: String },

    /// No resource with that name is registered
    #[error("unknown resource type: {0}")]
    UnknownResource(String),

    /// A resource declaration is malformed
    #[error("invalid resource declaration: {0}")]
    Registry(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Top-level wrapper naming the resource and CRUD operation
    #[error("{operation} {resource}: {source}")]
    Operation {
        resource: String,
        operation: &'static str,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Wrap with resource and operation context (idempotent)
    pub fn in_operation(self, resource: &str, operation: &'static str) -> Self {
        match self {
            Self::Operation { .. } => self,
            other => Self::Operation {
                resource: resource.to_string(),
                operation,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &EngineError {
        match self {
            Self::Operation { source, .. } | Self::SubAction { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is a configuration problem detected before any network call
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            Self::AmbiguousVariant { .. }
                | Self::NoVariantSelected { .. }
                | Self::UnknownDiscriminant { .. }
                | Self::Validation { .. }
        )
    }

    /// HTTP status of a remote rejection, if any
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            Self::Remote { status, .. } => Some(*status),
            Self::NotFound { .. } => Some(404),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled { .. })
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
