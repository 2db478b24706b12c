use thiserror::Error;

use crate::model::ComponentIdentity;

/// Errors raised by descriptor decoding, lookup resolution, graph traversal
/// and signing normalisation.
#[derive(Debug, Error)]
pub enum Error {
    /// A descriptor violates a model invariant (schema version, duplicate
    /// artifact identities, malformed repository context).
    #[error("invalid component descriptor: {reason}")]
    Model { reason: String },

    /// No lookup strategy could resolve the component version.
    #[error("component {identity} not found in any configured lookup")]
    ComponentNotFound { identity: ComponentIdentity },

    /// Traversal was asked to resolve references without a lookup.
    #[error("resolving component references requires a lookup (max_depth != 0)")]
    LookupRequired,

    /// The stored OCI artifact does not have the expected descriptor layout.
    #[error("malformed component-descriptor artifact: {reason}")]
    MalformedArtifact { reason: String },

    /// Computed normalisation digest disagrees with the declared one.
    #[error("descriptor digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error(transparent)]
    Oci(#[from] ocm_oci::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn model(reason: impl Into<String>) -> Self {
        Error::Model {
            reason: reason.into(),
        }
    }

    /// True if this error means "the component is absent", which `absent_ok`
    /// call sites convert to `Ok(None)`.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ComponentNotFound { .. } => true,
            Error::Oci(err) => err.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
