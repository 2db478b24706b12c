//! Error taxonomy for the registry client family.
//!
//! Library code never prints; transport failures are logged at WARN with
//! method/URL/status and then raised.  Callers opt into tolerating absence
//! via the `absent_ok` flags on the individual operations, which turn
//! [`Error::NotFound`] (and only that variant) into `Ok(None)`.

use thiserror::Error;

/// Errors raised by reference parsing, auth negotiation and registry
/// transport.
#[derive(Debug, Error)]
pub enum Error {
    /// The image reference string does not follow OCI Distribution naming
    /// rules.  Caller error, never retried.
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// A manifest, blob or tag list was absent (HTTP 404).
    #[error("{kind} not found: {reference}")]
    NotFound { kind: &'static str, reference: String },

    /// Credential lookup or token exchange failed.  Not retried, except for
    /// the single delayed retry on HTTP 429 in the async client.
    #[error("authentication against {registry} failed: {reason}")]
    Auth { registry: String, reason: String },

    /// A computed digest disagrees with the declared one.  Always fatal to
    /// the calling operation.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// 5xx or connection-level failure that survived the bounded retries.
    #[error("transient error after {attempts} attempts for {method} {url}: {reason}")]
    Transient {
        method: &'static str,
        url: String,
        attempts: u32,
        reason: String,
    },

    /// Any other non-2xx registry response.
    #[error("{method} {url} returned HTTP {status}")]
    Http {
        method: &'static str,
        url: String,
        status: u16,
    },

    /// Response body could not be decoded.
    #[error("malformed registry response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, reference: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            reference: reference.into(),
        }
    }

    /// True for errors the transport layer retries a bounded number of
    /// times before giving up.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient { .. } => true,
            Error::Http { status, .. } => *status >= 500,
            Error::Request(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }

    /// True if this error means "the thing is absent", which `absent_ok`
    /// call sites convert to `Ok(None)`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Maps a `Result` carrying a potentially-absent value according to the
/// `absent_ok` convention.
pub(crate) fn absent<T>(result: Result<T>, absent_ok: bool) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if absent_ok && err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}
