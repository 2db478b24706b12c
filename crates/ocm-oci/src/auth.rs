//! Registry authentication: scheme negotiation and token caching.
//!
//! The negotiation itself (the unauthenticated probe of `/v2/` and the token
//! round-trip against the challenge realm) lives with the transport clients,
//! because it is the only part that differs between the blocking and the
//! async implementation.  Everything transport-agnostic is here: challenge
//! parsing, scope construction, the credential lookup seam and the token
//! cache with its expiry margin.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use http_auth::parser::ChallengeParser;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::reference::ImageReference;

/// Tokens are considered invalid this long before their nominal expiry, as a
/// clock-skew safety margin.
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Fallback validity for token responses that do not carry `expires_in`.
/// 60 seconds is the minimum the distribution token spec permits.
const DEFAULT_TOKEN_VALIDITY: u64 = 60;

/// Privilege level a scope asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    ReadOnly,
    ReadWrite,
}

impl Privilege {
    /// Derives the privilege from the requested scope: anything containing a
    /// `push` action needs readwrite credentials.
    pub fn from_scope(scope: &str) -> Privilege {
        if scope
            .rsplit(':')
            .next()
            .is_some_and(|actions| actions.split(',').any(|a| a == "push"))
        {
            Privilege::ReadWrite
        } else {
            Privilege::ReadOnly
        }
    }
}

/// Builds the token scope for a repository at the given privilege.
pub fn scope_for(image: &ImageReference, privilege: Privilege) -> String {
    match privilege {
        Privilege::ReadOnly => format!("repository:{}:pull", image.repository()),
        Privilege::ReadWrite => format!("repository:{}:pull,push", image.repository()),
    }
}

/// Static credentials for a registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Value for an `Authorization: Basic` header.
    pub fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log the password
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Seam for looking up registry credentials for an image at a privilege
/// level.  Returning `None` means "proceed anonymously".
pub trait CredentialsSource: Send + Sync {
    fn credentials(&self, image: &ImageReference, privilege: Privilege) -> Option<Credentials>;
}

/// Credential lookup from a fixed per-registry table.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    by_registry: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, registry: impl Into<String>, credentials: Credentials) {
        self.by_registry
            .insert(registry.into().to_ascii_lowercase(), credentials);
    }
}

impl CredentialsSource for StaticCredentials {
    fn credentials(&self, image: &ImageReference, _privilege: Privilege) -> Option<Credentials> {
        self.by_registry
            .get(&image.registry().to_ascii_lowercase())
            .cloned()
    }
}

/// The authentication scheme a registry negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// OAuth bearer flow against the given realm.
    Bearer {
        realm: String,
        service: Option<String>,
    },
    /// HTTP Basic attached per-request, no token round-trip.
    Basic,
    /// Registry answered `/v2/` without a challenge.
    None,
}

/// Parses a `WWW-Authenticate` header value into the negotiated scheme.
pub fn parse_challenge(header: &str) -> Result<AuthScheme> {
    for challenge in ChallengeParser::new(header).flatten() {
        if challenge.scheme.eq_ignore_ascii_case("Bearer") {
            let mut realm = None;
            let mut service = None;
            for (key, value) in &challenge.params {
                if key.eq_ignore_ascii_case("realm") {
                    realm = Some(value.to_unescaped());
                } else if key.eq_ignore_ascii_case("service") {
                    service = Some(value.to_unescaped());
                }
            }
            let realm = realm.ok_or_else(|| Error::Auth {
                registry: String::new(),
                reason: "bearer challenge without realm".to_string(),
            })?;
            return Ok(AuthScheme::Bearer { realm, service });
        }
        if challenge.scheme.eq_ignore_ascii_case("Basic") {
            return Ok(AuthScheme::Basic);
        }
    }
    // An unparseable or unknown challenge degrades to basic auth.
    Ok(AuthScheme::Basic)
}

/// Wire shape of the token endpoint response.  Some token servers return
/// `token`, others `access_token`.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenResponse {
    pub(crate) fn into_token(self, scope: &str, registry: &str) -> Result<OauthToken> {
        let token = self
            .token
            .or(self.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Auth {
                registry: registry.to_string(),
                reason: "token response carried no token".to_string(),
            })?;
        Ok(OauthToken {
            token,
            scope: scope.to_string(),
            issued_at: Instant::now(),
            expires_in: self.expires_in.unwrap_or(DEFAULT_TOKEN_VALIDITY),
        })
    }
}

/// An issued bearer token, cached keyed by scope.
#[derive(Clone)]
pub struct OauthToken {
    pub token: String,
    pub scope: String,
    pub issued_at: Instant,
    pub expires_in: u64,
}

impl OauthToken {
    /// Valid until 30 seconds before nominal expiry.
    pub fn is_valid(&self) -> bool {
        self.issued_at.elapsed() + TOKEN_EXPIRY_MARGIN
            < Duration::from_secs(self.expires_in)
    }
}

impl fmt::Debug for OauthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OauthToken")
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Per-client-instance token cache, keyed by scope.  Expired entries are
/// purged lazily on the next lookup.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<String, OauthToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, scope: &str) -> Option<OauthToken> {
        #[allow(clippy::unwrap_used)]
        let mut tokens = self.tokens.lock().unwrap();
        tokens.retain(|_, token| token.is_valid());
        tokens.get(scope).cloned()
    }

    pub fn insert(&self, token: OauthToken) {
        #[allow(clippy::unwrap_used)]
        self.tokens
            .lock()
            .unwrap()
            .insert(token.scope.clone(), token);
    }
}

/// What a request should attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    Anonymous,
    Bearer(String),
    Basic(Credentials),
}

impl AuthContext {
    /// Value for the `Authorization` header, if any.
    pub fn header_value(&self) -> Option<String> {
        match self {
            AuthContext::Anonymous => None,
            AuthContext::Bearer(token) => Some(format!("Bearer {token}")),
            AuthContext::Basic(credentials) => Some(credentials.basic_header()),
        }
    }
}
