//! Async OCI Distribution transport client.
//!
//! Speaks the registry HTTP API (manifests, blobs, tags, chunked uploads)
//! with bearer/basic authentication negotiated per registry.  The blocking
//! mirror of this contract lives in [`crate::blocking`]; both share the
//! reference parsing, URL construction and auth state-machine shape, but
//! keep independent token caches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use futures::TryStreamExt;
use log::{debug, warn};
use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::auth::{
    parse_challenge, scope_for, AuthContext, AuthScheme, CredentialsSource, Privilege,
    TokenCache, TokenResponse,
};
use crate::error::{absent, Error, Result};
use crate::reference::ImageReference;

/// Accept header values for manifest requests, covering both Docker and OCI
/// flavours of single-arch and multi-arch manifests.
pub const MANIFEST_ACCEPT: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

/// Media types identifying a multi-arch image index / manifest list.
pub const INDEX_MEDIA_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];

/// Scheme selection per registry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Protocol {
    Http,
    #[default]
    Https,
    /// Https everywhere except the listed hosts (local test registries).
    HttpsExcept(Vec<String>),
}

impl Protocol {
    pub(crate) fn scheme_for(&self, registry: &str) -> &str {
        match self {
            Protocol::Https => "https",
            Protocol::Http => "http",
            Protocol::HttpsExcept(exceptions) => {
                if exceptions.iter().any(|e| e == registry) {
                    "http"
                } else {
                    "https"
                }
            }
        }
    }
}

/// Transport client configuration.  All thresholds that encode
/// registry-specific workarounds are plain fields here rather than
/// constants, so deployments can validate them against their registries.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub protocol: Protocol,
    /// Per-call timeout of the underlying HTTP client.
    pub timeout: Duration,
    /// Payloads of this size or larger are uploaded chunked.
    pub chunk_threshold: usize,
    /// Size of each PATCH chunk in a chunked upload.
    pub chunk_size: usize,
    /// Whether to send the finalizing PUT after the last PATCH of a chunked
    /// upload.  The distribution spec requires it, but registries in the
    /// wild reject or no-op it, so the default is off.
    pub finalize_chunked_upload: bool,
    /// Bounded retry count for 5xx / connection errors.
    pub transient_retries: u32,
    /// Delay before the single retry of a rate-limited (429) token exchange.
    pub auth_ratelimit_retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            protocol: Protocol::default(),
            timeout: Duration::from_secs(121),
            chunk_threshold: 1024 * 1024,
            chunk_size: 1024 * 1024,
            finalize_chunked_upload: false,
            transient_retries: 3,
            auth_ratelimit_retry_delay: Duration::from_secs(60),
        }
    }
}

/// A manifest response: raw bytes plus the trusted server metadata.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub bytes: Bytes,
    pub media_type: Option<String>,
    pub digest: String,
}

impl RawManifest {
    /// Parses the payload as a single-arch image manifest.
    pub fn to_image_manifest(&self) -> Result<oci_spec::image::ImageManifest> {
        serde_json::from_slice(&self.bytes).map_err(|err| Error::MalformedResponse {
            url: self.digest.clone(),
            reason: format!("not an image manifest: {err}"),
        })
    }

    /// Parses the payload as a multi-arch image index.
    pub fn to_image_index(&self) -> Result<oci_spec::image::ImageIndex> {
        serde_json::from_slice(&self.bytes).map_err(|err| Error::MalformedResponse {
            url: self.digest.clone(),
            reason: format!("not an image index: {err}"),
        })
    }

    /// True if the media type (or, failing that, the payload) identifies a
    /// multi-arch image index.
    pub fn is_index(&self) -> bool {
        if let Some(media_type) = &self.media_type {
            return INDEX_MEDIA_TYPES.contains(&media_type.as_str());
        }
        serde_json::from_slice::<serde_json::Value>(&self.bytes)
            .ok()
            .and_then(|v| v.get("mediaType").and_then(|m| m.as_str().map(String::from)))
            .is_some_and(|m| INDEX_MEDIA_TYPES.contains(&m.as_str()))
    }
}

/// Result of a HEAD request against a manifest or blob.
#[derive(Debug, Clone)]
pub struct HeadResult {
    pub digest: Option<String>,
    pub size: Option<u64>,
    pub media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[allow(dead_code)]
    name: String,
    tags: Option<Vec<String>>,
}

/// Async OCI registry client.
///
/// Token cache and negotiated-scheme memo are per instance; the instance is
/// safe to share across tasks of one runtime but is not documented as safe
/// across event loops.
pub struct Client {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
    tokens: TokenCache,
    schemes: Mutex<HashMap<String, AuthScheme>>,
    credentials: Option<Arc<dyn CredentialsSource>>,
    // one pending completion event per target reference, so concurrent
    // uploads of the same content-addressed target happen at most once
    uploads: tokio::sync::Mutex<HashMap<String, watch::Receiver<bool>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Client {
            config: Arc::new(config),
            http,
            tokens: TokenCache::new(),
            schemes: Mutex::new(HashMap::new()),
            credentials: None,
            uploads: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialsSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ---- URL construction -------------------------------------------------

    fn base_url(&self, image: &ImageReference) -> String {
        format!(
            "{}://{}",
            self.config.protocol.scheme_for(image.registry()),
            image.registry()
        )
    }

    pub(crate) fn manifest_url(&self, image: &ImageReference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(image),
            image.repository(),
            image.target()
        )
    }

    pub(crate) fn blob_url(&self, image: &ImageReference, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(image),
            image.repository(),
            digest
        )
    }

    pub(crate) fn upload_url(&self, image: &ImageReference) -> String {
        format!(
            "{}/v2/{}/blobs/uploads/",
            self.base_url(image),
            image.repository()
        )
    }

    pub(crate) fn tags_url(&self, image: &ImageReference) -> String {
        format!(
            "{}/v2/{}/tags/list",
            self.base_url(image),
            image.repository()
        )
    }

    // ---- authentication ---------------------------------------------------

    fn remembered_scheme(&self, registry: &str) -> Option<AuthScheme> {
        #[allow(clippy::unwrap_used)]
        let schemes = self.schemes.lock().unwrap();
        schemes.get(registry).cloned()
    }

    fn remember_scheme(&self, registry: &str, scheme: AuthScheme) {
        #[allow(clippy::unwrap_used)]
        self.schemes
            .lock()
            .unwrap()
            .insert(registry.to_string(), scheme);
    }

    /// Resolves the [`AuthContext`] for an image at the requested privilege,
    /// negotiating the scheme and exchanging a bearer token as needed.  A
    /// cached, still-valid token short-circuits without any network call.
    pub async fn authenticate(
        &self,
        image: &ImageReference,
        privilege: Privilege,
    ) -> Result<AuthContext> {
        let scope = scope_for(image, privilege);
        if let Some(token) = self.tokens.get(&scope) {
            return Ok(AuthContext::Bearer(token.token));
        }

        let scheme = match self.remembered_scheme(image.registry()) {
            Some(scheme) => scheme,
            None => {
                let scheme = self.probe_scheme(image).await?;
                self.remember_scheme(image.registry(), scheme.clone());
                scheme
            }
        };

        let credentials = self
            .credentials
            .as_ref()
            .and_then(|source| source.credentials(image, privilege));

        match scheme {
            AuthScheme::None => Ok(AuthContext::Anonymous),
            AuthScheme::Basic => Ok(match credentials {
                Some(credentials) => AuthContext::Basic(credentials),
                None => AuthContext::Anonymous,
            }),
            AuthScheme::Bearer { realm, service } => {
                let token = self
                    .fetch_token(image, &realm, service.as_deref(), &scope, credentials)
                    .await?;
                self.tokens.insert(token.clone());
                Ok(AuthContext::Bearer(token.token))
            }
        }
    }

    /// Unauthenticated probe of the registry's base API endpoint, reading
    /// the `WWW-Authenticate` challenge.
    async fn probe_scheme(&self, image: &ImageReference) -> Result<AuthScheme> {
        let url = format!("{}/v2/", self.base_url(image));
        let response = self.http.get(&url).send().await?;
        match response.headers().get(WWW_AUTHENTICATE) {
            None => Ok(AuthScheme::None),
            Some(header) => {
                let header = header.to_str().map_err(|_| Error::Auth {
                    registry: image.registry().to_string(),
                    reason: "non-ASCII WWW-Authenticate header".to_string(),
                })?;
                parse_challenge(header)
            }
        }
    }

    async fn fetch_token(
        &self,
        image: &ImageReference,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: Option<crate::auth::Credentials>,
    ) -> Result<crate::auth::OauthToken> {
        let mut rate_limited_retry_done = false;
        loop {
            let mut request = self.http.get(realm).query(&[("scope", scope)]);
            if let Some(service) = service {
                request = request.query(&[("service", service)]);
            }
            if let Some(credentials) = &credentials {
                request = request.basic_auth(
                    credentials.username.clone(),
                    Some(credentials.password.clone()),
                );
            }
            let response = request.send().await?;
            match response.status() {
                StatusCode::OK => {
                    let parsed: TokenResponse = response.json().await?;
                    return parsed.into_token(scope, image.registry());
                }
                StatusCode::TOO_MANY_REQUESTS if !rate_limited_retry_done => {
                    // quota exceeded: one delayed retry before propagating
                    warn!(
                        "token exchange for {} rate-limited, retrying in {:?}",
                        image.registry(),
                        self.config.auth_ratelimit_retry_delay
                    );
                    tokio::time::sleep(self.config.auth_ratelimit_retry_delay).await;
                    rate_limited_retry_done = true;
                }
                status => {
                    let reason = response.text().await.unwrap_or_default();
                    return Err(Error::Auth {
                        registry: image.registry().to_string(),
                        reason: format!("token exchange returned HTTP {status}: {reason}"),
                    });
                }
            }
        }
    }

    // ---- request plumbing -------------------------------------------------

    /// Issues a request with auth applied, retrying transient failures a
    /// bounded number of times.  Non-2xx responses are logged at WARN and
    /// raised; 404 maps to [`Error::NotFound`] with the given kind.
    async fn send(
        &self,
        method: Method,
        url: &str,
        image: &ImageReference,
        privilege: Privilege,
        not_found_kind: &'static str,
        configure: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let method_name = method_name(&method);
        let auth = self.authenticate(image, privilege).await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.http.request(method.clone(), url);
            if let Some(value) = auth.header_value() {
                request = request.header("Authorization", value);
            }
            let result = configure(request).send().await;
            let retryable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(err) => err.is_connect() || err.is_timeout(),
            };
            if retryable && attempt <= self.config.transient_retries {
                debug!("{method_name} {url}: transient failure, attempt {attempt}");
                continue;
            }
            let response = result?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            warn!("{method_name} {url} returned HTTP {status}");
            if status == StatusCode::NOT_FOUND {
                return Err(Error::not_found(not_found_kind, image.to_string()));
            }
            if status.is_server_error() {
                return Err(Error::Transient {
                    method: method_name,
                    url: url.to_string(),
                    attempts: attempt,
                    reason: format!("HTTP {status}"),
                });
            }
            return Err(Error::Http {
                method: method_name,
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
    }

    // ---- manifests --------------------------------------------------------

    /// Fetches a manifest.  `accept` defaults to [`MANIFEST_ACCEPT`].
    pub async fn manifest(
        &self,
        image: &ImageReference,
        accept: Option<&[&str]>,
    ) -> Result<RawManifest> {
        let url = self.manifest_url(image);
        let accept = accept.unwrap_or(MANIFEST_ACCEPT).join(", ");
        let response = self
            .send(Method::GET, &url, image, Privilege::ReadOnly, "manifest", |r| {
                r.header("Accept", accept.clone())
            })
            .await?;
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;
        Ok(RawManifest {
            digest: digest_from_headers(&headers, Some(&bytes)),
            media_type: header_str(&headers, "Content-Type"),
            bytes,
        })
    }

    /// Like [`Self::manifest`] but tolerating absence.
    pub async fn manifest_opt(
        &self,
        image: &ImageReference,
        accept: Option<&[&str]>,
    ) -> Result<Option<RawManifest>> {
        absent(self.manifest(image, accept).await, true)
    }

    /// HEAD request against a manifest; `Ok(None)` if absent.
    pub async fn head_manifest(&self, image: &ImageReference) -> Result<Option<HeadResult>> {
        let url = self.manifest_url(image);
        let accept = MANIFEST_ACCEPT.join(", ");
        let result = self
            .send(Method::HEAD, &url, image, Privilege::ReadOnly, "manifest", |r| {
                r.header("Accept", accept.clone())
            })
            .await;
        match result {
            Ok(response) => {
                let headers = response.headers();
                Ok(Some(HeadResult {
                    digest: header_str(headers, "Docker-Content-Digest"),
                    size: header_str(headers, "Content-Length")
                        .and_then(|v| v.parse().ok()),
                    media_type: header_str(headers, "Content-Type"),
                }))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Uploads a manifest under the reference's tag or digest.
    pub async fn put_manifest(
        &self,
        image: &ImageReference,
        media_type: &str,
        manifest: Vec<u8>,
    ) -> Result<()> {
        let url = self.manifest_url(image);
        self.send(Method::PUT, &url, image, Privilege::ReadWrite, "manifest", |r| {
            r.header("Content-Type", media_type.to_string())
                .body(manifest.clone())
        })
        .await?;
        Ok(())
    }

    /// Deletes a manifest.
    ///
    /// Deleting by symbolic tag only untags; the manifest stays reachable
    /// through other tags or its digest.  Deleting by digest removes it
    /// outright and fails while other tags still reference it.  With
    /// `purge`, a symbolic-tag delete is followed by a delete of the
    /// resolved digest, and that second call's failure is swallowed: purge
    /// is best-effort by design.
    pub async fn delete_manifest(&self, image: &ImageReference, purge: bool) -> Result<()> {
        let digest = if purge && !image.tag().is_digest() {
            self.head_manifest(image)
                .await?
                .and_then(|head| head.digest)
        } else {
            None
        };

        let url = self.manifest_url(image);
        self.send(Method::DELETE, &url, image, Privilege::ReadWrite, "manifest", |r| r)
            .await?;

        if let Some(digest) = digest {
            let by_digest = image.with_digest(digest);
            let url = self.manifest_url(&by_digest);
            if let Err(err) = self
                .send(Method::DELETE, &url, &by_digest, Privilege::ReadWrite, "manifest", |r| r)
                .await
            {
                // other tags may still reference the digest
                debug!("purge of {by_digest} skipped: {err}");
            }
        }
        Ok(())
    }

    // ---- blobs ------------------------------------------------------------

    /// Streams a blob's bytes.
    pub async fn blob(
        &self,
        image: &ImageReference,
        digest: &str,
    ) -> Result<impl Stream<Item = std::io::Result<Bytes>>> {
        let url = self.blob_url(image, digest);
        let response = self
            .send(Method::GET, &url, image, Privilege::ReadOnly, "blob", |r| r)
            .await?;
        Ok(response.bytes_stream().map_err(std::io::Error::other))
    }

    /// Fetches a blob fully buffered and verifies its digest over the
    /// observed bytes.
    pub async fn blob_bytes(&self, image: &ImageReference, digest: &str) -> Result<Bytes> {
        let url = self.blob_url(image, digest);
        let response = self
            .send(Method::GET, &url, image, Privilege::ReadOnly, "blob", |r| r)
            .await?;
        let bytes = response.bytes().await?;
        let actual = sha256_digest(&bytes);
        if actual != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    /// HEAD request against a blob; `Ok(None)` if absent.
    pub async fn head_blob(
        &self,
        image: &ImageReference,
        digest: &str,
    ) -> Result<Option<HeadResult>> {
        let url = self.blob_url(image, digest);
        let result = self
            .send(Method::HEAD, &url, image, Privilege::ReadOnly, "blob", |r| r)
            .await;
        match result {
            Ok(response) => {
                let headers = response.headers();
                Ok(Some(HeadResult {
                    digest: header_str(headers, "Docker-Content-Digest")
                        .or_else(|| Some(digest.to_string())),
                    size: header_str(headers, "Content-Length")
                        .and_then(|v| v.parse().ok()),
                    media_type: header_str(headers, "Content-Type"),
                }))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Uploads a blob, deduplicating concurrent uploads of the same target.
    ///
    /// Payloads below the configured chunk threshold go through a single
    /// POST with the digest as a query parameter; larger payloads use a
    /// chunked upload session.  Returns the digest of the uploaded content.
    pub async fn put_blob(
        &self,
        image: &ImageReference,
        digest: &str,
        data: &[u8],
    ) -> Result<String> {
        let target = format!("{}@{digest}", image.ref_without_tag());

        // at-most-once concurrent upload per content-addressed target: late
        // joiners block on the in-flight upload's completion event
        let sender = loop {
            let mut uploads = self.uploads.lock().await;
            match uploads.get(&target) {
                Some(receiver) => {
                    let mut receiver = receiver.clone();
                    drop(uploads);
                    if *receiver.borrow() {
                        return Ok(digest.to_string());
                    }
                    if receiver.changed().await.is_ok() && *receiver.borrow() {
                        return Ok(digest.to_string());
                    }
                    // the uploading task failed; take over
                }
                None => {
                    let (sender, receiver) = watch::channel(false);
                    uploads.insert(target.clone(), receiver);
                    break sender;
                }
            }
        };

        let result = if data.len() < self.config.chunk_threshold {
            self.put_blob_single(image, digest, data).await
        } else {
            self.put_blob_chunked(image, digest, data).await
        };

        let mut uploads = self.uploads.lock().await;
        uploads.remove(&target);
        if result.is_ok() {
            let _ = sender.send(true);
        }
        result?;
        Ok(digest.to_string())
    }

    async fn put_blob_single(
        &self,
        image: &ImageReference,
        digest: &str,
        data: &[u8],
    ) -> Result<()> {
        let url = format!("{}?digest={digest}", self.upload_url(image));
        let body = data.to_vec();
        self.send(Method::POST, &url, image, Privilege::ReadWrite, "blob", |r| {
            r.header("Content-Type", "application/octet-stream")
                .header("Content-Length", body.len())
                .body(body.clone())
        })
        .await?;
        Ok(())
    }

    async fn put_blob_chunked(
        &self,
        image: &ImageReference,
        digest: &str,
        data: &[u8],
    ) -> Result<()> {
        let session_url = self.upload_url(image);
        let response = self
            .send(Method::POST, &session_url, image, Privilege::ReadWrite, "blob", |r| {
                r.header("Content-Length", 0)
            })
            .await?;
        let mut location = location_header(&response, image, &self.config.protocol)?;

        let mut hasher = Sha256::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let end = usize::min(offset + self.config.chunk_size, data.len());
            let chunk = &data[offset..end];
            hasher.update(chunk);
            let range = format!("{}-{}", offset, end - 1);
            let body = chunk.to_vec();
            let response = self
                .send(Method::PATCH, &location, image, Privilege::ReadWrite, "blob", |r| {
                    r.header("Content-Type", "application/octet-stream")
                        .header("Content-Length", body.len())
                        .header("Content-Range", range.clone())
                        .body(body.clone())
                })
                .await?;
            location = location_header(&response, image, &self.config.protocol)?;
            offset = end;
        }

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        // The spec mandates a trailing PUT to close the session, but
        // registries in practice reject or silently no-op it, so it is
        // skipped unless explicitly enabled.
        if self.config.finalize_chunked_upload {
            let url = format!(
                "{location}{}digest={digest}",
                if location.contains('?') { "&" } else { "?" }
            );
            self.send(Method::PUT, &url, image, Privilege::ReadWrite, "blob", |r| {
                r.header("Content-Length", 0)
            })
            .await?;
        }
        Ok(())
    }

    // ---- tags -------------------------------------------------------------

    /// Lists the repository's tags.
    pub async fn tags(&self, image: &ImageReference) -> Result<Vec<String>> {
        let url = self.tags_url(image);
        let response = self
            .send(Method::GET, &url, image, Privilege::ReadOnly, "repository", |r| r)
            .await?;
        let url = response.url().to_string();
        let parsed: TagList = response
            .json()
            .await
            .map_err(|err| Error::MalformedResponse {
                url,
                reason: err.to_string(),
            })?;
        Ok(parsed.tags.unwrap_or_default())
    }
}

// ---- shared helpers (also used by the blocking client) --------------------

pub(crate) fn method_name(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::HEAD => "HEAD",
        Method::PUT => "PUT",
        Method::POST => "POST",
        Method::PATCH => "PATCH",
        Method::DELETE => "DELETE",
        _ => "REQUEST",
    }
}

/// SHA-256 digest of a byte slice in `sha256:<hex>` form.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

pub(crate) fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Digest as trusted from the server header, falling back to a local
/// SHA-256 over the observed bytes.  Never recomputed speculatively.
pub(crate) fn digest_from_headers(headers: &HeaderMap, body: Option<&[u8]>) -> String {
    header_str(headers, "Docker-Content-Digest")
        .unwrap_or_else(|| sha256_digest(body.unwrap_or_default()))
}

/// The upload Location may be absolute or just a URL path.
pub(crate) fn location_header(
    response: &reqwest::Response,
    image: &ImageReference,
    protocol: &Protocol,
) -> Result<String> {
    let location =
        header_str(response.headers(), "Location").ok_or_else(|| Error::MalformedResponse {
            url: response.url().to_string(),
            reason: "upload session response carried no Location header".to_string(),
        })?;
    Ok(absolute_location(
        &location,
        image,
        protocol,
    ))
}

pub(crate) fn absolute_location(
    location: &str,
    image: &ImageReference,
    protocol: &Protocol,
) -> String {
    if location.starts_with('/') {
        format!(
            "{}://{}{}",
            protocol.scheme_for(image.registry()),
            image.registry(),
            location
        )
    } else {
        location.to_string()
    }
}
