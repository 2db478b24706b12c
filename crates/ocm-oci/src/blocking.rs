//! Blocking OCI Distribution transport client.
//!
//! Mirrors the operation contract of [`crate::client::Client`] on top of a
//! synchronous agent, with its own token cache.  Behavioural differences to
//! the async client: no rate-limit backoff on token exchange and no
//! cross-task upload deduplication, both of which only make sense under a
//! shared event loop.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::auth::{
    parse_challenge, scope_for, AuthContext, AuthScheme, Credentials, CredentialsSource,
    Privilege, TokenCache, TokenResponse,
};
use crate::client::{
    absolute_location, sha256_digest, ClientConfig, HeadResult, RawManifest, MANIFEST_ACCEPT,
};
use crate::error::{absent, Error, Result};
use crate::reference::ImageReference;

/// Blocking OCI registry client.
pub struct BlockingClient {
    config: Arc<ClientConfig>,
    agent: ureq::Agent,
    tokens: TokenCache,
    schemes: Mutex<HashMap<String, AuthScheme>>,
    credentials: Option<Arc<dyn CredentialsSource>>,
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BlockingClient {
    pub fn new(config: ClientConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        BlockingClient {
            config: Arc::new(config),
            agent,
            tokens: TokenCache::new(),
            schemes: Mutex::new(HashMap::new()),
            credentials: None,
        }
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

    fn manifest_url(&self, image: &ImageReference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(image),
            image.repository(),
            image.target()
        )
    }

    fn blob_url(&self, image: &ImageReference, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(image),
            image.repository(),
            digest
        )
    }

    fn upload_url(&self, image: &ImageReference) -> String {
        format!(
            "{}/v2/{}/blobs/uploads/",
            self.base_url(image),
            image.repository()
        )
    }

    fn tags_url(&self, image: &ImageReference) -> String {
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

    fn authenticate(&self, image: &ImageReference, privilege: Privilege) -> Result<AuthContext> {
        let scope = scope_for(image, privilege);
        if let Some(token) = self.tokens.get(&scope) {
            return Ok(AuthContext::Bearer(token.token));
        }

        let scheme = match self.remembered_scheme(image.registry()) {
            Some(scheme) => scheme,
            None => {
                let scheme = self.probe_scheme(image)?;
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
                let token = self.fetch_token(image, &realm, service.as_deref(), &scope, credentials)?;
                self.tokens.insert(token.clone());
                Ok(AuthContext::Bearer(token.token))
            }
        }
    }

    fn probe_scheme(&self, image: &ImageReference) -> Result<AuthScheme> {
        let url = format!("{}/v2/", self.base_url(image));
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => return Err(transport_error("GET", &url, err)),
        };
        match response.header("WWW-Authenticate") {
            None => Ok(AuthScheme::None),
            Some(header) => parse_challenge(header),
        }
    }

    fn fetch_token(
        &self,
        image: &ImageReference,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: Option<Credentials>,
    ) -> Result<crate::auth::OauthToken> {
        let mut request = self.agent.get(realm).query("scope", scope);
        if let Some(service) = service {
            request = request.query("service", service);
        }
        if let Some(credentials) = &credentials {
            request = request.set("Authorization", &credentials.basic_header());
        }
        let response = request.call().map_err(|err| match err {
            ureq::Error::Status(status, response) => Error::Auth {
                registry: image.registry().to_string(),
                reason: format!(
                    "token exchange returned HTTP {status}: {}",
                    response.into_string().unwrap_or_default()
                ),
            },
            err => transport_error("GET", realm, err),
        })?;
        let parsed: TokenResponse =
            response
                .into_json()
                .map_err(|err| Error::MalformedResponse {
                    url: realm.to_string(),
                    reason: err.to_string(),
                })?;
        parsed.into_token(scope, image.registry())
    }

    // ---- request plumbing -------------------------------------------------

    /// Issues a request with auth applied, retrying transient failures a
    /// bounded number of times.
    fn send(
        &self,
        method: &'static str,
        url: &str,
        image: &ImageReference,
        privilege: Privilege,
        not_found_kind: &'static str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<ureq::Response> {
        let auth = self.authenticate(image, privilege)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.agent.request(method, url);
            if let Some(value) = auth.header_value() {
                request = request.set("Authorization", &value);
            }
            for (name, value) in headers {
                request = request.set(name, value);
            }
            let result = match body {
                Some(body) => request.send_bytes(body),
                None => request.call(),
            };
            let retryable = match &result {
                Ok(_) => false,
                Err(ureq::Error::Status(status, _)) => *status >= 500,
                Err(ureq::Error::Transport(_)) => true,
            };
            if retryable && attempt <= self.config.transient_retries {
                debug!("{method} {url}: transient failure, attempt {attempt}");
                continue;
            }
            return match result {
                Ok(response) => Ok(response),
                Err(ureq::Error::Status(status, _)) => {
                    warn!("{method} {url} returned HTTP {status}");
                    if status == 404 {
                        Err(Error::not_found(not_found_kind, image.to_string()))
                    } else if status >= 500 {
                        Err(Error::Transient {
                            method,
                            url: url.to_string(),
                            attempts: attempt,
                            reason: format!("HTTP {status}"),
                        })
                    } else {
                        Err(Error::Http {
                            method,
                            url: url.to_string(),
                            status,
                        })
                    }
                }
                Err(err) => Err(transport_error(method, url, err)),
            };
        }
    }

    // ---- manifests --------------------------------------------------------

    /// Fetches a manifest.  `accept` defaults to [`MANIFEST_ACCEPT`].
    pub fn manifest(
        &self,
        image: &ImageReference,
        accept: Option<&[&str]>,
    ) -> Result<RawManifest> {
        let url = self.manifest_url(image);
        let accept = accept.unwrap_or(MANIFEST_ACCEPT).join(", ");
        let response = self.send(
            "GET",
            &url,
            image,
            Privilege::ReadOnly,
            "manifest",
            &[("Accept", &accept)],
            None,
        )?;
        let media_type = response.header("Content-Type").map(str::to_string);
        let server_digest = response.header("Docker-Content-Digest").map(str::to_string);
        let bytes = read_body(response, &url)?;
        Ok(RawManifest {
            digest: server_digest.unwrap_or_else(|| sha256_digest(&bytes)),
            media_type,
            bytes: bytes.into(),
        })
    }

    /// Like [`Self::manifest`] but tolerating absence.
    pub fn manifest_opt(
        &self,
        image: &ImageReference,
        accept: Option<&[&str]>,
    ) -> Result<Option<RawManifest>> {
        absent(self.manifest(image, accept), true)
    }

    /// HEAD request against a manifest; `Ok(None)` if absent.
    pub fn head_manifest(&self, image: &ImageReference) -> Result<Option<HeadResult>> {
        let url = self.manifest_url(image);
        let accept = MANIFEST_ACCEPT.join(", ");
        let result = self.send(
            "HEAD",
            &url,
            image,
            Privilege::ReadOnly,
            "manifest",
            &[("Accept", &accept)],
            None,
        );
        match result {
            Ok(response) => Ok(Some(head_result(&response, None))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Uploads a manifest under the reference's tag or digest.
    pub fn put_manifest(
        &self,
        image: &ImageReference,
        media_type: &str,
        manifest: &[u8],
    ) -> Result<()> {
        let url = self.manifest_url(image);
        self.send(
            "PUT",
            &url,
            image,
            Privilege::ReadWrite,
            "manifest",
            &[("Content-Type", media_type)],
            Some(manifest),
        )?;
        Ok(())
    }

    /// Deletes a manifest; see the async client for the purge semantics.
    pub fn delete_manifest(&self, image: &ImageReference, purge: bool) -> Result<()> {
        let digest = if purge && !image.tag().is_digest() {
            self.head_manifest(image)?.and_then(|head| head.digest)
        } else {
            None
        };

        let url = self.manifest_url(image);
        self.send("DELETE", &url, image, Privilege::ReadWrite, "manifest", &[], None)?;

        if let Some(digest) = digest {
            let by_digest = image.with_digest(digest);
            let url = self.manifest_url(&by_digest);
            if let Err(err) = self.send(
                "DELETE",
                &url,
                &by_digest,
                Privilege::ReadWrite,
                "manifest",
                &[],
                None,
            ) {
                debug!("purge of {by_digest} skipped: {err}");
            }
        }
        Ok(())
    }

    // ---- blobs ------------------------------------------------------------

    /// Streams a blob as a reader.
    pub fn blob(
        &self,
        image: &ImageReference,
        digest: &str,
    ) -> Result<Box<dyn Read + Send + Sync + 'static>> {
        let url = self.blob_url(image, digest);
        let response = self.send("GET", &url, image, Privilege::ReadOnly, "blob", &[], None)?;
        Ok(Box::new(response.into_reader()))
    }

    /// Fetches a blob fully buffered and verifies its digest over the
    /// observed bytes.
    pub fn blob_bytes(&self, image: &ImageReference, digest: &str) -> Result<Vec<u8>> {
        let url = self.blob_url(image, digest);
        let response = self.send("GET", &url, image, Privilege::ReadOnly, "blob", &[], None)?;
        let bytes = read_body(response, &url)?;
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
    pub fn head_blob(&self, image: &ImageReference, digest: &str) -> Result<Option<HeadResult>> {
        let url = self.blob_url(image, digest);
        let result = self.send("HEAD", &url, image, Privilege::ReadOnly, "blob", &[], None);
        match result {
            Ok(response) => Ok(Some(head_result(&response, Some(digest)))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Uploads a blob; single POST below the chunk threshold, chunked
    /// session above it.  Returns the digest of the uploaded content.
    pub fn put_blob(&self, image: &ImageReference, digest: &str, data: &[u8]) -> Result<String> {
        if data.len() < self.config.chunk_threshold {
            let url = format!("{}?digest={digest}", self.upload_url(image));
            self.send(
                "POST",
                &url,
                image,
                Privilege::ReadWrite,
                "blob",
                &[("Content-Type", "application/octet-stream")],
                Some(data),
            )?;
            return Ok(digest.to_string());
        }

        let session_url = self.upload_url(image);
        let response = self.send(
            "POST",
            &session_url,
            image,
            Privilege::ReadWrite,
            "blob",
            &[("Content-Length", "0")],
            None,
        )?;
        let mut location = upload_location(&response, &session_url, image, &self.config)?;

        let mut hasher = Sha256::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let end = usize::min(offset + self.config.chunk_size, data.len());
            let chunk = &data[offset..end];
            hasher.update(chunk);
            let range = format!("{}-{}", offset, end - 1);
            let response = self.send(
                "PATCH",
                &location,
                image,
                Privilege::ReadWrite,
                "blob",
                &[
                    ("Content-Type", "application/octet-stream"),
                    ("Content-Range", &range),
                ],
                Some(chunk),
            )?;
            location = upload_location(&response, &location, image, &self.config)?;
            offset = end;
        }

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        if self.config.finalize_chunked_upload {
            let url = format!(
                "{location}{}digest={digest}",
                if location.contains('?') { "&" } else { "?" }
            );
            self.send(
                "PUT",
                &url,
                image,
                Privilege::ReadWrite,
                "blob",
                &[("Content-Length", "0")],
                None,
            )?;
        }
        Ok(digest.to_string())
    }

    // ---- tags -------------------------------------------------------------

    /// Lists the repository's tags.
    pub fn tags(&self, image: &ImageReference) -> Result<Vec<String>> {
        let url = self.tags_url(image);
        let response = self.send("GET", &url, image, Privilege::ReadOnly, "repository", &[], None)?;
        #[derive(serde::Deserialize)]
        struct TagList {
            tags: Option<Vec<String>>,
        }
        let parsed: TagList = response
            .into_json()
            .map_err(|err| Error::MalformedResponse {
                url,
                reason: err.to_string(),
            })?;
        Ok(parsed.tags.unwrap_or_default())
    }
}

fn transport_error(method: &'static str, url: &str, err: ureq::Error) -> Error {
    Error::Transient {
        method,
        url: url.to_string(),
        attempts: 1,
        reason: err.to_string(),
    }
}

fn read_body(response: ureq::Response, url: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut bytes)
        .map_err(|err| Error::MalformedResponse {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
    Ok(bytes)
}

fn head_result(response: &ureq::Response, fallback_digest: Option<&str>) -> HeadResult {
    HeadResult {
        digest: response
            .header("Docker-Content-Digest")
            .map(str::to_string)
            .or_else(|| fallback_digest.map(str::to_string)),
        size: response
            .header("Content-Length")
            .and_then(|v| v.parse().ok()),
        media_type: response.header("Content-Type").map(str::to_string),
    }
}

fn upload_location(
    response: &ureq::Response,
    request_url: &str,
    image: &ImageReference,
    config: &ClientConfig,
) -> Result<String> {
    let value = response
        .header("Location")
        .ok_or_else(|| Error::MalformedResponse {
            url: request_url.to_string(),
            reason: "upload session response carried no Location header".to_string(),
        })?;
    Ok(absolute_location(value, image, &config.protocol))
}
