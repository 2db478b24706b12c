//! Composable component-descriptor lookup chain.
//!
//! A lookup call tries each configured strategy in priority order.  A
//! strategy reports one of three outcomes: a hit, a hard miss, or a miss
//! with a write-back handle.  On a later hit, all collected write-backs are
//! invoked so that higher-priority caches are populated; the chain as a
//! whole reports not-found only after every strategy hard-missed.
//!
//! All caches are explicit per-instance objects handed around by reference,
//! never hidden globals, so tests can construct isolated instances.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};

use ocm_oci::{BlockingClient, Client};

use crate::error::{Error, Result};
use crate::model::{ComponentDescriptor, ComponentIdentity, OcmRepository};
use crate::repository;

/// Default capacity of the in-memory descriptor cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 2048;

/// Populates a cache with a descriptor resolved by a lower-priority
/// strategy.  The repository is the one the descriptor was actually found
/// in, when the resolving strategy knows it.
pub type Writeback = Box<dyn FnOnce(&ComponentDescriptor, Option<&OcmRepository>) + Send>;

/// Outcome of a single strategy's lookup attempt.
pub enum LookupOutcome {
    Found {
        descriptor: ComponentDescriptor,
        repository: Option<OcmRepository>,
    },
    NotFound,
    NotFoundWithWriteback(Writeback),
}

impl std::fmt::Debug for LookupOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupOutcome::Found { descriptor, .. } => f
                .debug_struct("Found")
                .field("identity", &descriptor.component.identity())
                .finish_non_exhaustive(),
            LookupOutcome::NotFound => f.write_str("NotFound"),
            LookupOutcome::NotFoundWithWriteback(_) => f.write_str("NotFoundWithWriteback"),
        }
    }
}

/// One strategy of the blocking lookup chain.
pub trait ComponentLookup: Send + Sync {
    fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome>;
}

/// One strategy of the async lookup chain.
#[async_trait]
pub trait AsyncComponentLookup: Send + Sync {
    async fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome>;
}

/// Supplies the candidate OCM repositories to try for a component identity
/// (multi-repository federation).
pub trait OcmRepositoryLookup: Send + Sync {
    fn repositories(&self, identity: &ComponentIdentity) -> Vec<OcmRepository>;
}

/// The common case: a fixed, ordered list of repositories for every
/// component.
#[derive(Debug, Clone)]
pub struct StaticRepositoryLookup {
    repositories: Vec<OcmRepository>,
}

impl StaticRepositoryLookup {
    pub fn new(repositories: Vec<OcmRepository>) -> Self {
        StaticRepositoryLookup { repositories }
    }
}

impl OcmRepositoryLookup for StaticRepositoryLookup {
    fn repositories(&self, _identity: &ComponentIdentity) -> Vec<OcmRepository> {
        self.repositories.clone()
    }
}

// ---- in-memory cache ------------------------------------------------------

type CacheKey = (ComponentIdentity, Option<String>);

#[derive(Debug)]
struct CacheState {
    entries: HashMap<CacheKey, (ComponentDescriptor, u64)>,
    capacity: usize,
    clock: u64,
}

impl CacheState {
    fn get(&mut self, key: &CacheKey) -> Option<ComponentDescriptor> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(key).map(|(descriptor, stamp)| {
            *stamp = clock;
            descriptor.clone()
        })
    }

    fn insert(&mut self, key: CacheKey, descriptor: ComponentDescriptor) {
        self.clock += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            // evict the least recently used entry
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(key, _)| key.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, (descriptor, self.clock));
    }
}

/// Bounded in-memory descriptor cache keyed by `(identity, repository)`,
/// with least-recently-used eviction.  Process-lifetime; never actively
/// invalidated.
#[derive(Debug, Clone)]
pub struct InMemoryLookup {
    state: Arc<Mutex<CacheState>>,
}

impl Default for InMemoryLookup {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl InMemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        InMemoryLookup {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                capacity: capacity.max(1),
                clock: 0,
            })),
        }
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys_for(identity: &ComponentIdentity, repositories: &[OcmRepository]) -> Vec<CacheKey> {
        if repositories.is_empty() {
            vec![(identity.clone(), None)]
        } else {
            repositories
                .iter()
                .map(|repository| (identity.clone(), Some(repository.oci_prefix())))
                .collect()
        }
    }

    fn lookup_impl(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> LookupOutcome {
        let keys = Self::keys_for(identity, repositories);
        {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            for key in &keys {
                if let Some(descriptor) = state.get(key) {
                    debug!("memory cache hit for {identity}");
                    return LookupOutcome::Found {
                        descriptor,
                        repository: None,
                    };
                }
            }
        }
        let state = Arc::clone(&self.state);
        let identity = identity.clone();
        LookupOutcome::NotFoundWithWriteback(Box::new(move |descriptor, repository| {
            #[allow(clippy::unwrap_used)]
            let mut state = state.lock().unwrap();
            // key on the candidates this lookup was asked for, so the
            // same request hits next time no matter where the
            // descriptor was found; record the source repository too
            if let Some(repository) = repository {
                let key = (identity.clone(), Some(repository.oci_prefix()));
                if !keys.contains(&key) {
                    state.insert(key, descriptor.clone());
                }
            }
            for key in keys {
                state.insert(key, descriptor.clone());
            }
        }))
    }
}

impl ComponentLookup for InMemoryLookup {
    fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome> {
        Ok(self.lookup_impl(identity, repositories))
    }
}

#[async_trait]
impl AsyncComponentLookup for InMemoryLookup {
    async fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome> {
        Ok(self.lookup_impl(identity, repositories))
    }
}

// ---- filesystem cache -----------------------------------------------------

/// Replaces everything outside `[A-Za-z0-9._-]` so repository URLs and
/// component names become safe single path segments.
fn sanitise_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// On-disk descriptor cache, persisting across process restarts.  Entries
/// are YAML files under `<root>/<repository>/<name>/<version>.yaml` with
/// every path segment sanitised.
#[derive(Debug, Clone)]
pub struct FilesystemLookup {
    root: PathBuf,
}

impl FilesystemLookup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemLookup { root: root.into() }
    }

    fn entry_path(&self, identity: &ComponentIdentity, repository: Option<&OcmRepository>) -> PathBuf {
        let repository_segment = repository
            .map(|r| sanitise_segment(&r.oci_prefix()))
            .unwrap_or_else(|| "-".to_string());
        self.root
            .join(repository_segment)
            .join(sanitise_segment(&identity.name))
            .join(format!("{}.yaml", sanitise_segment(&identity.version)))
    }

    fn read_entry(path: &Path) -> Option<ComponentDescriptor> {
        let data = std::fs::read(path).ok()?;
        match ComponentDescriptor::from_yaml(&data) {
            Ok(descriptor) => Some(descriptor),
            Err(err) => {
                warn!("discarding unreadable cache entry {}: {err}", path.display());
                None
            }
        }
    }

    fn write_entry(path: &Path, descriptor: &ComponentDescriptor) {
        let result = descriptor.to_yaml().map_err(std::io::Error::other).and_then(|yaml| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, yaml)
        });
        if let Err(err) = result {
            warn!("failed to write cache entry {}: {err}", path.display());
        }
    }

    fn lookup_impl(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> LookupOutcome {
        let candidates: Vec<(PathBuf, Option<OcmRepository>)> = if repositories.is_empty() {
            vec![(self.entry_path(identity, None), None)]
        } else {
            repositories
                .iter()
                .map(|r| (self.entry_path(identity, Some(r)), Some(r.clone())))
                .collect()
        };
        for (path, repository) in &candidates {
            if let Some(descriptor) = Self::read_entry(path) {
                debug!("filesystem cache hit for {identity}");
                return LookupOutcome::Found {
                    descriptor,
                    repository: repository.clone(),
                };
            }
        }
        let this = self.clone();
        let identity = identity.clone();
        LookupOutcome::NotFoundWithWriteback(Box::new(move |descriptor, repository| {
            let path = this.entry_path(&identity, repository);
            Self::write_entry(&path, descriptor);
        }))
    }
}

impl ComponentLookup for FilesystemLookup {
    fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome> {
        Ok(self.lookup_impl(identity, repositories))
    }
}

#[async_trait]
impl AsyncComponentLookup for FilesystemLookup {
    async fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome> {
        Ok(self.lookup_impl(identity, repositories))
    }
}

// ---- delivery service -----------------------------------------------------

/// Collaborator interface of the delivery service: resolves a component
/// version, optionally scoped to one OCM repository.  `Ok(None)` is a miss.
pub trait DeliveryClient: Send + Sync {
    fn component_descriptor(
        &self,
        identity: &ComponentIdentity,
        repository: Option<&OcmRepository>,
    ) -> Result<Option<ComponentDescriptor>>;
}

/// Async flavour of [`DeliveryClient`].
#[async_trait]
pub trait AsyncDeliveryClient: Send + Sync {
    async fn component_descriptor(
        &self,
        identity: &ComponentIdentity,
        repository: Option<&OcmRepository>,
    ) -> Result<Option<ComponentDescriptor>>;
}

fn delivery_url(base_url: &str, identity: &ComponentIdentity) -> String {
    format!(
        "{}/components/{}/versions/{}",
        base_url.trim_end_matches('/'),
        identity.name,
        identity.version,
    )
}

/// Blocking delivery-service client over HTTP.  The transport crates are
/// re-exported through ocm-oci so the two HTTP stacks stay version-aligned.
pub struct HttpDeliveryClient {
    base_url: String,
    agent: ocm_oci::ureq::Agent,
}

impl std::fmt::Debug for HttpDeliveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDeliveryClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpDeliveryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpDeliveryClient {
            base_url: base_url.into(),
            agent: ocm_oci::ureq::AgentBuilder::new().build(),
        }
    }
}

impl DeliveryClient for HttpDeliveryClient {
    fn component_descriptor(
        &self,
        identity: &ComponentIdentity,
        repository: Option<&OcmRepository>,
    ) -> Result<Option<ComponentDescriptor>> {
        let url = delivery_url(&self.base_url, identity);
        let mut request = self.agent.get(&url);
        if let Some(repository) = repository {
            request = request.query("ocm_repository", &repository.base_url);
        }
        match request.call() {
            Ok(response) => {
                let body = response.into_string()?;
                Ok(Some(ComponentDescriptor::from_json(body.as_bytes())?))
            }
            Err(ocm_oci::ureq::Error::Status(404, _)) => Ok(None),
            Err(err) => {
                warn!("GET {url} failed: {err}");
                Err(Error::Oci(ocm_oci::Error::MalformedResponse {
                    url,
                    reason: err.to_string(),
                }))
            }
        }
    }
}

/// Async delivery-service client over HTTP.
pub struct AsyncHttpDeliveryClient {
    base_url: String,
    http: ocm_oci::reqwest::Client,
}

impl std::fmt::Debug for AsyncHttpDeliveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHttpDeliveryClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AsyncHttpDeliveryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        AsyncHttpDeliveryClient {
            base_url: base_url.into(),
            http: ocm_oci::reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AsyncDeliveryClient for AsyncHttpDeliveryClient {
    async fn component_descriptor(
        &self,
        identity: &ComponentIdentity,
        repository: Option<&OcmRepository>,
    ) -> Result<Option<ComponentDescriptor>> {
        let url = delivery_url(&self.base_url, identity);
        let mut request = self.http.get(&url);
        if let Some(repository) = repository {
            request = request.query(&[("ocm_repository", repository.base_url.as_str())]);
        }
        let response = request.send().await.map_err(ocm_oci::Error::Request)?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            warn!("GET {url} returned HTTP {}", response.status());
            return Err(Error::Oci(ocm_oci::Error::Http {
                method: "GET",
                url,
                status: response.status().as_u16(),
            }));
        }
        let body = response.bytes().await.map_err(ocm_oci::Error::Request)?;
        Ok(Some(ComponentDescriptor::from_json(&body)?))
    }
}

// ---- OCI registry ---------------------------------------------------------

/// Terminal strategy: fetch the descriptor artifact from each candidate OCM
/// repository's OCI registry.
pub struct OciRegistryLookup {
    client: Arc<BlockingClient>,
}

impl OciRegistryLookup {
    pub fn new(client: Arc<BlockingClient>) -> Self {
        OciRegistryLookup { client }
    }
}

impl ComponentLookup for OciRegistryLookup {
    fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome> {
        for repository in repositories {
            if let Some(descriptor) = repository::fetch(&self.client, repository, identity)? {
                return Ok(LookupOutcome::Found {
                    descriptor,
                    repository: Some(repository.clone()),
                });
            }
        }
        Ok(LookupOutcome::NotFound)
    }
}

/// Async flavour of [`OciRegistryLookup`].
pub struct AsyncOciRegistryLookup {
    client: Arc<Client>,
}

impl AsyncOciRegistryLookup {
    pub fn new(client: Arc<Client>) -> Self {
        AsyncOciRegistryLookup { client }
    }
}

#[async_trait]
impl AsyncComponentLookup for AsyncOciRegistryLookup {
    async fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome> {
        for repository in repositories {
            if let Some(descriptor) =
                repository::fetch_async(&self.client, repository, identity).await?
            {
                return Ok(LookupOutcome::Found {
                    descriptor,
                    repository: Some(repository.clone()),
                });
            }
        }
        Ok(LookupOutcome::NotFound)
    }
}

// ---- delivery-service strategy wrappers -----------------------------------

/// Lookup strategy over a [`DeliveryClient`].  With
/// `fallback_to_service_mapping`, a final unscoped call lets the service
/// apply its own default-repository mapping after all explicit candidates
/// missed.
pub struct DeliveryServiceLookup<C> {
    client: C,
    fallback_to_service_mapping: bool,
}

impl<C> DeliveryServiceLookup<C> {
    pub fn new(client: C, fallback_to_service_mapping: bool) -> Self {
        DeliveryServiceLookup {
            client,
            fallback_to_service_mapping,
        }
    }
}

impl<C: DeliveryClient> ComponentLookup for DeliveryServiceLookup<C> {
    fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome> {
        for repository in repositories {
            if let Some(descriptor) = self.client.component_descriptor(identity, Some(repository))? {
                return Ok(LookupOutcome::Found {
                    descriptor,
                    repository: Some(repository.clone()),
                });
            }
        }
        if self.fallback_to_service_mapping || repositories.is_empty() {
            if let Some(descriptor) = self.client.component_descriptor(identity, None)? {
                return Ok(LookupOutcome::Found {
                    descriptor,
                    repository: None,
                });
            }
        }
        Ok(LookupOutcome::NotFound)
    }
}

#[async_trait]
impl<C: AsyncDeliveryClient> AsyncComponentLookup for DeliveryServiceLookup<C> {
    async fn lookup(
        &self,
        identity: &ComponentIdentity,
        repositories: &[OcmRepository],
    ) -> Result<LookupOutcome> {
        for repository in repositories {
            if let Some(descriptor) = self
                .client
                .component_descriptor(identity, Some(repository))
                .await?
            {
                return Ok(LookupOutcome::Found {
                    descriptor,
                    repository: Some(repository.clone()),
                });
            }
        }
        if self.fallback_to_service_mapping || repositories.is_empty() {
            if let Some(descriptor) = self.client.component_descriptor(identity, None).await? {
                return Ok(LookupOutcome::Found {
                    descriptor,
                    repository: None,
                });
            }
        }
        Ok(LookupOutcome::NotFound)
    }
}

// ---- composite chain ------------------------------------------------------

/// The blocking lookup chain: strategies in priority order plus a
/// repository lookup supplying candidates per identity.
pub struct CompositeLookup {
    strategies: Vec<Box<dyn ComponentLookup>>,
    repository_lookup: Option<Box<dyn OcmRepositoryLookup>>,
}

impl CompositeLookup {
    pub fn new(strategies: Vec<Box<dyn ComponentLookup>>) -> Self {
        CompositeLookup {
            strategies,
            repository_lookup: None,
        }
    }

    pub fn with_repository_lookup(
        mut self,
        repository_lookup: Box<dyn OcmRepositoryLookup>,
    ) -> Self {
        self.repository_lookup = Some(repository_lookup);
        self
    }

    fn candidate_repositories(&self, identity: &ComponentIdentity) -> Vec<OcmRepository> {
        self.repository_lookup
            .as_ref()
            .map(|lookup| lookup.repositories(identity))
            .unwrap_or_default()
    }

    /// Resolves a component version through the chain.  With `absent_ok`
    /// an exhausted chain yields `Ok(None)` instead of
    /// [`Error::ComponentNotFound`].
    pub fn lookup(
        &self,
        identity: &ComponentIdentity,
        absent_ok: bool,
    ) -> Result<Option<ComponentDescriptor>> {
        let repositories = self.candidate_repositories(identity);
        let mut writebacks: Vec<Writeback> = Vec::new();
        for strategy in &self.strategies {
            match strategy.lookup(identity, &repositories)? {
                LookupOutcome::Found {
                    descriptor,
                    repository,
                } => {
                    for writeback in writebacks {
                        writeback(&descriptor, repository.as_ref());
                    }
                    return Ok(Some(descriptor));
                }
                LookupOutcome::NotFound => {}
                LookupOutcome::NotFoundWithWriteback(writeback) => writebacks.push(writeback),
            }
        }
        if absent_ok {
            Ok(None)
        } else {
            Err(Error::ComponentNotFound {
                identity: identity.clone(),
            })
        }
    }
}

/// The async lookup chain; same semantics as [`CompositeLookup`].
pub struct AsyncCompositeLookup {
    strategies: Vec<Box<dyn AsyncComponentLookup>>,
    repository_lookup: Option<Box<dyn OcmRepositoryLookup>>,
}

impl AsyncCompositeLookup {
    pub fn new(strategies: Vec<Box<dyn AsyncComponentLookup>>) -> Self {
        AsyncCompositeLookup {
            strategies,
            repository_lookup: None,
        }
    }

    pub fn with_repository_lookup(
        mut self,
        repository_lookup: Box<dyn OcmRepositoryLookup>,
    ) -> Self {
        self.repository_lookup = Some(repository_lookup);
        self
    }

    pub async fn lookup(
        &self,
        identity: &ComponentIdentity,
        absent_ok: bool,
    ) -> Result<Option<ComponentDescriptor>> {
        let repositories = self
            .repository_lookup
            .as_ref()
            .map(|lookup| lookup.repositories(identity))
            .unwrap_or_default();
        let mut writebacks: Vec<Writeback> = Vec::new();
        for strategy in &self.strategies {
            match strategy.lookup(identity, &repositories).await? {
                LookupOutcome::Found {
                    descriptor,
                    repository,
                } => {
                    for writeback in writebacks {
                        writeback(&descriptor, repository.as_ref());
                    }
                    return Ok(Some(descriptor));
                }
                LookupOutcome::NotFound => {}
                LookupOutcome::NotFoundWithWriteback(writeback) => writebacks.push(writeback),
            }
        }
        if absent_ok {
            Ok(None)
        } else {
            Err(Error::ComponentNotFound {
                identity: identity.clone(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use crate::model::test::minimal_descriptor;

    use super::*;

    struct FixedLookup {
        descriptor: ComponentDescriptor,
    }

    impl ComponentLookup for FixedLookup {
        fn lookup(
            &self,
            identity: &ComponentIdentity,
            _repositories: &[OcmRepository],
        ) -> Result<LookupOutcome> {
            if self.descriptor.component.identity() == *identity {
                Ok(LookupOutcome::Found {
                    descriptor: self.descriptor.clone(),
                    repository: self.descriptor.component.current_repository().cloned(),
                })
            } else {
                Ok(LookupOutcome::NotFound)
            }
        }
    }

    #[test]
    fn test_memory_cache_hit_after_writeback() {
        let memory = InMemoryLookup::new();
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        let identity = descriptor.component.identity();
        let repository = descriptor.component.current_repository().cloned().unwrap();

        match memory.lookup_impl(&identity, std::slice::from_ref(&repository)) {
            LookupOutcome::NotFoundWithWriteback(writeback) => {
                writeback(&descriptor, Some(&repository))
            }
            other => panic!("expected writeback outcome, got {other:?}"),
        }
        match memory.lookup_impl(&identity, &[repository]) {
            LookupOutcome::Found { descriptor: hit, .. } => assert_eq!(hit, descriptor),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn test_memory_cache_keys_writeback_on_requested_candidates() {
        let memory = InMemoryLookup::new();
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        let identity = descriptor.component.identity();
        let candidates = [OcmRepository::new("eu.gcr.io/acme/ocm")];

        // found through a source that reports no repository, e.g. the
        // delivery-service default mapping
        match memory.lookup_impl(&identity, &candidates) {
            LookupOutcome::NotFoundWithWriteback(writeback) => writeback(&descriptor, None),
            other => panic!("expected writeback outcome, got {other:?}"),
        }
        // the same scoped request must now hit
        match memory.lookup_impl(&identity, &candidates) {
            LookupOutcome::Found { descriptor: hit, .. } => assert_eq!(hit, descriptor),
            other => panic!("expected hit, got {other:?}"),
        }

        // found in a repository outside the candidate list: both the
        // candidate keys and the source repository's key must hit
        let elsewhere = OcmRepository::new("ghcr.io/acme/mirror");
        let other_descriptor = minimal_descriptor("github.com/acme/lib", "2.0.0");
        let other_identity = other_descriptor.component.identity();
        match memory.lookup_impl(&other_identity, &candidates) {
            LookupOutcome::NotFoundWithWriteback(writeback) => {
                writeback(&other_descriptor, Some(&elsewhere))
            }
            other => panic!("expected writeback outcome, got {other:?}"),
        }
        assert!(matches!(
            memory.lookup_impl(&other_identity, &candidates),
            LookupOutcome::Found { .. }
        ));
        assert!(matches!(
            memory.lookup_impl(&other_identity, std::slice::from_ref(&elsewhere)),
            LookupOutcome::Found { .. }
        ));
    }

    #[test]
    fn test_memory_cache_evicts_least_recently_used() {
        let memory = InMemoryLookup::with_capacity(2);
        let a = minimal_descriptor("a", "1");
        let b = minimal_descriptor("b", "1");
        let c = minimal_descriptor("c", "1");
        for descriptor in [&a, &b] {
            match memory.lookup_impl(&descriptor.component.identity(), &[]) {
                LookupOutcome::NotFoundWithWriteback(writeback) => writeback(descriptor, None),
                other => panic!("expected writeback outcome, got {other:?}"),
            }
        }
        // touch `a` so `b` becomes the eviction candidate
        assert!(matches!(
            memory.lookup_impl(&a.component.identity(), &[]),
            LookupOutcome::Found { .. }
        ));
        match memory.lookup_impl(&c.component.identity(), &[]) {
            LookupOutcome::NotFoundWithWriteback(writeback) => writeback(&c, None),
            other => panic!("expected writeback outcome, got {other:?}"),
        }
        assert_eq!(memory.len(), 2);
        assert!(matches!(
            memory.lookup_impl(&a.component.identity(), &[]),
            LookupOutcome::Found { .. }
        ));
        assert!(matches!(
            memory.lookup_impl(&b.component.identity(), &[]),
            LookupOutcome::NotFoundWithWriteback(_)
        ));
    }

    #[test]
    fn test_chain_writes_back_to_earlier_strategies() {
        let memory = InMemoryLookup::new();
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        let identity = descriptor.component.identity();
        let chain = CompositeLookup::new(vec![
            Box::new(memory.clone()),
            Box::new(FixedLookup {
                descriptor: descriptor.clone(),
            }),
        ]);

        let resolved = chain.lookup(&identity, false).unwrap().unwrap();
        assert_eq!(resolved, descriptor);
        assert_eq!(memory.len(), 1);

        // second call must be served from memory
        match memory.lookup_impl(
            &identity,
            std::slice::from_ref(descriptor.component.current_repository().unwrap()),
        ) {
            LookupOutcome::Found { .. } => {}
            other => panic!("expected memory hit, got {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_chain_respects_absent_ok() {
        let chain = CompositeLookup::new(vec![Box::new(InMemoryLookup::new())]);
        let identity = ComponentIdentity::new("github.com/acme/missing", "1.0.0");
        assert!(chain.lookup(&identity, true).unwrap().is_none());
        let err = chain.lookup(&identity, false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_filesystem_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let filesystem = FilesystemLookup::new(dir.path());
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0+meta");
        let identity = descriptor.component.identity();
        let repository = descriptor.component.current_repository().cloned().unwrap();

        match filesystem.lookup_impl(&identity, std::slice::from_ref(&repository)) {
            LookupOutcome::NotFoundWithWriteback(writeback) => {
                writeback(&descriptor, Some(&repository))
            }
            other => panic!("expected writeback outcome, got {other:?}"),
        }
        match filesystem.lookup_impl(&identity, &[repository]) {
            LookupOutcome::Found { descriptor: hit, .. } => assert_eq!(hit, descriptor),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn test_sanitised_paths_have_no_separators() {
        let filesystem = FilesystemLookup::new("/tmp/cache");
        let identity = ComponentIdentity::new("github.com/acme/app", "1.0.0+x/y");
        let repository = OcmRepository::new("https://eu.gcr.io/acme/ocm");
        let path = filesystem.entry_path(&identity, Some(&repository));
        let segments: Vec<_> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        assert!(segments.contains(&"eu.gcr.io-acme-ocm".to_string()));
        assert!(segments.contains(&"github.com-acme-app".to_string()));
        assert!(segments.last().unwrap().ends_with("1.0.0-x-y.yaml"));
    }

    struct RecordingDelivery {
        descriptor: ComponentDescriptor,
        serve_unscoped_only: bool,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl DeliveryClient for RecordingDelivery {
        fn component_descriptor(
            &self,
            _identity: &ComponentIdentity,
            repository: Option<&OcmRepository>,
        ) -> Result<Option<ComponentDescriptor>> {
            self.calls
                .lock()
                .unwrap()
                .push(repository.map(|r| r.base_url.clone()));
            if self.serve_unscoped_only && repository.is_some() {
                return Ok(None);
            }
            Ok(Some(self.descriptor.clone()))
        }
    }

    #[test]
    fn test_delivery_fallback_to_service_mapping() {
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        let identity = descriptor.component.identity();
        let delivery = DeliveryServiceLookup::new(
            RecordingDelivery {
                descriptor,
                serve_unscoped_only: true,
                calls: Mutex::new(Vec::new()),
            },
            true,
        );
        let repositories = [OcmRepository::new("eu.gcr.io/acme/ocm")];
        match delivery.lookup(&identity, &repositories).unwrap() {
            LookupOutcome::Found { repository, .. } => assert!(repository.is_none()),
            other => panic!("expected fallback hit, got {other:?}"),
        }
        let calls = delivery.client.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![Some("eu.gcr.io/acme/ocm".to_string()), None]
        );
    }

    #[test]
    fn test_delivery_without_fallback_hard_misses() {
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        let identity = descriptor.component.identity();
        let delivery = DeliveryServiceLookup::new(
            RecordingDelivery {
                descriptor,
                serve_unscoped_only: true,
                calls: Mutex::new(Vec::new()),
            },
            false,
        );
        let repositories = [OcmRepository::new("eu.gcr.io/acme/ocm")];
        assert!(matches!(
            delivery.lookup(&identity, &repositories).unwrap(),
            LookupOutcome::NotFound
        ));
    }

    struct AsyncFixedLookup {
        descriptor: ComponentDescriptor,
    }

    #[async_trait]
    impl AsyncComponentLookup for AsyncFixedLookup {
        async fn lookup(
            &self,
            identity: &ComponentIdentity,
            _repositories: &[OcmRepository],
        ) -> Result<LookupOutcome> {
            if self.descriptor.component.identity() == *identity {
                Ok(LookupOutcome::Found {
                    descriptor: self.descriptor.clone(),
                    repository: self.descriptor.component.current_repository().cloned(),
                })
            } else {
                Ok(LookupOutcome::NotFound)
            }
        }
    }

    #[tokio::test]
    async fn test_async_chain_writes_back_to_memory() {
        let memory = InMemoryLookup::new();
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        let identity = descriptor.component.identity();
        let chain = AsyncCompositeLookup::new(vec![
            Box::new(memory.clone()),
            Box::new(AsyncFixedLookup {
                descriptor: descriptor.clone(),
            }),
        ]);

        let resolved = chain.lookup(&identity, false).await.unwrap().unwrap();
        assert_eq!(resolved, descriptor);
        assert_eq!(memory.len(), 1);

        let missing = ComponentIdentity::new("github.com/acme/missing", "1.0.0");
        assert!(chain.lookup(&missing, true).await.unwrap().is_none());
    }

    #[test]
    fn test_delivery_url() {
        let identity = ComponentIdentity::new("github.com/acme/app", "1.0.0");
        assert_eq!(
            delivery_url("https://delivery.example/", &identity),
            "https://delivery.example/components/github.com/acme/app/versions/1.0.0"
        );
    }
}
