//! Open Component Model descriptor handling.
//!
//! Component descriptors (OCM schema v2) with their storage as OCI
//! artifacts, a composable lookup chain over in-memory, filesystem,
//! delivery-service and OCI-registry backends, lazy traversal of the
//! component reference graph, and the canonical normalisation used for
//! signing and digest verification.

pub mod error;
pub mod iter;
pub mod lookup;
pub mod model;
pub mod normalise;
pub mod repository;

pub use error::{Error, Result};
pub use iter::{iterate, Node, ReferenceKind, TraversalOptions};
pub use lookup::{
    AsyncCompositeLookup, CompositeLookup, FilesystemLookup, InMemoryLookup, LookupOutcome,
};
pub use model::{
    Access, Component, ComponentDescriptor, ComponentIdentity, ComponentReference, DigestSpec,
    Label, OcmRepository, Resource, Source,
};
pub use normalise::Normaliser;
