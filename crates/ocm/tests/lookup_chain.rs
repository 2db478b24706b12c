//! End-to-end behaviour of the layered lookup chain and the graph
//! traversal built on top of it.

use std::collections::BTreeMap;

use ocm::iter::{iterate, Node, TraversalOptions};
use ocm::lookup::{
    ComponentLookup, CompositeLookup, FilesystemLookup, InMemoryLookup, LookupOutcome,
    OcmRepositoryLookup, StaticRepositoryLookup,
};
use ocm::model::{Component, ComponentReference};
use ocm::{ComponentDescriptor, ComponentIdentity, OcmRepository, Result};

fn descriptor(name: &str, version: &str, references: &[(&str, &str)]) -> ComponentDescriptor {
    ComponentDescriptor::new(Component {
        name: name.to_string(),
        version: version.to_string(),
        repository_contexts: vec![OcmRepository::new("eu.gcr.io/acme/ocm")],
        provider: serde_json::json!("internal"),
        sources: vec![],
        resources: vec![],
        component_references: references
            .iter()
            .map(|(name, version)| ComponentReference {
                name: name.rsplit('/').next().unwrap().to_string(),
                component_name: name.to_string(),
                version: version.to_string(),
                extra_identity: BTreeMap::new(),
                digest: None,
                labels: vec![],
            })
            .collect(),
        labels: vec![],
        creation_time: None,
    })
}

fn repository() -> OcmRepository {
    OcmRepository::new("eu.gcr.io/acme/ocm")
}

fn populate_filesystem(cache: &FilesystemLookup, descriptors: &[ComponentDescriptor]) {
    let repository = repository();
    for descriptor in descriptors {
        let identity = descriptor.component.identity();
        match cache
            .lookup(&identity, std::slice::from_ref(&repository))
            .unwrap()
        {
            LookupOutcome::NotFoundWithWriteback(writeback) => {
                writeback(descriptor, Some(&repository))
            }
            other => panic!("cache unexpectedly populated: {other:?}"),
        }
    }
}

#[test]
fn filesystem_hit_populates_memory_cache() {
    let dir = tempfile::tempdir().unwrap();
    let filesystem = FilesystemLookup::new(dir.path());
    let stored = descriptor("github.com/acme/app", "1.0.0", &[]);
    populate_filesystem(&filesystem, std::slice::from_ref(&stored));

    let memory = InMemoryLookup::new();
    let chain = CompositeLookup::new(vec![Box::new(memory.clone()), Box::new(filesystem)])
        .with_repository_lookup(Box::new(StaticRepositoryLookup::new(vec![repository()])));

    let identity = stored.component.identity();
    let first = chain.lookup(&identity, false).unwrap().unwrap();
    assert_eq!(first, stored);
    assert_eq!(memory.len(), 1);

    // removing the on-disk cache proves the second call is served from
    // memory without touching the filesystem
    drop(dir);
    let second = chain.lookup(&identity, false).unwrap().unwrap();
    assert_eq!(second, stored);
}

#[test]
fn repository_lookup_supplies_candidates_per_identity() {
    struct PerTeam;
    impl OcmRepositoryLookup for PerTeam {
        fn repositories(&self, identity: &ComponentIdentity) -> Vec<OcmRepository> {
            if identity.name.starts_with("github.com/acme/") {
                vec![OcmRepository::new("eu.gcr.io/acme/ocm")]
            } else {
                vec![OcmRepository::new("eu.gcr.io/other/ocm")]
            }
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let filesystem = FilesystemLookup::new(dir.path());
    let stored = descriptor("github.com/acme/app", "1.0.0", &[]);
    populate_filesystem(&filesystem, std::slice::from_ref(&stored));

    let chain = CompositeLookup::new(vec![Box::new(filesystem)])
        .with_repository_lookup(Box::new(PerTeam));

    assert!(chain
        .lookup(&stored.component.identity(), true)
        .unwrap()
        .is_some());
    // foreign components get a different candidate repository and miss
    assert!(chain
        .lookup(&ComponentIdentity::new("github.com/other/app", "1.0.0"), true)
        .unwrap()
        .is_none());
}

#[test]
fn traversal_over_chain_resolves_transitively_and_fills_caches() {
    let dir = tempfile::tempdir().unwrap();
    let filesystem = FilesystemLookup::new(dir.path());
    let leaf = descriptor("github.com/acme/leaf", "0.1.0", &[]);
    let mid = descriptor(
        "github.com/acme/mid",
        "0.5.0",
        &[("github.com/acme/leaf", "0.1.0")],
    );
    populate_filesystem(&filesystem, &[leaf, mid]);

    let memory = InMemoryLookup::new();
    let chain = CompositeLookup::new(vec![Box::new(memory.clone()), Box::new(filesystem)])
        .with_repository_lookup(Box::new(StaticRepositoryLookup::new(vec![repository()])));

    let root = descriptor(
        "github.com/acme/root",
        "1.0.0",
        &[("github.com/acme/mid", "0.5.0")],
    );
    let nodes: Vec<Node> = iterate(root.component, TraversalOptions::with_lookup(&chain))
        .collect::<Result<_>>()
        .unwrap();

    let names: Vec<_> = nodes
        .iter()
        .filter_map(|node| match node {
            Node::Component(n) => Some(n.path.last().unwrap().name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        names,
        vec![
            "github.com/acme/root",
            "github.com/acme/mid",
            "github.com/acme/leaf",
        ]
    );
    // both resolved descriptors were written back into memory
    assert_eq!(memory.len(), 2);
}
