//! Depth-first traversal of the component reference graph.
//!
//! Starting from a root descriptor, yields a lazy sequence of typed nodes:
//! the component itself, then its resources, then its sources, then the
//! transitive closure of its component references resolved through a lookup
//! chain.  A global seen-set prunes component versions already visited
//! anywhere in the walk, which guarantees termination on graphs with shared
//! dependencies and cycles at the cost of path-enumeration completeness.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::lookup::CompositeLookup;
use crate::model::{Component, ComponentIdentity, Resource, Source};

/// Label under which a component may declare cross-references beyond its
/// structural `componentReferences` list.
pub const EXTRA_REFERENCES_LABEL: &str = "ocm.software/extra-references";

/// How a component was reached: through the structural reference list or
/// through the extra-references label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Structural,
    Declared,
}

/// Ordered sequence of ancestor components from the traversal root; the
/// last entry is the node's own component.
pub type ComponentPath = Vec<Arc<Component>>;

#[derive(Debug, Clone)]
pub struct ComponentNode {
    pub path: ComponentPath,
    pub kind: ReferenceKind,
}

#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub path: ComponentPath,
    pub resource: Resource,
}

#[derive(Debug, Clone)]
pub struct SourceNode {
    pub path: ComponentPath,
    pub source: Source,
}

/// A traversal node.  Nodes are transient; they are produced lazily and not
/// retained by the iterator.
#[derive(Debug, Clone)]
pub enum Node {
    Component(ComponentNode),
    Resource(ResourceNode),
    Source(SourceNode),
}

impl Node {
    /// The component this node belongs to.
    pub fn component(&self) -> &Arc<Component> {
        let path = match self {
            Node::Component(node) => &node.path,
            Node::Resource(node) => &node.path,
            Node::Source(node) => &node.path,
        };
        // paths always contain at least the root
        &path[path.len() - 1]
    }

    pub fn path(&self) -> &ComponentPath {
        match self {
            Node::Component(node) => &node.path,
            Node::Resource(node) => &node.path,
            Node::Source(node) => &node.path,
        }
    }
}

/// Node-type filter applied to yielded nodes (traversal is unaffected).
pub type NodeFilter = fn(&Node) -> bool;

pub fn component_nodes(node: &Node) -> bool {
    matches!(node, Node::Component(_))
}

pub fn resource_nodes(node: &Node) -> bool {
    matches!(node, Node::Resource(_))
}

pub fn source_nodes(node: &Node) -> bool {
    matches!(node, Node::Source(_))
}

/// An entry of the extra-references label value.
#[derive(Debug, Deserialize)]
struct ExtraReference {
    #[serde(rename = "componentName", alias = "name")]
    component_name: String,
    version: String,
}

/// Traversal configuration; see [`iterate`].
pub struct TraversalOptions<'a> {
    pub lookup: Option<&'a CompositeLookup>,
    /// `-1` is unlimited; `0` disables reference resolution entirely, in
    /// which case the lookup may be omitted.
    pub max_depth: i64,
    pub prune_duplicates: bool,
    pub node_filter: Option<NodeFilter>,
}

impl Default for TraversalOptions<'_> {
    fn default() -> Self {
        TraversalOptions {
            lookup: None,
            max_depth: 0,
            prune_duplicates: true,
            node_filter: None,
        }
    }
}

impl<'a> TraversalOptions<'a> {
    pub fn with_lookup(lookup: &'a CompositeLookup) -> Self {
        TraversalOptions {
            lookup: Some(lookup),
            max_depth: -1,
            prune_duplicates: true,
            node_filter: None,
        }
    }
}

struct Visit {
    component: Arc<Component>,
    path: ComponentPath,
    depth: i64,
    kind: ReferenceKind,
}

/// Lazily iterates the component graph rooted at `root`.
pub fn iterate<'a>(root: Component, options: TraversalOptions<'a>) -> ComponentIterator<'a> {
    let root = Arc::new(root);
    ComponentIterator {
        lookup: options.lookup,
        max_depth: options.max_depth,
        prune_duplicates: options.prune_duplicates,
        node_filter: options.node_filter,
        seen: HashSet::new(),
        pending: VecDeque::new(),
        stack: vec![Visit {
            path: vec![Arc::clone(&root)],
            component: root,
            depth: 0,
            kind: ReferenceKind::Structural,
        }],
    }
}

pub struct ComponentIterator<'a> {
    lookup: Option<&'a CompositeLookup>,
    max_depth: i64,
    prune_duplicates: bool,
    node_filter: Option<NodeFilter>,
    seen: HashSet<ComponentIdentity>,
    pending: VecDeque<Node>,
    stack: Vec<Visit>,
}

impl ComponentIterator<'_> {
    /// Expands one component visit: queues its nodes and pushes its
    /// unvisited references onto the stack.
    fn visit(&mut self, visit: Visit) -> Result<()> {
        let Visit {
            component,
            path,
            depth,
            kind,
        } = visit;

        if self.prune_duplicates && !self.seen.insert(component.identity()) {
            return Ok(());
        }

        self.pending.push_back(Node::Component(ComponentNode {
            path: path.clone(),
            kind,
        }));
        for resource in &component.resources {
            self.pending.push_back(Node::Resource(ResourceNode {
                path: path.clone(),
                resource: resource.clone(),
            }));
        }
        for source in &component.sources {
            self.pending.push_back(Node::Source(SourceNode {
                path: path.clone(),
                source: source.clone(),
            }));
        }

        if self.max_depth >= 0 && depth >= self.max_depth {
            return Ok(());
        }

        let mut references: Vec<(ComponentIdentity, ReferenceKind)> = component
            .component_references
            .iter()
            .map(|reference| (reference.identity(), ReferenceKind::Structural))
            .collect();
        references.extend(
            extra_references(&component)?
                .into_iter()
                .map(|identity| (identity, ReferenceKind::Declared)),
        );

        // reversed so the first reference is visited first (LIFO stack)
        for (identity, kind) in references.into_iter().rev() {
            if self.prune_duplicates && self.seen.contains(&identity) {
                continue;
            }
            let lookup = self.lookup.ok_or(Error::LookupRequired)?;
            let Some(descriptor) = lookup.lookup(&identity, false)? else {
                continue;
            };
            let child = Arc::new(descriptor.component);
            let mut child_path = path.clone();
            child_path.push(Arc::clone(&child));
            self.stack.push(Visit {
                component: child,
                path: child_path,
                depth: depth + 1,
                kind,
            });
        }
        Ok(())
    }
}

impl Iterator for ComponentIterator<'_> {
    type Item = Result<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.pending.pop_front() {
                if self.node_filter.is_none_or(|filter| filter(&node)) {
                    return Some(Ok(node));
                }
                continue;
            }
            let visit = self.stack.pop()?;
            if let Err(err) = self.visit(visit) {
                // poison the iterator: no further expansion after an error
                self.stack.clear();
                self.pending.clear();
                return Some(Err(err));
            }
        }
    }
}

/// Parses the extra-references label of a component, if present.
fn extra_references(component: &Component) -> Result<Vec<ComponentIdentity>> {
    let Some(label) = component.label(EXTRA_REFERENCES_LABEL) else {
        return Ok(Vec::new());
    };
    let references: Vec<ExtraReference> =
        serde_json::from_value(label.value.clone()).map_err(|err| Error::Model {
            reason: format!("malformed {EXTRA_REFERENCES_LABEL} label: {err}"),
        })?;
    Ok(references
        .into_iter()
        .map(|r| ComponentIdentity::new(r.component_name, r.version))
        .collect())
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use crate::lookup::{ComponentLookup, CompositeLookup, LookupOutcome};
    use crate::model::test::minimal_descriptor;
    use crate::model::{ComponentDescriptor, ComponentReference, Label, OcmRepository};
    use crate::Result;

    use super::*;

    struct MapLookup {
        descriptors: Vec<ComponentDescriptor>,
    }

    impl ComponentLookup for MapLookup {
        fn lookup(
            &self,
            identity: &ComponentIdentity,
            _repositories: &[OcmRepository],
        ) -> Result<LookupOutcome> {
            Ok(self
                .descriptors
                .iter()
                .find(|d| d.component.identity() == *identity)
                .map(|d| LookupOutcome::Found {
                    descriptor: d.clone(),
                    repository: None,
                })
                .unwrap_or(LookupOutcome::NotFound))
        }
    }

    fn reference(name: &str, version: &str) -> ComponentReference {
        ComponentReference {
            name: name.rsplit('/').next().unwrap().to_string(),
            component_name: name.to_string(),
            version: version.to_string(),
            extra_identity: Default::default(),
            digest: None,
            labels: vec![],
        }
    }

    fn chain(descriptors: Vec<ComponentDescriptor>) -> CompositeLookup {
        CompositeLookup::new(vec![Box::new(MapLookup { descriptors })])
    }

    fn component_names(nodes: &[Node]) -> Vec<String> {
        nodes
            .iter()
            .filter_map(|node| match node {
                Node::Component(n) => Some(n.path.last().unwrap().name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_diamond_yields_shared_child_once() {
        // root -> left -> shared, root -> right -> shared
        let shared = minimal_descriptor("shared", "1");
        let mut left = minimal_descriptor("left", "1");
        left.component.component_references.push(reference("shared", "1"));
        let mut right = minimal_descriptor("right", "1");
        right.component.component_references.push(reference("shared", "1"));
        let mut root = minimal_descriptor("root", "1");
        root.component.component_references.push(reference("left", "1"));
        root.component.component_references.push(reference("right", "1"));

        let lookup = chain(vec![left, right, shared]);
        let nodes: Vec<Node> = iterate(
            root.component,
            TraversalOptions::with_lookup(&lookup),
        )
        .collect::<Result<_>>()
        .unwrap();

        let names = component_names(&nodes);
        assert_eq!(names, vec!["root", "left", "shared", "right"]);
    }

    #[test]
    fn test_cycle_terminates() {
        let mut a = minimal_descriptor("a", "1");
        a.component.component_references.push(reference("b", "1"));
        let mut b = minimal_descriptor("b", "1");
        b.component.component_references.push(reference("a", "1"));

        let lookup = chain(vec![a.clone(), b]);
        let nodes: Vec<Node> = iterate(
            a.component,
            TraversalOptions::with_lookup(&lookup),
        )
        .collect::<Result<_>>()
        .unwrap();
        assert_eq!(component_names(&nodes), vec!["a", "b"]);
    }

    #[test]
    fn test_max_depth_zero_needs_no_lookup() {
        let mut root = minimal_descriptor("root", "1");
        root.component
            .component_references
            .push(reference("child", "1"));
        let nodes: Vec<Node> = iterate(root.component, TraversalOptions::default())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(component_names(&nodes), vec!["root"]);
    }

    #[test]
    fn test_max_depth_limits_recursion() {
        let mut a = minimal_descriptor("a", "1");
        a.component.component_references.push(reference("b", "1"));
        let mut b = minimal_descriptor("b", "1");
        b.component.component_references.push(reference("c", "1"));
        let c = minimal_descriptor("c", "1");

        let lookup = chain(vec![b, c]);
        let options = TraversalOptions {
            lookup: Some(&lookup),
            max_depth: 1,
            prune_duplicates: true,
            node_filter: None,
        };
        let nodes: Vec<Node> = iterate(a.component, options)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(component_names(&nodes), vec!["a", "b"]);
    }

    #[test]
    fn test_paths_carry_ancestors() {
        let mut root = minimal_descriptor("root", "1");
        root.component.component_references.push(reference("child", "1"));
        let child = minimal_descriptor("child", "1");

        let lookup = chain(vec![child]);
        let nodes: Vec<Node> = iterate(
            root.component,
            TraversalOptions::with_lookup(&lookup),
        )
        .collect::<Result<_>>()
        .unwrap();

        let child_node = nodes
            .iter()
            .find(|n| matches!(n, Node::Component(_)) && n.component().name == "child")
            .unwrap();
        let ancestry: Vec<_> = child_node.path().iter().map(|c| c.name.clone()).collect();
        assert_eq!(ancestry, vec!["root", "child"]);
    }

    #[test]
    fn test_extra_references_are_traversed_as_declared() {
        let mut root = minimal_descriptor("root", "1");
        root.component.labels.push(Label {
            name: EXTRA_REFERENCES_LABEL.to_string(),
            value: serde_json::json!([
                {"componentName": "extra", "version": "2"}
            ]),
            signing: None,
        });
        let extra = minimal_descriptor("extra", "2");

        let lookup = chain(vec![extra]);
        let nodes: Vec<Node> = iterate(
            root.component,
            TraversalOptions::with_lookup(&lookup),
        )
        .collect::<Result<_>>()
        .unwrap();

        let kinds: Vec<_> = nodes
            .iter()
            .filter_map(|n| match n {
                Node::Component(node) => Some((n.component().name.clone(), node.kind)),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("root".to_string(), ReferenceKind::Structural),
                ("extra".to_string(), ReferenceKind::Declared),
            ]
        );
    }

    #[test]
    fn test_node_filter_keeps_traversal_intact() {
        let mut root = minimal_descriptor("root", "1");
        root.component.component_references.push(reference("child", "1"));
        let mut child = minimal_descriptor("child", "1");
        child.component.resources.push(crate::model::Resource {
            name: "image".to_string(),
            version: "1".to_string(),
            resource_type: "ociImage".to_string(),
            extra_identity: Default::default(),
            relation: None,
            access: None,
            digest: None,
            src_refs: vec![],
            labels: vec![],
        });

        let lookup = chain(vec![child]);
        let options = TraversalOptions {
            lookup: Some(&lookup),
            max_depth: -1,
            prune_duplicates: true,
            node_filter: Some(resource_nodes),
        };
        let nodes: Vec<Node> = iterate(root.component, options)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(matches!(nodes[0], Node::Resource(_)));
    }

    #[test]
    fn test_missing_reference_raises() {
        let mut root = minimal_descriptor("root", "1");
        root.component
            .component_references
            .push(reference("absent", "1"));
        let lookup = chain(vec![]);
        let result: Result<Vec<Node>> =
            iterate(root.component, TraversalOptions::with_lookup(&lookup)).collect();
        assert!(result.unwrap_err().is_not_found());
    }
}
