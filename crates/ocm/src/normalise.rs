//! Canonical descriptor normalisation for signing and digest verification.
//!
//! A descriptor is reduced to a recursively sorted key-value-entry tree and
//! serialised as JSON where every map becomes an array of single-entry
//! objects, keys sorted lexicographically at every nesting level.  The
//! resulting byte sequence is stable regardless of original field order,
//! which is what gets hashed and signed.  Field-dropping rules and the
//! creation-time rounding match the reference CLI's behaviour; they are
//! compatibility requirements, not free choices.

use chrono::{DateTime, Timelike};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::lookup::CompositeLookup;
use crate::model::{
    ComponentDescriptor, ComponentReference, DigestSpec, Label, Resource, Source, SCHEMA_VERSION,
};

pub const HASH_ALGORITHM: &str = "SHA-256";
pub const NORMALISATION_ALGORITHM: &str = "jsonNormalisation/v1";

/// A value tree whose serialisation is canonical: maps are ordered lists of
/// single-entry objects, sorted by key at every level.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalised {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Normalised>),
    Map(Vec<(String, Normalised)>),
}

impl Normalised {
    /// Converts an arbitrary JSON value, sorting map keys recursively.
    ///
    /// Arrays whose elements are all single-entry objects are read back as
    /// maps: that is how this type serialises maps, and reading the shape
    /// back makes re-normalising canonical bytes a fixed point.
    pub fn from_value(value: &serde_json::Value) -> Normalised {
        match value {
            serde_json::Value::Null => Normalised::Null,
            serde_json::Value::Bool(b) => Normalised::Bool(*b),
            serde_json::Value::Number(n) => Normalised::Number(n.clone()),
            serde_json::Value::String(s) => Normalised::String(s.clone()),
            serde_json::Value::Array(items) => {
                let entries: Option<Vec<_>> = items.iter().map(single_entry).collect();
                match entries {
                    Some(entries) if !entries.is_empty() => Normalised::map(
                        entries
                            .into_iter()
                            .map(|(key, value)| (key.clone(), Normalised::from_value(value)))
                            .collect(),
                    ),
                    _ => Normalised::List(items.iter().map(Normalised::from_value).collect()),
                }
            }
            serde_json::Value::Object(map) => {
                let mut entries: Vec<(String, Normalised)> = map
                    .iter()
                    .map(|(key, value)| (key.clone(), Normalised::from_value(value)))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Normalised::Map(entries)
            }
        }
    }

    fn map(mut entries: Vec<(String, Normalised)>) -> Normalised {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Normalised::Map(entries)
    }

    fn string(value: impl Into<String>) -> Normalised {
        Normalised::String(value.into())
    }

    /// The canonical byte sequence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Serialize for Normalised {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Normalised::Null => serializer.serialize_none(),
            Normalised::Bool(b) => serializer.serialize_bool(*b),
            Normalised::Number(n) => n.serialize(serializer),
            Normalised::String(s) => serializer.serialize_str(s),
            Normalised::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Normalised::Map(entries) => {
                // a map serialises as an array of single-entry objects so
                // that entry order is part of the byte representation
                let mut seq = serializer.serialize_seq(Some(entries.len()))?;
                for (key, value) in entries {
                    seq.serialize_element(&SingleEntry { key, value })?;
                }
                seq.end()
            }
        }
    }
}

fn single_entry(value: &serde_json::Value) -> Option<(&String, &serde_json::Value)> {
    match value {
        serde_json::Value::Object(map) if map.len() == 1 => map.iter().next(),
        _ => None,
    }
}

struct SingleEntry<'a> {
    key: &'a str,
    value: &'a Normalised,
}

impl Serialize for SingleEntry<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.key, self.value)?;
        map.end()
    }
}

/// Normalises the creation time to whole seconds, rounding half-up on the
/// microsecond field, formatted `%Y-%m-%dT%H:%M:%SZ`.
pub fn normalise_creation_time(raw: &str) -> Result<String> {
    let parsed = DateTime::parse_from_rfc3339(raw).map_err(|err| Error::Model {
        reason: format!("unparseable creationTime {raw:?}: {err}"),
    })?;
    let mut seconds = parsed.timestamp();
    if parsed.nanosecond() / 1_000 >= 500_000 {
        seconds += 1;
    }
    let rounded = DateTime::from_timestamp(seconds, 0).ok_or_else(|| Error::Model {
        reason: format!("creationTime {raw:?} out of range"),
    })?;
    Ok(rounded.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

fn signing_labels(labels: &[Label]) -> Option<Normalised> {
    let entries: Vec<Normalised> = labels
        .iter()
        .filter(|label| label.is_signing())
        .map(|label| {
            Normalised::map(vec![
                ("name".to_string(), Normalised::string(&label.name)),
                ("value".to_string(), Normalised::from_value(&label.value)),
                ("signing".to_string(), Normalised::Bool(true)),
            ])
        })
        .collect();
    if entries.is_empty() {
        None
    } else {
        Some(Normalised::List(entries))
    }
}

fn extra_identity(extra: &std::collections::BTreeMap<String, String>) -> Option<Normalised> {
    if extra.is_empty() {
        return None;
    }
    Some(Normalised::Map(
        extra
            .iter()
            .map(|(key, value)| (key.clone(), Normalised::string(value)))
            .collect(),
    ))
}

fn digest_entry(digest: &DigestSpec) -> Normalised {
    Normalised::map(vec![
        (
            "hashAlgorithm".to_string(),
            Normalised::string(&digest.hash_algorithm),
        ),
        (
            "normalisationAlgorithm".to_string(),
            Normalised::string(&digest.normalisation_algorithm),
        ),
        ("value".to_string(), Normalised::string(&digest.value)),
    ])
}

/// Normalises descriptors and computes/verifies their signing digests.
///
/// Component references lacking an attached digest are resolved through the
/// lookup chain and digested recursively; construct without a lookup only
/// when all references carry digests.
pub struct Normaliser<'a> {
    lookup: Option<&'a CompositeLookup>,
}

impl Default for Normaliser<'_> {
    fn default() -> Self {
        Normaliser { lookup: None }
    }
}

impl<'a> Normaliser<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lookup(lookup: &'a CompositeLookup) -> Self {
        Normaliser {
            lookup: Some(lookup),
        }
    }

    /// The canonical byte sequence of a descriptor.
    pub fn normalise(&self, descriptor: &ComponentDescriptor) -> Result<Vec<u8>> {
        self.normalised(descriptor)?.to_bytes()
    }

    /// SHA-256 over the canonical byte sequence, hex-encoded.
    pub fn digest(&self, descriptor: &ComponentDescriptor) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.normalise(descriptor)?)))
    }

    /// The digest in annotation form, for attachment to referencing
    /// descriptors.
    pub fn digest_spec(&self, descriptor: &ComponentDescriptor) -> Result<DigestSpec> {
        Ok(DigestSpec {
            hash_algorithm: HASH_ALGORITHM.to_string(),
            normalisation_algorithm: NORMALISATION_ALGORITHM.to_string(),
            value: self.digest(descriptor)?,
        })
    }

    /// Recomputes the digest and compares it against the declared one.
    /// A mismatch is fatal; it is never silently corrected.
    pub fn verify(&self, descriptor: &ComponentDescriptor, expected: &DigestSpec) -> Result<()> {
        let actual = self.digest(descriptor)?;
        if actual != expected.value {
            return Err(Error::DigestMismatch {
                expected: expected.value.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn normalised(&self, descriptor: &ComponentDescriptor) -> Result<Normalised> {
        let component = &descriptor.component;
        let mut entries = vec![
            ("name".to_string(), Normalised::string(&component.name)),
            ("version".to_string(), Normalised::string(&component.version)),
            (
                "provider".to_string(),
                Normalised::from_value(&component.provider),
            ),
            (
                "componentReferences".to_string(),
                Normalised::List(
                    component
                        .component_references
                        .iter()
                        .map(|reference| self.normalised_reference(reference))
                        .collect::<Result<_>>()?,
                ),
            ),
            (
                "resources".to_string(),
                Normalised::List(
                    component
                        .resources
                        .iter()
                        .map(normalised_resource)
                        .collect(),
                ),
            ),
            (
                "sources".to_string(),
                Normalised::List(component.sources.iter().map(normalised_source).collect()),
            ),
        ];
        if let Some(creation_time) = &component.creation_time {
            entries.push((
                "creationTime".to_string(),
                Normalised::string(normalise_creation_time(creation_time)?),
            ));
        }
        if let Some(labels) = signing_labels(&component.labels) {
            entries.push(("labels".to_string(), labels));
        }

        Ok(Normalised::map(vec![
            (
                "component".to_string(),
                Normalised::map(entries),
            ),
            (
                "meta".to_string(),
                Normalised::map(vec![(
                    "schemaVersion".to_string(),
                    Normalised::string(SCHEMA_VERSION),
                )]),
            ),
        ]))
    }

    /// A reference contributes its identity plus the digest of the
    /// referenced descriptor, computed on demand if not attached.
    fn normalised_reference(&self, reference: &ComponentReference) -> Result<Normalised> {
        let digest = match &reference.digest {
            Some(digest) => digest.clone(),
            None => {
                let lookup = self.lookup.ok_or_else(|| Error::Model {
                    reason: format!(
                        "reference {} carries no digest and no lookup is configured",
                        reference.identity(),
                    ),
                })?;
                let referenced = lookup
                    .lookup(&reference.identity(), false)?
                    .ok_or_else(|| Error::ComponentNotFound {
                        identity: reference.identity(),
                    })?;
                self.digest_spec(&referenced)?
            }
        };
        let mut entries = vec![
            ("name".to_string(), Normalised::string(&reference.name)),
            (
                "componentName".to_string(),
                Normalised::string(&reference.component_name),
            ),
            ("version".to_string(), Normalised::string(&reference.version)),
            ("digest".to_string(), digest_entry(&digest)),
        ];
        if let Some(extra) = extra_identity(&reference.extra_identity) {
            entries.push(("extraIdentity".to_string(), extra));
        }
        if let Some(labels) = signing_labels(&reference.labels) {
            entries.push(("labels".to_string(), labels));
        }
        Ok(Normalised::map(entries))
    }
}

/// Resource normalisation drops `access` and `srcRefs`; only signing labels
/// survive.
fn normalised_resource(resource: &Resource) -> Normalised {
    let mut entries = vec![
        ("name".to_string(), Normalised::string(&resource.name)),
        ("version".to_string(), Normalised::string(&resource.version)),
        (
            "type".to_string(),
            Normalised::string(&resource.resource_type),
        ),
    ];
    if let Some(relation) = &resource.relation {
        entries.push(("relation".to_string(), Normalised::string(relation)));
    }
    if let Some(extra) = extra_identity(&resource.extra_identity) {
        entries.push(("extraIdentity".to_string(), extra));
    }
    if let Some(digest) = &resource.digest {
        entries.push(("digest".to_string(), digest_entry(digest)));
    }
    if let Some(labels) = signing_labels(&resource.labels) {
        entries.push(("labels".to_string(), labels));
    }
    Normalised::map(entries)
}

fn normalised_source(source: &Source) -> Normalised {
    let mut entries = vec![
        ("name".to_string(), Normalised::string(&source.name)),
        ("version".to_string(), Normalised::string(&source.version)),
        ("type".to_string(), Normalised::string(&source.source_type)),
    ];
    if let Some(extra) = extra_identity(&source.extra_identity) {
        entries.push(("extraIdentity".to_string(), extra));
    }
    if let Some(labels) = signing_labels(&source.labels) {
        entries.push(("labels".to_string(), labels));
    }
    Normalised::map(entries)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use crate::lookup::{ComponentLookup, CompositeLookup, LookupOutcome};
    use crate::model::test::minimal_descriptor;
    use crate::model::{ComponentIdentity, ComponentReference, OcmRepository};
    use crate::Result;

    use super::*;

    #[test]
    fn test_map_serialises_as_sorted_entry_list() {
        let value = serde_json::json!({"b": 1, "a": {"z": true, "y": null}});
        let normalised = Normalised::from_value(&value);
        assert_eq!(
            String::from_utf8(normalised.to_bytes().unwrap()).unwrap(),
            r#"[{"a":[{"y":null},{"z":true}]},{"b":1}]"#
        );
    }

    #[test]
    fn test_normalisation_is_field_order_independent() {
        let a = serde_json::json!({"x": 1, "y": [ {"b": 2, "a": 3} ]});
        let b = serde_json::json!({"y": [ {"a": 3, "b": 2} ], "x": 1});
        assert_eq!(
            Normalised::from_value(&a).to_bytes().unwrap(),
            Normalised::from_value(&b).to_bytes().unwrap()
        );
    }

    #[test]
    fn test_normalise_is_idempotent() {
        let mut descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        descriptor.component.creation_time = Some("2024-03-01T12:30:00Z".to_string());
        descriptor.component.labels.push(Label {
            name: "policy".to_string(),
            value: serde_json::json!({"b": 1, "a": 2}),
            signing: Some(true),
        });
        let normaliser = Normaliser::new();
        let first = normaliser.normalise(&descriptor).unwrap();
        let second = normaliser.normalise(&descriptor).unwrap();
        assert_eq!(first, second);

        // re-normalising the canonical form leaves it unchanged, pass
        // after pass, at every nesting level
        let mut bytes = first.clone();
        for _ in 0..3 {
            let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            bytes = Normalised::from_value(&value).to_bytes().unwrap();
            assert_eq!(bytes, first);
        }
    }

    #[test]
    fn test_access_and_src_refs_do_not_influence_digest() {
        let mut plain = minimal_descriptor("github.com/acme/app", "1.0.0");
        plain.component.resources.push(crate::model::Resource {
            name: "image".to_string(),
            version: "1.0.0".to_string(),
            resource_type: "ociImage".to_string(),
            extra_identity: Default::default(),
            relation: None,
            access: None,
            digest: None,
            src_refs: vec![],
            labels: vec![],
        });
        let mut with_access = plain.clone();
        with_access.component.resources[0].access =
            Some(crate::model::Access::Known(crate::model::KnownAccess::OciRegistry {
                image_reference: "eu.gcr.io/acme/app:1.0.0".to_string(),
            }));
        with_access.component.resources[0].src_refs = vec![serde_json::json!({"x": 1})];

        let normaliser = Normaliser::new();
        assert_eq!(
            normaliser.digest(&plain).unwrap(),
            normaliser.digest(&with_access).unwrap()
        );
    }

    #[test]
    fn test_only_signing_labels_influence_digest() {
        let plain = minimal_descriptor("github.com/acme/app", "1.0.0");
        let mut with_plain_label = plain.clone();
        with_plain_label.component.labels.push(Label {
            name: "informational".to_string(),
            value: serde_json::json!("x"),
            signing: None,
        });
        let mut with_signing_label = plain.clone();
        with_signing_label.component.labels.push(Label {
            name: "policy".to_string(),
            value: serde_json::json!("strict"),
            signing: Some(true),
        });

        let normaliser = Normaliser::new();
        let base = normaliser.digest(&plain).unwrap();
        assert_eq!(normaliser.digest(&with_plain_label).unwrap(), base);
        assert_ne!(normaliser.digest(&with_signing_label).unwrap(), base);
    }

    #[test]
    fn test_creation_time_rounding() {
        assert_eq!(
            normalise_creation_time("2024-03-01T12:30:00.499999Z").unwrap(),
            "2024-03-01T12:30:00Z"
        );
        assert_eq!(
            normalise_creation_time("2024-03-01T12:30:00.500000Z").unwrap(),
            "2024-03-01T12:30:01Z"
        );
        assert_eq!(
            normalise_creation_time("2024-12-31T23:59:59.6Z").unwrap(),
            "2025-01-01T00:00:00Z"
        );
        assert_eq!(
            normalise_creation_time("2024-03-01T13:30:00+01:00").unwrap(),
            "2024-03-01T12:30:00Z"
        );
    }

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

    #[test]
    fn test_reference_digest_resolved_recursively() {
        let child = minimal_descriptor("github.com/acme/lib", "0.9.0");
        let mut root = minimal_descriptor("github.com/acme/app", "1.0.0");
        root.component.component_references.push(ComponentReference {
            name: "lib".to_string(),
            component_name: "github.com/acme/lib".to_string(),
            version: "0.9.0".to_string(),
            extra_identity: Default::default(),
            digest: None,
            labels: vec![],
        });

        let lookup = CompositeLookup::new(vec![Box::new(MapLookup {
            descriptors: vec![child.clone()],
        })]);
        let normaliser = Normaliser::with_lookup(&lookup);
        let digest_via_lookup = normaliser.digest(&root).unwrap();

        // pre-attaching the child digest must give the same result
        let child_digest = Normaliser::new().digest_spec(&child).unwrap();
        let mut with_digest = root.clone();
        with_digest.component.component_references[0].digest = Some(child_digest);
        assert_eq!(
            Normaliser::new().digest(&with_digest).unwrap(),
            digest_via_lookup
        );
    }

    #[test]
    fn test_reference_without_digest_and_lookup_is_rejected() {
        let mut root = minimal_descriptor("github.com/acme/app", "1.0.0");
        root.component.component_references.push(ComponentReference {
            name: "lib".to_string(),
            component_name: "github.com/acme/lib".to_string(),
            version: "0.9.0".to_string(),
            extra_identity: Default::default(),
            digest: None,
            labels: vec![],
        });
        assert!(Normaliser::new().digest(&root).is_err());
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        let normaliser = Normaliser::new();
        let mut spec = normaliser.digest_spec(&descriptor).unwrap();
        normaliser.verify(&descriptor, &spec).unwrap();

        spec.value = format!("0{}", &spec.value[1..]);
        let err = normaliser.verify(&descriptor, &spec).unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }
}
