//! Component model: descriptors, artifacts, access types and identities.
//!
//! The wire format is the OCM v2 component descriptor, a YAML/JSON document
//! with `meta.schemaVersion` and a `component` object.  Unknown access types
//! round-trip unmodified through the [`Access::Other`] passthrough variant.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The schema version this crate reads and writes.
pub const SCHEMA_VERSION: &str = "v2";

/// Global key for one component version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentIdentity {
    pub name: String,
    pub version: String,
}

impl ComponentIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        ComponentIdentity {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ComponentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// An OCM repository: an OCI registry prefix under which component
/// descriptors are stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OcmRepository {
    #[serde(rename = "type", default = "oci_registry_type")]
    pub repo_type: String,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "subPath", default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

fn oci_registry_type() -> String {
    "OCIRegistry".to_string()
}

impl OcmRepository {
    pub fn new(base_url: impl Into<String>) -> Self {
        OcmRepository {
            repo_type: oci_registry_type(),
            base_url: base_url.into(),
            sub_path: None,
        }
    }

    /// The repository prefix without a URL scheme, with the sub-path
    /// appended.  This is what descriptor OCI references are built from.
    pub fn oci_prefix(&self) -> String {
        let base = self
            .base_url
            .strip_prefix("https://")
            .or_else(|| self.base_url.strip_prefix("http://"))
            .unwrap_or(&self.base_url)
            .trim_end_matches('/');
        match &self.sub_path {
            Some(sub_path) => format!("{base}/{}", sub_path.trim_matches('/')),
            None => base.to_string(),
        }
    }
}

/// A label attached to a component or artifact.  Only labels with
/// `signing: true` survive signing normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing: Option<bool>,
}

impl Label {
    pub fn is_signing(&self) -> bool {
        self.signing == Some(true)
    }
}

/// Digest annotation of an artifact or component reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSpec {
    #[serde(rename = "hashAlgorithm")]
    pub hash_algorithm: String,
    #[serde(rename = "normalisationAlgorithm")]
    pub normalisation_algorithm: String,
    pub value: String,
}

/// Access information: where an artifact's payload actually lives.
///
/// Known access types deserialise into typed variants; anything else is kept
/// verbatim as a raw map so that future access types survive a
/// read-modify-write cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Access {
    Known(KnownAccess),
    Other(serde_json::Map<String, serde_json::Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KnownAccess {
    #[serde(rename = "ociRegistry")]
    OciRegistry {
        #[serde(rename = "imageReference")]
        image_reference: String,
    },
    #[serde(rename = "github")]
    Github {
        #[serde(rename = "repoUrl")]
        repo_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        git_ref: Option<String>,
    },
    #[serde(rename = "s3")]
    S3 {
        #[serde(rename = "bucketName")]
        bucket_name: String,
        #[serde(rename = "objectKey")]
        object_key: String,
    },
    #[serde(rename = "localBlob")]
    LocalBlob {
        #[serde(rename = "localReference")]
        local_reference: String,
        #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(rename = "referenceName", default, skip_serializing_if = "Option::is_none")]
        reference_name: Option<String>,
    },
    #[serde(rename = "relativeOciReference")]
    RelativeOciReference { reference: String },
    #[serde(rename = "none")]
    None {},
}

impl Access {
    /// The access type discriminant, including for passthrough values.
    pub fn access_type(&self) -> Option<&str> {
        match self {
            Access::Known(KnownAccess::OciRegistry { .. }) => Some("ociRegistry"),
            Access::Known(KnownAccess::Github { .. }) => Some("github"),
            Access::Known(KnownAccess::S3 { .. }) => Some("s3"),
            Access::Known(KnownAccess::LocalBlob { .. }) => Some("localBlob"),
            Access::Known(KnownAccess::RelativeOciReference { .. }) => {
                Some("relativeOciReference")
            }
            Access::Known(KnownAccess::None {}) => Some("none"),
            Access::Other(map) => map.get("type").and_then(|v| v.as_str()),
        }
    }
}

/// A build artifact owned by a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(
        rename = "extraIdentity",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub extra_identity: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<DigestSpec>,
    #[serde(rename = "srcRefs", default, skip_serializing_if = "Vec::is_empty")]
    pub src_refs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// A source repository a component was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(
        rename = "extraIdentity",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub extra_identity: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// A reference to another component version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentReference {
    pub name: String,
    #[serde(rename = "componentName")]
    pub component_name: String,
    pub version: String,
    #[serde(
        rename = "extraIdentity",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub extra_identity: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<DigestSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl ComponentReference {
    pub fn identity(&self) -> ComponentIdentity {
        ComponentIdentity::new(&self.component_name, &self.version)
    }
}

/// One component version with its artifacts and references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub version: String,
    #[serde(
        rename = "repositoryContexts",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub repository_contexts: Vec<OcmRepository>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub provider: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    #[serde(
        rename = "componentReferences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub component_references: Vec<ComponentReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(rename = "creationTime", default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,
}

impl Component {
    pub fn identity(&self) -> ComponentIdentity {
        ComponentIdentity::new(&self.name, &self.version)
    }

    /// The repository the descriptor is currently hosted at: the last entry
    /// of the repository-context stack.
    pub fn current_repository(&self) -> Option<&OcmRepository> {
        self.repository_contexts.last()
    }

    /// Finds a label by name.
    pub fn label(&self, name: &str) -> Option<&Label> {
        self.labels.iter().find(|label| label.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
}

/// The serialised OCM document for one component version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub meta: Meta,
    pub component: Component,
}

impl ComponentDescriptor {
    pub fn new(component: Component) -> Self {
        ComponentDescriptor {
            meta: Meta {
                schema_version: SCHEMA_VERSION.to_string(),
            },
            component,
        }
    }

    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        let descriptor: ComponentDescriptor = serde_yaml::from_slice(data)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let descriptor: ComponentDescriptor = serde_json::from_slice(data)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Checks the schema version and artifact-identity uniqueness.
    pub fn validate(&self) -> Result<()> {
        if !self.meta.schema_version.eq_ignore_ascii_case(SCHEMA_VERSION) {
            return Err(Error::model(format!(
                "unsupported schema version {:?}",
                self.meta.schema_version
            )));
        }
        let component = &self.component;
        check_unique_identities(
            "resource",
            component.resources.iter().map(|r| {
                (r.name.as_str(), r.version.as_str(), &r.extra_identity)
            }),
        )?;
        check_unique_identities(
            "source",
            component.sources.iter().map(|s| {
                (s.name.as_str(), s.version.as_str(), &s.extra_identity)
            }),
        )?;
        check_unique_identities(
            "component reference",
            component.component_references.iter().map(|c| {
                (c.name.as_str(), c.version.as_str(), &c.extra_identity)
            }),
        )?;
        Ok(())
    }
}

/// Artifact identity within a component: name plus extra-identity, with the
/// version folded in implicitly when peers share a name.
pub fn artifact_identity(
    name: &str,
    version: &str,
    extra_identity: &BTreeMap<String, String>,
    name_collides: bool,
) -> BTreeMap<String, String> {
    let mut identity = extra_identity.clone();
    identity.insert("name".to_string(), name.to_string());
    if name_collides {
        identity
            .entry("version".to_string())
            .or_insert_with(|| version.to_string());
    }
    identity
}

fn check_unique_identities<'a>(
    kind: &str,
    items: impl Iterator<Item = (&'a str, &'a str, &'a BTreeMap<String, String>)> + Clone,
) -> Result<()> {
    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for (name, _, _) in items.clone() {
        *name_counts.entry(name).or_default() += 1;
    }
    let mut seen = HashSet::new();
    for (name, version, extra_identity) in items {
        let collides = name_counts.get(name).copied().unwrap_or(0) > 1;
        let identity = artifact_identity(name, version, extra_identity, collides);
        if !seen.insert(identity) {
            return Err(Error::model(format!(
                "duplicate {kind} identity for name {name:?} version {version:?}"
            )));
        }
    }
    Ok(())
}
