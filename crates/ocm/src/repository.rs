//! Storage of component descriptors as OCI artifacts.
//!
//! A descriptor is stored as a single-layer artifact: a tar archive holding
//! exactly one file named `component-descriptor.yaml`, referenced from an
//! image manifest whose config blob records the layer's digest and media
//! type.  The OCI reference is derived from the OCM repository prefix and
//! the component identity.

use std::io::{Cursor, Read};

use log::debug;
use serde::{Deserialize, Serialize};

use ocm_oci::client::sha256_digest;
use ocm_oci::{BlockingClient, Client, ImageReference};

use crate::error::{Error, Result};
use crate::model::{ComponentDescriptor, ComponentIdentity, OcmRepository};

pub const COMPONENT_DESCRIPTOR_FILENAME: &str = "component-descriptor.yaml";

pub const COMPONENT_DESCRIPTOR_TAR_MEDIA_TYPE: &str =
    "application/vnd.ocm.software.component-descriptor.v2+yaml+tar";

pub const COMPONENT_CONFIG_MEDIA_TYPE: &str =
    "application/vnd.ocm.software.component.config.v1+json";

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Descriptors live under a fixed repository infix below the OCM repository
/// prefix.
const DESCRIPTOR_REPOSITORY_INFIX: &str = "component-descriptors";

/// Maps a component identity to the OCI reference its descriptor is stored
/// at.  Component names are lower-cased (OCI repository naming); semver
/// build metadata (`+`) is not representable in a tag and is rewritten to
/// `.build-`.
pub fn descriptor_oci_reference(
    repository: &OcmRepository,
    identity: &ComponentIdentity,
) -> Result<ImageReference> {
    let tag = identity.version.replace('+', ".build-");
    let reference = format!(
        "{}/{}/{}:{}",
        repository.oci_prefix(),
        DESCRIPTOR_REPOSITORY_INFIX,
        identity.name.to_lowercase(),
        tag,
    );
    Ok(ImageReference::parse(&reference)?)
}

/// Config blob of a descriptor artifact, pointing at the descriptor layer.
#[derive(Debug, Serialize, Deserialize)]
struct ComponentConfig {
    #[serde(rename = "componentDescriptorLayer")]
    component_descriptor_layer: LayerRef,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerRef {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
}

/// Serialises a descriptor into its tar-layer payload.
pub fn descriptor_to_tar(descriptor: &ComponentDescriptor) -> Result<Vec<u8>> {
    let yaml = descriptor.to_yaml()?;
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(yaml.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, COMPONENT_DESCRIPTOR_FILENAME, yaml.as_slice())?;
    Ok(builder.into_inner()?)
}

/// Extracts a descriptor from its tar-layer payload.
pub fn descriptor_from_tar(data: &[u8]) -> Result<ComponentDescriptor> {
    let mut archive = tar::Archive::new(Cursor::new(data));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        if path.file_name().and_then(|n| n.to_str()) == Some(COMPONENT_DESCRIPTOR_FILENAME) {
            let mut yaml = Vec::new();
            entry.read_to_end(&mut yaml)?;
            return ComponentDescriptor::from_yaml(&yaml);
        }
    }
    Err(Error::MalformedArtifact {
        reason: format!("tar layer contains no {COMPONENT_DESCRIPTOR_FILENAME}"),
    })
}

/// The three blobs making up a descriptor artifact, ready for upload.
#[derive(Debug)]
pub struct DescriptorArtifact {
    pub layer: Vec<u8>,
    pub layer_digest: String,
    pub config: Vec<u8>,
    pub config_digest: String,
    pub manifest: Vec<u8>,
}

/// Builds the full artifact (layer tar, config blob, manifest) for a
/// descriptor.
pub fn build_artifact(descriptor: &ComponentDescriptor) -> Result<DescriptorArtifact> {
    let layer = descriptor_to_tar(descriptor)?;
    let layer_digest = sha256_digest(&layer);

    let config = serde_json::to_vec(&ComponentConfig {
        component_descriptor_layer: LayerRef {
            media_type: COMPONENT_DESCRIPTOR_TAR_MEDIA_TYPE.to_string(),
            digest: layer_digest.clone(),
            size: layer.len() as u64,
        },
    })?;
    let config_digest = sha256_digest(&config);

    let manifest = serde_json::to_vec(&Manifest {
        schema_version: 2,
        media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
        config: Descriptor {
            media_type: COMPONENT_CONFIG_MEDIA_TYPE.to_string(),
            digest: config_digest.clone(),
            size: config.len() as u64,
        },
        layers: vec![Descriptor {
            media_type: COMPONENT_DESCRIPTOR_TAR_MEDIA_TYPE.to_string(),
            digest: layer_digest.clone(),
            size: layer.len() as u64,
        }],
    })?;

    Ok(DescriptorArtifact {
        layer,
        layer_digest,
        config,
        config_digest,
        manifest,
    })
}

/// Picks the descriptor layer out of a stored artifact manifest: the layer
/// with the descriptor media type, falling back to the first layer for
/// artifacts written by older tools.
fn descriptor_layer(manifest: &Manifest) -> Result<&Descriptor> {
    manifest
        .layers
        .iter()
        .find(|layer| layer.media_type == COMPONENT_DESCRIPTOR_TAR_MEDIA_TYPE)
        .or_else(|| manifest.layers.first())
        .ok_or_else(|| Error::MalformedArtifact {
            reason: "artifact manifest has no layers".to_string(),
        })
}

fn parse_manifest(bytes: &[u8], reference: &ImageReference) -> Result<Manifest> {
    serde_json::from_slice(bytes).map_err(|err| Error::MalformedArtifact {
        reason: format!("manifest of {reference} is not a descriptor artifact: {err}"),
    })
}

/// Fetches a descriptor from an OCM repository via the blocking client.
pub fn fetch(
    client: &BlockingClient,
    repository: &OcmRepository,
    identity: &ComponentIdentity,
) -> Result<Option<ComponentDescriptor>> {
    let reference = descriptor_oci_reference(repository, identity)?;
    let Some(manifest) = client.manifest_opt(&reference, None)? else {
        return Ok(None);
    };
    let manifest = parse_manifest(&manifest.bytes, &reference)?;
    let layer = descriptor_layer(&manifest)?;
    let tar = client.blob_bytes(&reference, &layer.digest)?;
    debug!("fetched descriptor {identity} from {reference}");
    Ok(Some(descriptor_from_tar(&tar)?))
}

/// Fetches a descriptor from an OCM repository via the async client.
pub async fn fetch_async(
    client: &Client,
    repository: &OcmRepository,
    identity: &ComponentIdentity,
) -> Result<Option<ComponentDescriptor>> {
    let reference = descriptor_oci_reference(repository, identity)?;
    let Some(manifest) = client.manifest_opt(&reference, None).await? else {
        return Ok(None);
    };
    let manifest = parse_manifest(&manifest.bytes, &reference)?;
    let layer = descriptor_layer(&manifest)?;
    let tar = client.blob_bytes(&reference, &layer.digest).await?;
    debug!("fetched descriptor {identity} from {reference}");
    Ok(Some(descriptor_from_tar(&tar)?))
}

/// Uploads a descriptor to an OCM repository via the blocking client.
pub fn upload(
    client: &BlockingClient,
    repository: &OcmRepository,
    descriptor: &ComponentDescriptor,
) -> Result<ImageReference> {
    let identity = descriptor.component.identity();
    let reference = descriptor_oci_reference(repository, &identity)?;
    let artifact = build_artifact(descriptor)?;
    client.put_blob(&reference, &artifact.layer_digest, &artifact.layer)?;
    client.put_blob(&reference, &artifact.config_digest, &artifact.config)?;
    client.put_manifest(&reference, OCI_MANIFEST_MEDIA_TYPE, &artifact.manifest)?;
    debug!("uploaded descriptor {identity} to {reference}");
    Ok(reference)
}

/// Uploads a descriptor to an OCM repository via the async client.
pub async fn upload_async(
    client: &Client,
    repository: &OcmRepository,
    descriptor: &ComponentDescriptor,
) -> Result<ImageReference> {
    let identity = descriptor.component.identity();
    let reference = descriptor_oci_reference(repository, &identity)?;
    let artifact = build_artifact(descriptor)?;
    client
        .put_blob(&reference, &artifact.layer_digest, &artifact.layer)
        .await?;
    client
        .put_blob(&reference, &artifact.config_digest, &artifact.config)
        .await?;
    client
        .put_manifest(&reference, OCI_MANIFEST_MEDIA_TYPE, artifact.manifest.clone())
        .await?;
    debug!("uploaded descriptor {identity} to {reference}");
    Ok(reference)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use crate::model::test::minimal_descriptor;

    use super::*;

    #[test]
    fn test_descriptor_oci_reference() {
        let repository = OcmRepository::new("eu.gcr.io/acme/ocm");
        let identity = ComponentIdentity::new("github.com/Acme/App", "1.2.3");
        let reference = descriptor_oci_reference(&repository, &identity).unwrap();
        assert_eq!(
            reference.to_string(),
            "eu.gcr.io/acme/ocm/component-descriptors/github.com/acme/app:1.2.3"
        );
    }

    #[test]
    fn test_build_metadata_version_maps_to_tag() {
        let repository = OcmRepository::new("eu.gcr.io/acme/ocm");
        let identity = ComponentIdentity::new("github.com/acme/app", "1.2.3+build-7");
        let reference = descriptor_oci_reference(&repository, &identity).unwrap();
        assert!(reference.to_string().ends_with(":1.2.3.build-build-7"));
    }

    #[test]
    fn test_tar_round_trip() {
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        let tar = descriptor_to_tar(&descriptor).unwrap();
        let decoded = descriptor_from_tar(&tar).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn test_tar_without_descriptor_entry_is_rejected() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "other.txt", &b"abc"[..]).unwrap();
        let tar = builder.into_inner().unwrap();
        assert!(descriptor_from_tar(&tar).is_err());
    }

    #[test]
    fn test_artifact_manifest_references_both_blobs() {
        let descriptor = minimal_descriptor("github.com/acme/app", "1.0.0");
        let artifact = build_artifact(&descriptor).unwrap();
        let manifest: Manifest = serde_json::from_slice(&artifact.manifest).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.config.media_type, COMPONENT_CONFIG_MEDIA_TYPE);
        assert_eq!(manifest.config.digest, artifact.config_digest);
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(
            manifest.layers[0].media_type,
            COMPONENT_DESCRIPTOR_TAR_MEDIA_TYPE
        );
        assert_eq!(manifest.layers[0].digest, artifact.layer_digest);
        assert_eq!(manifest.layers[0].size, artifact.layer.len() as u64);

        let config: ComponentConfig = serde_json::from_slice(&artifact.config).unwrap();
        assert_eq!(
            config.component_descriptor_layer.digest,
            artifact.layer_digest
        );
    }
}
