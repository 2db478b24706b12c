//! Platform normalisation and multi-arch index enumeration.

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::client::{Client, RawManifest};
use crate::error::{Error, Result};
use crate::reference::ImageReference;

/// An image platform in normalised form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        let (architecture, variant) = canonical_architecture(&architecture.into());
        Platform {
            os: os.into(),
            architecture,
            variant,
        }
    }

    /// Canonicalises os/architecture/variant in place, folding aliases and
    /// deriving variants where the architecture name implies one.
    pub fn normalise(&mut self) {
        let (architecture, implied_variant) = canonical_architecture(&self.architecture);
        self.architecture = architecture;
        if self.variant.is_none() {
            self.variant = implied_variant;
        }
        // 32-bit arm with variant v8 is really arm64
        if self.architecture == "arm" && self.variant.as_deref() == Some("v8") {
            self.architecture = "arm64".to_string();
            self.variant = None;
        }
        // arm64 without an explicit variant means v8
        if self.architecture == "arm64" && self.variant.as_deref() == Some("v8") {
            self.variant = None;
        }
    }

    /// Whether this platform satisfies `filter`, comparing normalised forms.
    /// A filter without a variant matches any variant.
    pub fn matches(&self, filter: &Platform) -> bool {
        let mut this = self.clone();
        this.normalise();
        let mut filter = filter.clone();
        filter.normalise();
        this.os == filter.os
            && this.architecture == filter.architecture
            && (filter.variant.is_none() || this.variant == filter.variant)
    }

    /// `os/architecture[/variant]`, the form used in image references and
    /// `docker manifest inspect` output.
    pub fn canonical_name(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}/{}/{}", self.os, self.architecture, variant),
            None => format!("{}/{}", self.os, self.architecture),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_name())
    }
}

/// Folds architecture aliases to the GOARCH-style canonical names used in
/// image indexes, returning the canonical name and an implied variant.
fn canonical_architecture(architecture: &str) -> (String, Option<String>) {
    match architecture {
        "x86_64" | "x86-64" | "amd64" => ("amd64".to_string(), None),
        "aarch64" | "arm64" | "armv8l" | "armv8b" => ("arm64".to_string(), None),
        "armhf" => ("arm".to_string(), Some("v7".to_string())),
        "armel" => ("arm".to_string(), Some("v6".to_string())),
        "i386" | "x86" => ("386".to_string(), None),
        other => (other.to_string(), None),
    }
}

/// Wire shape of a manifest-list / index entry's platform block, plus the
/// fields of an image config blob that carry platform information.
#[derive(Debug, Deserialize)]
struct PlatformFields {
    os: Option<String>,
    architecture: Option<String>,
    variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IndexManifestEntry {
    digest: String,
    platform: Option<PlatformFields>,
}

#[derive(Debug, Deserialize)]
struct Index {
    manifests: Vec<IndexManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct SingleManifest {
    config: ConfigDescriptor,
}

#[derive(Debug, Deserialize)]
struct ConfigDescriptor {
    digest: String,
}

/// A platform together with the single-arch manifest reference it was
/// resolved from.
#[derive(Debug, Clone)]
pub struct PlatformImage {
    pub image: ImageReference,
    pub platform: Platform,
}

/// Resolves the platform of a single-arch image by reading its config blob.
pub async fn single_platform(client: &Client, image: &ImageReference) -> Result<Platform> {
    let manifest = client.manifest(image, None).await?;
    platform_from_manifest(client, image, &manifest).await
}

async fn platform_from_manifest(
    client: &Client,
    image: &ImageReference,
    manifest: &RawManifest,
) -> Result<Platform> {
    let parsed: SingleManifest =
        serde_json::from_slice(&manifest.bytes).map_err(|err| Error::MalformedResponse {
            url: image.to_string(),
            reason: format!("not a single-arch manifest: {err}"),
        })?;
    let config = client.blob_bytes(image, &parsed.config.digest).await?;
    let fields: PlatformFields =
        serde_json::from_slice(&config).map_err(|err| Error::MalformedResponse {
            url: image.to_string(),
            reason: format!("malformed image config: {err}"),
        })?;
    let mut platform = Platform {
        os: fields.os.unwrap_or_default(),
        architecture: fields.architecture.unwrap_or_default(),
        variant: fields.variant,
    };
    platform.normalise();
    Ok(platform)
}

/// Enumerates the platforms of an image.
///
/// For a multi-arch index, each entry yields the per-digest sub-image with
/// the platform read from the sub-image's config blob, which is
/// authoritative; the index entry's platform block only fills fields the
/// config leaves empty (typically `variant`).  A single-arch image yields
/// exactly one element.
pub async fn iter_platforms<'a>(
    client: &'a Client,
    image: &'a ImageReference,
) -> Result<impl Stream<Item = Result<PlatformImage>> + 'a> {
    let manifest = client.manifest(image, None).await?;
    if !manifest.is_index() {
        let platform = platform_from_manifest(client, image, &manifest).await?;
        let single = PlatformImage {
            image: image.clone(),
            platform,
        };
        return Ok(stream::iter(vec![Ok(single)]).left_stream());
    }

    let index: Index =
        serde_json::from_slice(&manifest.bytes).map_err(|err| Error::MalformedResponse {
            url: image.to_string(),
            reason: format!("malformed image index: {err}"),
        })?;

    let entries = stream::iter(index.manifests).then(move |entry| async move {
        let sub_image = image.with_digest(entry.digest);
        let manifest = client.manifest(&sub_image, None).await?;
        let mut platform = platform_from_manifest(client, &sub_image, &manifest).await?;
        if let Some(fields) = entry.platform {
            if platform.os.is_empty() {
                platform.os = fields.os.unwrap_or_default();
            }
            if platform.architecture.is_empty() {
                platform.architecture = fields.architecture.unwrap_or_default();
            }
            if platform.variant.is_none() {
                platform.variant = fields.variant;
            }
            platform.normalise();
        }
        Ok(PlatformImage {
            image: sub_image,
            platform,
        })
    });
    Ok(entries.right_stream())
}
