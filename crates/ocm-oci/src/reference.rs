//! Image reference parsing and normalisation.
//!
//! References are canonicalised with the Docker-compatible defaulting rules:
//! a missing registry host becomes `registry-1.docker.io`, a bare single-name
//! repository gains the implied `library/` owner segment, and a literal
//! `docker.io` host is rewritten to `registry-1.docker.io`.  These rules must
//! be reproduced exactly for compatibility with already-deployed images.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Hostname the Docker CLI defaults to when no registry is given.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Owner segment implied for single-name Docker Hub repositories.
const LIBRARY_NAMESPACE: &str = "library";

/// The tag component of a parsed reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    /// No tag or digest was given.
    Absent,
    /// A symbolic tag such as `3.19` or `latest`.
    Symbolic(String),
    /// A content-addressed tag, `algorithm:hex`.
    Digest(String),
    /// Both present, `symbol@algorithm:hex`.  Reported externally via the
    /// digest for uniqueness; the symbolic part stays retrievable.
    Mixed { tag: String, digest: String },
}

impl Tag {
    pub fn is_digest(&self) -> bool {
        matches!(self, Tag::Digest(_) | Tag::Mixed { .. })
    }

    /// The digest component, if any.
    pub fn digest(&self) -> Option<&str> {
        match self {
            Tag::Digest(digest) | Tag::Mixed { digest, .. } => Some(digest),
            _ => None,
        }
    }

    /// The symbolic component, if any.
    pub fn symbolic(&self) -> Option<&str> {
        match self {
            Tag::Symbolic(tag) | Tag::Mixed { tag, .. } => Some(tag),
            _ => None,
        }
    }
}

/// A normalised OCI image reference: registry host\[:port\], lower-cased
/// repository path, and tag-or-digest.  Immutable once parsed; equality is
/// value-based and case-insensitive on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Tag,
}

impl ImageReference {
    /// Parses and canonicalises a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }
        if reference.contains(char::is_whitespace) {
            return Err(invalid("whitespace in reference"));
        }

        // Tag detection happens on the last path segment so that a port in
        // the registry host (`localhost:5000/x`) is not mistaken for a tag.
        let (remainder, tag) = match reference.rsplit_once('/') {
            Some((head, last)) => {
                let (last, tag) = split_tag(last, &invalid)?;
                if last.is_empty() {
                    return Err(invalid("empty repository segment"));
                }
                (format!("{head}/{last}"), tag)
            }
            None => {
                let (name, tag) = split_tag(reference, &invalid)?;
                if name.is_empty() {
                    return Err(invalid("empty repository"));
                }
                (name.to_string(), tag)
            }
        };

        let mut segments: Vec<&str> = remainder.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty path segment"));
        }

        // A first segment without '.' or ':' is not a registry host.
        let registry = if segments.len() > 1
            && (segments[0].contains('.') || segments[0].contains(':'))
        {
            let host = segments.remove(0);
            if host.eq_ignore_ascii_case("docker.io") {
                DEFAULT_REGISTRY.to_string()
            } else {
                host.to_ascii_lowercase()
            }
        } else {
            DEFAULT_REGISTRY.to_string()
        };

        if registry == DEFAULT_REGISTRY && segments.len() == 1 {
            segments.insert(0, LIBRARY_NAMESPACE);
        }

        // OCI requires lower-case repository paths.
        let repository = segments.join("/").to_ascii_lowercase();

        Ok(ImageReference {
            registry,
            repository,
            tag,
        })
    }

    /// Registry host, including the port if one was given.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Network location of the registry (alias for [`Self::registry`],
    /// matching the `host[:port]` terminology of the distribution spec).
    pub fn netloc(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// `registry/repository` without any tag or digest.
    pub fn ref_without_tag(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The string a registry expects in manifest URLs: the digest when one
    /// is known (also for mixed tags, for uniqueness), else the symbolic
    /// tag, else `latest`.
    pub fn target(&self) -> &str {
        match &self.tag {
            Tag::Digest(digest) | Tag::Mixed { digest, .. } => digest,
            Tag::Symbolic(tag) => tag,
            Tag::Absent => "latest",
        }
    }

    /// Derived reference with the symbolic tag replaced.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Tag::Symbolic(tag.into()),
        }
    }

    /// Derived reference addressing a specific digest.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Tag::Digest(digest.into()),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.tag {
            Tag::Absent => Ok(()),
            Tag::Symbolic(tag) => write!(f, ":{tag}"),
            Tag::Digest(digest) => write!(f, "@{digest}"),
            Tag::Mixed { tag, digest } => write!(f, ":{tag}@{digest}"),
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ImageReference::parse(s)
    }
}

fn split_tag<'a>(
    segment: &'a str,
    invalid: &dyn Fn(&str) -> Error,
) -> Result<(&'a str, Tag)> {
    if let Some((head, digest)) = segment.split_once('@') {
        if !is_digest(digest) {
            return Err(invalid("malformed digest"));
        }
        return match head.split_once(':') {
            Some((name, tag)) if !tag.is_empty() => Ok((
                name,
                Tag::Mixed {
                    tag: tag.to_string(),
                    digest: digest.to_string(),
                },
            )),
            Some(_) => Err(invalid("empty tag before digest")),
            None => Ok((head, Tag::Digest(digest.to_string()))),
        };
    }
    match segment.split_once(':') {
        Some((name, tag)) if !tag.is_empty() => Ok((name, Tag::Symbolic(tag.to_string()))),
        Some(_) => Err(invalid("empty tag")),
        None => Ok((segment, Tag::Absent)),
    }
}

fn is_digest(candidate: &str) -> bool {
    match candidate.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// Decomposition of an AWS ECR registry hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsRegistry<'a> {
    pub registry_id: &'a str,
    pub service: &'a str,
    pub region: &'a str,
}

/// Parses hosts of the form `<account>.dkr.ecr.<region>.amazonaws.com`.
/// Returns `None` for anything that is not an ECR hostname.
pub fn parse_aws_registry(host: &str) -> Option<AwsRegistry<'_>> {
    let host = host.split_once('/').map_or(host, |(h, _)| h);
    let rest = host.strip_suffix(".amazonaws.com")?;
    let mut parts = rest.splitn(4, '.');
    let registry_id = parts.next()?;
    let dkr = parts.next()?;
    let service = parts.next()?;
    let region = parts.next()?;
    if dkr != "dkr" || registry_id.is_empty() || region.is_empty() {
        return None;
    }
    Some(AwsRegistry {
        registry_id,
        service,
        region,
    })
}
