//! Image reference parsing.
//!
//! `nginx`, `nginx:1.25`, `ghcr.io/org/app:v1` and `repo@sha256:...` all
//! normalize to a registry, a repository, and a tag and/or digest.

use std::fmt;

use imgpull_core::{Digest, PullError, Result};

/// Registry used when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when a reference has neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if any
    pub registry: String,
    /// Repository path, e.g. `library/nginx`
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest)
                    .map_err(|e| invalid(reference, &e.to_string()))?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // A tag separator must come after the last path separator, so
        // `localhost:5000/app` keeps its port.
        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name_tag[..split], Some(&name_tag[split + 1..]))
            }
            None => (name_tag, None),
        };

        if let Some(tag) = tag {
            if !valid_tag(tag) {
                return Err(invalid(reference, &format!("invalid tag '{}'", tag)));
            }
        }

        let (registry, repository) = split_registry(name).ok_or_else(|| {
            invalid(reference, "missing repository")
        })?;
        if !repository
            .split('/')
            .all(|part| !part.is_empty() && part.bytes().all(valid_repository_byte))
        {
            return Err(invalid(reference, "invalid repository name"));
        }

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical form, e.g. `docker.io/library/nginx:latest`.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }

    /// Same repository, pinned to `digest`.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_reference())
    }
}

fn invalid(reference: &str, reason: &str) -> PullError {
    PullError::InvalidReference(format!("'{}': {}", reference, reason))
}

/// The first path component is a registry if it looks like a host.
fn split_registry(name: &str) -> Option<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return None;
            }
            return Some((first.to_string(), rest.to_string()));
        }
    }
    if name.is_empty() {
        return None;
    }
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Some((DEFAULT_REGISTRY.to_string(), repository))
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

fn valid_repository_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-')
}
