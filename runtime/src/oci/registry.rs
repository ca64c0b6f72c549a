//! Registry resolver backed by `oci-distribution`.
//!
//! Resolving a tag pulls the root manifest (or index) once; its raw bytes
//! are kept so the dispatcher's fetch of the root does not hit the
//! registry a second time.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use imgpull_core::{
    media_types, BlobReader, Descriptor, Digest, Fetcher, NodeKind, PullError, Resolved, Resolver,
    Result,
};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use tracing::{debug, info};

use super::reference::ImageReference;

/// Media types offered when requesting manifests.
const MANIFEST_MEDIA_TYPES: &[&str] = &[
    media_types::OCI_INDEX,
    media_types::OCI_MANIFEST,
    media_types::DOCKER_MANIFEST_LIST,
    media_types::DOCKER_MANIFEST,
];

const PREALLOC_LIMIT: u64 = 16 * 1024 * 1024;

/// Authentication credentials for a container registry.
#[derive(Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, falling back to
    /// anonymous access unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Resolves references against remote registries.
pub struct RegistryResolver {
    client: Arc<Client>,
    auth: RegistryAuth,
    manifests: Arc<DashMap<Digest, Vec<u8>>>,
}

impl RegistryResolver {
    /// A resolver talking HTTPS.
    pub fn new(auth: RegistryAuth) -> Self {
        Self::with_protocol(auth, ClientProtocol::Https)
    }

    /// A resolver talking plain HTTP, for local test registries.
    pub fn insecure(auth: RegistryAuth) -> Self {
        Self::with_protocol(auth, ClientProtocol::Http)
    }

    fn with_protocol(auth: RegistryAuth, protocol: ClientProtocol) -> Self {
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        Self {
            client: Arc::new(Client::new(config)),
            auth,
            manifests: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, reference: &str) -> Result<Resolved> {
        let parsed = ImageReference::parse(reference)?;
        info!(reference = %parsed, "Resolving image reference");

        let (raw, digest) = pull_manifest(&self.client, &self.auth, &parsed).await?;
        let media_type = sniff_media_type(&raw)?;
        let descriptor = Descriptor::new(media_type, digest.clone(), raw.len() as i64);
        self.manifests.insert(digest, raw);

        debug!(
            reference = %parsed,
            digest = %descriptor.digest,
            media_type = %descriptor.media_type,
            "Resolved image reference"
        );
        Ok(Resolved {
            name: parsed.full_reference(),
            descriptor,
        })
    }

    async fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>> {
        Ok(Arc::new(RegistryFetcher {
            client: self.client.clone(),
            auth: self.auth.clone(),
            reference: ImageReference::parse(name)?,
            manifests: self.manifests.clone(),
        }))
    }
}

struct RegistryFetcher {
    client: Arc<Client>,
    auth: RegistryAuth,
    reference: ImageReference,
    manifests: Arc<DashMap<Digest, Vec<u8>>>,
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader> {
        // The root manifest is served from the resolve cache exactly once.
        if let Some((_, raw)) = self.manifests.remove(&descriptor.digest) {
            return Ok(Box::new(Cursor::new(raw)));
        }

        let pinned = self.reference.with_digest(descriptor.digest.clone());
        if descriptor.kind().has_children() {
            let (raw, _) = pull_manifest(&self.client, &self.auth, &pinned).await?;
            return Ok(Box::new(Cursor::new(raw)));
        }

        let oci_ref = oci_reference(&pinned)?;
        let oci_desc = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.to_string(),
            size: descriptor.size,
            ..Default::default()
        };

        let capacity = descriptor.expected_size().unwrap_or(0).min(PREALLOC_LIMIT);
        let mut data = Vec::with_capacity(capacity as usize);
        self.client
            .pull_blob(&oci_ref, &oci_desc, &mut data)
            .await
            .map_err(|e| registry_error(&pinned, "pull blob", e))?;
        debug!(digest = %descriptor.digest, bytes = data.len(), "Pulled blob");
        Ok(Box::new(Cursor::new(data)))
    }
}

async fn pull_manifest(
    client: &Client,
    auth: &RegistryAuth,
    reference: &ImageReference,
) -> Result<(Vec<u8>, Digest)> {
    let oci_ref = oci_reference(reference)?;
    let (raw, digest) = client
        .pull_manifest_raw(&oci_ref, &auth.to_oci_auth(), MANIFEST_MEDIA_TYPES)
        .await
        .map_err(|e| registry_error(reference, "pull manifest", e))?;
    Ok((raw, Digest::parse(&digest)?))
}

fn oci_reference(reference: &ImageReference) -> Result<Reference> {
    let full = reference.full_reference();
    full.parse::<Reference>()
        .map_err(|e| PullError::InvalidReference(format!("'{}': {}", full, e)))
}

fn registry_error(reference: &ImageReference, action: &str, err: OciDistributionError) -> PullError {
    if is_not_found(&err) {
        return PullError::NotFound(format!("{} ({}): {}", reference, action, err));
    }
    PullError::Registry {
        registry: reference.registry.clone(),
        message: format!("Failed to {} for {}: {}", action, reference, err),
    }
}

/// Whether the registry reported the manifest, blob or repository as absent.
fn is_not_found(err: &OciDistributionError) -> bool {
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|e| {
            matches!(
                e.code,
                OciErrorCode::ManifestUnknown
                    | OciErrorCode::BlobUnknown
                    | OciErrorCode::NameUnknown
                    | OciErrorCode::ManifestBlobUnknown
            )
        }),
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RequestError(e) => e.status().map(|s| s.as_u16()) == Some(404),
        _ => false,
    }
}

/// Media type of a raw manifest, from its `mediaType` field or its shape.
fn sniff_media_type(raw: &[u8]) -> Result<String> {
    let value: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| PullError::Serialization(format!("manifest: {}", e)))?;

    if let Some(media_type) = value.get("mediaType").and_then(|v| v.as_str()) {
        if NodeKind::from_media_type(media_type).has_children() {
            return Ok(media_type.to_string());
        }
    }
    if value.get("manifests").is_some() {
        return Ok(media_types::OCI_INDEX.to_string());
    }
    if value.get("config").is_some() {
        return Ok(media_types::OCI_MANIFEST.to_string());
    }
    Err(PullError::Serialization(
        "document is neither a manifest nor an index".to_string(),
    ))
}
