//! OCI-distribution-backed [`ComponentClient`].
//!
//! Component versions are tags under the `component-descriptors/<component>`
//! repository, the descriptor document is the manifest's config blob, and
//! transfer copies blobs before the manifest so a tag never points at missing
//! content.

use std::collections::HashMap;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::client::{
    AccessContext, AuthError, BasicCredentials, ComponentClient, ComponentDescriptor,
    DescriptorError, DescriptorSignature, INTERNAL_SIGNATURE_NAME, RegistryError, SignError,
    TransferError, VerifyError,
};
use crate::config::CredentialEntry;
use crate::subscription::{RepositoryLocation, SignaturePolicy, Subscription};

/// Repository prefix component descriptors are stored under.
const DESCRIPTOR_REPOSITORY_PREFIX: &str = "component-descriptors";

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

const USER_AGENT: &str = "component-replicator";

/// Named credential material loaded from the daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: HashMap<String, CredentialEntry>,
}

impl CredentialStore {
    pub fn new(entries: Vec<CredentialEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect(),
        }
    }

    fn basic(&self, name: &str) -> Option<BasicCredentials> {
        let entry = self.entries.get(name)?;
        match (&entry.username, &entry.password) {
            (Some(username), Some(password)) => Some(BasicCredentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    fn key_material(&self, name: &str) -> Option<Vec<u8>> {
        self.entries
            .get(name)
            .and_then(|entry| entry.key_material.as_ref())
            .map(|key| key.as_bytes().to_vec())
    }
}

/// [`ComponentClient`] speaking the OCI distribution API over HTTP.
pub struct OciComponentClient {
    http: reqwest::Client,
    credentials: CredentialStore,
    insecure_http: bool,
}

impl OciComponentClient {
    pub fn new(credentials: CredentialStore) -> Self {
        Self {
            http: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .expect("Failed to create HTTP client"),
            credentials,
            insecure_http: false,
        }
    }

    /// Talk to registries over plain HTTP instead of HTTPS. Intended for
    /// local registries and tests.
    pub fn with_insecure_http(mut self) -> Self {
        self.insecure_http = true;
        self
    }

    fn base_url(&self, repository: &RepositoryLocation) -> String {
        let url = repository.url.trim_end_matches('/');
        if url.contains("://") {
            url.to_string()
        } else if self.insecure_http {
            format!("http://{url}")
        } else {
            format!("https://{url}")
        }
    }

    fn descriptor_repository(component: &str) -> String {
        format!("{DESCRIPTOR_REPOSITORY_PREFIX}/{component}")
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        credentials: &Option<BasicCredentials>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        request
    }

    async fn blob_exists(
        &self,
        base: &str,
        repository: &str,
        digest: &str,
        credentials: &Option<BasicCredentials>,
    ) -> Result<bool, String> {
        let url = format!("{base}/v2/{repository}/blobs/{digest}");
        let response = self
            .request(reqwest::Method::HEAD, &url, credentials)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        Ok(response.status().is_success())
    }

    async fn fetch_blob(
        &self,
        base: &str,
        repository: &str,
        digest: &str,
        credentials: &Option<BasicCredentials>,
    ) -> Result<Vec<u8>, String> {
        let url = format!("{base}/v2/{repository}/blobs/{digest}");
        let response = self
            .request(reqwest::Method::GET, &url, credentials)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!(
                "source blob {digest} returned {}",
                response.status()
            ));
        }
        Ok(response.bytes().await.map_err(|err| err.to_string())?.to_vec())
    }

    async fn push_blob(
        &self,
        base: &str,
        repository: &str,
        digest: &str,
        data: Vec<u8>,
        credentials: &Option<BasicCredentials>,
    ) -> Result<(), String> {
        let uploads_url = format!("{base}/v2/{repository}/blobs/uploads/");
        let response = self
            .request(reqwest::Method::POST, &uploads_url, credentials)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!(
                "blob upload session returned {}",
                response.status()
            ));
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| "blob upload session returned no location".to_string())?;
        let upload_url = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{base}{location}")
        };

        let response = self
            .request(reqwest::Method::PUT, &upload_url, credentials)
            .query(&[("digest", digest)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!(
                "blob upload for {digest} returned {}",
                response.status()
            ));
        }

        Ok(())
    }
}

fn payload_digest(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Tag listing response of the distribution API.
#[derive(Debug, Deserialize)]
struct TagListResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciManifest {
    config: OciBlobRef,
    #[serde(default)]
    layers: Vec<OciBlobRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciBlobRef {
    digest: String,
}

/// The descriptor document stored in the manifest's config blob.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DescriptorDocument {
    signatures: Vec<DescriptorSignature>,
}

#[async_trait::async_trait]
impl ComponentClient for OciComponentClient {
    async fn create_authenticated_context(
        &self,
        subscription: &Subscription,
    ) -> Result<AccessContext, AuthError> {
        let mut ctx = AccessContext::default();

        if let Some(name) = &subscription.source.credentials {
            ctx.source = Some(
                self.credentials
                    .basic(name)
                    .ok_or_else(|| AuthError::CredentialsNotFound(name.clone()))?,
            );
        }

        if let Some(destination) = &subscription.destination {
            if let Some(name) = &destination.credentials {
                ctx.destination = Some(
                    self.credentials
                        .basic(name)
                        .ok_or_else(|| AuthError::CredentialsNotFound(name.clone()))?,
                );
            }
        }

        // Missing verification keys surface as KeyNotFound at verify time.
        for policy in &subscription.verify {
            if let Some(key) = self.credentials.key_material(&policy.public_key) {
                ctx.verification_keys.insert(policy.public_key.clone(), key);
            }
        }

        if let Some(name) = &subscription.signing_key {
            ctx.signing_key = Some(
                self.credentials
                    .key_material(name)
                    .ok_or_else(|| AuthError::CredentialsNotFound(name.clone()))?,
            );
        }

        debug!(subscription = %subscription.id, "credentials configured");
        Ok(ctx)
    }

    async fn list_versions(
        &self,
        ctx: &AccessContext,
        repository: &RepositoryLocation,
        component: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let url = format!(
            "{}/v2/{}/tags/list",
            self.base_url(repository),
            Self::descriptor_repository(component)
        );

        let response = self
            .request(reqwest::Method::GET, &url, &ctx.source)
            .send()
            .await
            .map_err(|err| RegistryError::Unreachable(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(component.to_string()));
        }
        if !status.is_success() {
            warn!("registry returned status {} for {}", status, url);
            return Err(RegistryError::InvalidResponse(format!(
                "unexpected status: {status}"
            )));
        }

        let tags: TagListResponse = response
            .json()
            .await
            .map_err(|err| RegistryError::InvalidResponse(err.to_string()))?;

        Ok(tags.tags.unwrap_or_default())
    }

    async fn get_component_descriptor(
        &self,
        ctx: &AccessContext,
        repository: &RepositoryLocation,
        component: &str,
        version: &str,
    ) -> Result<ComponentDescriptor, DescriptorError> {
        let base = self.base_url(repository);
        let repo = Self::descriptor_repository(component);
        let corrupt = |message: String| DescriptorError::Corrupt {
            component: component.to_string(),
            version: version.to_string(),
            message,
        };

        let manifest_url = format!("{base}/v2/{repo}/manifests/{version}");
        let response = self
            .request(reqwest::Method::GET, &manifest_url, &ctx.source)
            .header(reqwest::header::ACCEPT, MANIFEST_MEDIA_TYPE)
            .send()
            .await
            .map_err(|err| DescriptorError::Unreachable(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DescriptorError::NotFound {
                component: component.to_string(),
                version: version.to_string(),
            });
        }
        if !status.is_success() {
            return Err(DescriptorError::Unreachable(format!(
                "manifest fetch returned {status}"
            )));
        }

        let manifest: serde_json::Value = response
            .json()
            .await
            .map_err(|err| corrupt(format!("manifest unreadable: {err}")))?;
        let parsed: OciManifest = serde_json::from_value(manifest.clone())
            .map_err(|err| corrupt(format!("manifest malformed: {err}")))?;

        let blob_url = format!("{base}/v2/{repo}/blobs/{}", parsed.config.digest);
        let response = self
            .request(reqwest::Method::GET, &blob_url, &ctx.source)
            .send()
            .await
            .map_err(|err| DescriptorError::Unreachable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(corrupt(format!(
                "descriptor blob {} returned {}",
                parsed.config.digest,
                response.status()
            )));
        }
        let payload = response
            .bytes()
            .await
            .map_err(|err| DescriptorError::Unreachable(err.to_string()))?
            .to_vec();

        let document: DescriptorDocument = serde_json::from_slice(&payload)
            .map_err(|err| corrupt(format!("descriptor document malformed: {err}")))?;

        debug!(component, version, "fetched component descriptor");
        Ok(ComponentDescriptor {
            name: component.to_string(),
            version: version.to_string(),
            signatures: document.signatures,
            manifest,
            payload,
            source: repository.clone(),
        })
    }

    async fn verify_signatures(
        &self,
        ctx: &AccessContext,
        descriptor: &ComponentDescriptor,
        policies: &[SignaturePolicy],
    ) -> Result<(), VerifyError> {
        let digest = payload_digest(&descriptor.payload);

        for policy in policies {
            let signature = descriptor
                .signatures
                .iter()
                .find(|signature| signature.name == policy.name)
                .ok_or_else(|| VerifyError::SignatureNameAbsent {
                    name: policy.name.clone(),
                })?;

            if !ctx.verification_keys.contains_key(&policy.public_key) {
                return Err(VerifyError::KeyNotFound(policy.public_key.clone()));
            }

            if signature.digest != digest {
                return Err(VerifyError::DigestMismatch {
                    name: policy.name.clone(),
                });
            }

            info!(signature = %policy.name, component = %descriptor.name, "component signature verified");
        }

        Ok(())
    }

    async fn sign_destination_component(
        &self,
        ctx: &AccessContext,
        descriptor: &mut ComponentDescriptor,
    ) -> Result<Vec<u8>, SignError> {
        let key = ctx
            .signing_key
            .clone()
            .ok_or_else(|| SignError::Failure("no signing key configured".to_string()))?;

        let digest = payload_digest(&descriptor.payload);
        descriptor
            .signatures
            .retain(|signature| signature.name != INTERNAL_SIGNATURE_NAME);
        descriptor.signatures.push(DescriptorSignature {
            name: INTERNAL_SIGNATURE_NAME.to_string(),
            digest,
        });

        Ok(key)
    }

    async fn transfer_component(
        &self,
        ctx: &AccessContext,
        descriptor: &ComponentDescriptor,
        destination: &RepositoryLocation,
    ) -> Result<(), TransferError> {
        let repo = Self::descriptor_repository(&descriptor.name);
        let source_base = self.base_url(&descriptor.source);
        let destination_base = self.base_url(destination);
        let partial = |message: String| TransferError::Partial {
            component: descriptor.name.clone(),
            version: descriptor.version.clone(),
            message,
        };

        let manifest: OciManifest = serde_json::from_value(descriptor.manifest.clone())
            .map_err(|err| partial(format!("manifest malformed: {err}")))?;

        let mut digests = vec![manifest.config.digest.clone()];
        digests.extend(manifest.layers.iter().map(|layer| layer.digest.clone()));

        for digest in &digests {
            let exists = self
                .blob_exists(&destination_base, &repo, digest, &ctx.destination)
                .await
                .map_err(TransferError::DestinationUnreachable)?;
            if exists {
                debug!(%digest, "blob already present at destination");
                continue;
            }

            let data = if *digest == manifest.config.digest {
                descriptor.payload.clone()
            } else {
                self.fetch_blob(&source_base, &repo, digest, &ctx.source)
                    .await
                    .map_err(&partial)?
            };

            self.push_blob(&destination_base, &repo, digest, data, &ctx.destination)
                .await
                .map_err(&partial)?;
        }

        // Manifest goes last so the tag never points at missing blobs.
        let manifest_url = format!(
            "{destination_base}/v2/{repo}/manifests/{}",
            descriptor.version
        );
        let body = serde_json::to_vec(&descriptor.manifest)
            .map_err(|err| partial(format!("manifest unserializable: {err}")))?;
        let response = self
            .request(reqwest::Method::PUT, &manifest_url, &ctx.destination)
            .header(reqwest::header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|err| TransferError::DestinationUnreachable(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(TransferError::OverwriteConflict {
                version: descriptor.version.clone(),
            });
        }
        if !status.is_success() {
            return Err(partial(format!("manifest upload returned {status}")));
        }

        info!(
            component = %descriptor.name,
            version = %descriptor.version,
            destination = %destination.url,
            "transferred component"
        );
        Ok(())
    }
}
