//! Collaborator contract for component registry access.
//!
//! The reconcile driver depends only on [`ComponentClient`]; alternate
//! registry backends can be substituted without touching the decision logic.

pub mod oci;

use std::collections::HashMap;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::subscription::{RepositoryLocation, SignaturePolicy, Subscription};

/// Signature name attached to components signed by this controller.
pub const INTERNAL_SIGNATURE_NAME: &str = "component-replicator-signed";

/// Username/password pair for a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Authenticated access material for one reconciliation pass.
///
/// Opaque to the driver: it is created once per pass and handed back to every
/// subsequent client call.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub source: Option<BasicCredentials>,
    pub destination: Option<BasicCredentials>,
    /// Public key material for signature verification, keyed by credentials
    /// entry name.
    pub verification_keys: HashMap<String, Vec<u8>>,
    /// Key material used to sign the destination component.
    pub signing_key: Option<Vec<u8>>,
}

/// A signature recorded on a component descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorSignature {
    pub name: String,
    /// Hex-encoded sha256 digest of the descriptor payload.
    pub digest: String,
}

/// The descriptor of one component version.
///
/// An owned handle: release happens on drop. `payload` carries the raw
/// descriptor document bytes (the digest basis for signatures) and `manifest`
/// the registry manifest the descriptor was resolved from.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDescriptor {
    pub name: String,
    pub version: String,
    pub signatures: Vec<DescriptorSignature>,
    pub manifest: serde_json::Value,
    pub payload: Vec<u8>,
    /// Where the descriptor was fetched from; transfer reads blobs from here.
    pub source: RepositoryLocation,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials entry '{0}' not found")]
    CredentialsNotFound(String),

    /// Reported by backends that can detect a denied login at
    /// context-creation time.
    #[error("permission denied for repository '{repository}': {reason}")]
    PermissionDenied { repository: String, reason: String },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("component not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("component version '{component}:{version}' not found")]
    NotFound { component: String, version: String },

    #[error("corrupt descriptor for '{component}:{version}': {message}")]
    Corrupt {
        component: String,
        version: String,
        message: String,
    },

    #[error("registry unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("public key '{0}' not found")]
    KeyNotFound(String),

    #[error("signature '{name}' digest did not match the descriptor payload")]
    DigestMismatch { name: String },

    #[error("signature '{name}' not found on the component descriptor")]
    SignatureNameAbsent { name: String },
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("signing failed: {0}")]
    Failure(String),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("partial transfer of '{component}:{version}': {message}")]
    Partial {
        component: String,
        version: String,
        message: String,
    },

    #[error("destination registry unreachable: {0}")]
    DestinationUnreachable(String),

    #[error("destination already has version '{version}' with different content")]
    OverwriteConflict { version: String },
}

/// Capabilities the reconcile driver needs from a component registry backend.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait ComponentClient: Send + Sync {
    /// Resolve credentials for the subscription's source and destination and
    /// bundle them into an access context for the rest of the pass.
    async fn create_authenticated_context(
        &self,
        subscription: &Subscription,
    ) -> Result<AccessContext, AuthError>;

    /// List all raw version strings published for a component.
    async fn list_versions(
        &self,
        ctx: &AccessContext,
        repository: &RepositoryLocation,
        component: &str,
    ) -> Result<Vec<String>, RegistryError>;

    /// Fetch the full descriptor of one component version.
    async fn get_component_descriptor(
        &self,
        ctx: &AccessContext,
        repository: &RepositoryLocation,
        component: &str,
        version: &str,
    ) -> Result<ComponentDescriptor, DescriptorError>;

    /// Check every signature policy against the descriptor.
    async fn verify_signatures(
        &self,
        ctx: &AccessContext,
        descriptor: &ComponentDescriptor,
        policies: &[SignaturePolicy],
    ) -> Result<(), VerifyError>;

    /// Record the controller's own signature on the descriptor before it is
    /// transferred. Returns the raw public key bytes of the signing key.
    async fn sign_destination_component(
        &self,
        ctx: &AccessContext,
        descriptor: &mut ComponentDescriptor,
    ) -> Result<Vec<u8>, SignError>;

    /// Copy the component version and its blobs to the destination.
    async fn transfer_component(
        &self,
        ctx: &AccessContext,
        descriptor: &ComponentDescriptor,
        destination: &RepositoryLocation,
    ) -> Result<(), TransferError>;
}
