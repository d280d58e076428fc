//! Signing-key storage behind a trait seam.
//!
//! Only the credential vendor touches signing keys. Keys rotate without
//! downtime: the active key signs new bearers, retired keys stay resolvable
//! so bearers issued under them keep validating until they expire.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Secret-store errors.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// No key is registered under the requested id.
    #[error("unknown key id: {0}")]
    UnknownKey(String),
    /// Backend unreachable; callers fail closed.
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

/// Opaque secret whose `Debug` output never shows the material.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap secret material.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the material. Only the signing/fingerprint paths call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Expose the material as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Provider of signing keys for bearer credentials.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// The key new credentials are signed with, as `(kid, key)`.
    async fn active_signing_key(&self) -> Result<(String, SecretValue), SecretsError>;

    /// Resolve a key by id. Retired keys must stay resolvable for at least
    /// the maximum credential lifetime after rotation.
    async fn signing_key(&self, kid: &str) -> Result<SecretValue, SecretsError>;

    /// Promote a fresh key to active; returns the new key id. Old keys
    /// remain resolvable.
    async fn rotate(&self) -> Result<String, SecretsError>;
}

struct KeyRing {
    active_kid: String,
    keys: HashMap<String, SecretValue>,
}

/// In-process secret store bootstrapped from a single configured secret.
pub struct InMemorySecretStore {
    ring: RwLock<KeyRing>,
}

impl InMemorySecretStore {
    /// Create a store whose initial active key is `secret`.
    pub fn new(secret: SecretValue) -> Self {
        let kid = fresh_kid();
        let mut keys = HashMap::new();
        keys.insert(kid.clone(), secret);
        Self {
            ring: RwLock::new(KeyRing {
                active_kid: kid,
                keys,
            }),
        }
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn active_signing_key(&self) -> Result<(String, SecretValue), SecretsError> {
        let ring = self.ring.read().await;
        let key = ring
            .keys
            .get(&ring.active_kid)
            .cloned()
            .ok_or_else(|| SecretsError::UnknownKey(ring.active_kid.clone()))?;
        Ok((ring.active_kid.clone(), key))
    }

    async fn signing_key(&self, kid: &str) -> Result<SecretValue, SecretsError> {
        let ring = self.ring.read().await;
        ring.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| SecretsError::UnknownKey(kid.to_owned()))
    }

    async fn rotate(&self) -> Result<String, SecretsError> {
        let mut material = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut material);
        let secret = SecretValue::new(base64::engine::general_purpose::STANDARD.encode(material));

        let kid = fresh_kid();
        let mut ring = self.ring.write().await;
        ring.keys.insert(kid.clone(), secret);
        ring.active_kid = kid.clone();
        tracing::info!(kid = %kid, "signing key rotated");
        Ok(kid)
    }
}

/// Short random key id.
fn fresh_kid() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("k{}", &id[..12])
}
