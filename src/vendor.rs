//! Credential vendor: issues, validates, and revokes short-lived bearer
//! credentials.
//!
//! Bearers are compact JWS (HS256) carrying `{sub, aud, scopes, jti, iat,
//! exp, nce}` with the signing key id in the header. The `nce` claim is a
//! random 256-bit nonce, so the serialized bearer is unguessable; its
//! keyed HMAC-SHA256 fingerprint is the only thing persisted. Validation
//! recomputes the fingerprint from the presented bearer and compares
//! constant-time; rejection paths share one terse external surface so
//! they cannot be told apart by callers.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditError, AuditLogger, NewLogEntry};
use crate::clock::Clock;
use crate::secrets::{SecretStore, SecretsError};
use crate::store::{Store, StoreError};
use crate::types::{
    AccessEvent, AccessLogEntry, Credential, DecisionOutcome, ReasonCode, RequestContext,
};

/// Vendor failures.
#[derive(Debug, Error)]
pub enum VendorError {
    /// Signing-key backend unavailable; the decision fails closed.
    #[error("keystore unavailable: {0}")]
    Keystore(String),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Audit failure; the decision fails closed.
    #[error(transparent)]
    Audit(#[from] AuditError),
    /// Token construction failed.
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl From<SecretsError> for VendorError {
    fn from(e: SecretsError) -> Self {
        VendorError::Keystore(e.to_string())
    }
}

/// Registered claims of a bearer credential.
#[derive(Debug, Serialize, Deserialize)]
struct BearerClaims {
    sub: Uuid,
    aud: Uuid,
    scopes: Vec<String>,
    jti: Uuid,
    iat: i64,
    exp: i64,
    /// Random 256-bit nonce; makes the serialized bearer unguessable.
    nce: String,
}

/// Inputs to [`CredentialVendor::issue`].
#[derive(Debug, Clone)]
pub struct IssueParams {
    /// Agent the credential is issued to.
    pub agent_id: Uuid,
    /// Tool the credential is bound to.
    pub tool_id: Uuid,
    /// Scopes to grant; already intersected by the policy engine.
    pub scopes: BTreeSet<String>,
    /// Scopes originally requested, recorded in the issuance log.
    pub requested_scopes: BTreeSet<String>,
    /// Credential lifetime in seconds; already bounded by the engine.
    pub lifetime_secs: u64,
    /// Policy whose match produced this credential.
    pub source_policy_id: Uuid,
    /// Access request this credential resolves, if any.
    pub source_request_id: Option<Uuid>,
}

/// A freshly minted credential. The bearer is returned exactly once; the
/// vendor never reproduces it afterwards.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    /// Credential id, equal to the bearer's `jti`.
    pub credential_id: Uuid,
    /// The plaintext bearer.
    pub token: String,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
    /// Scopes the bearer carries.
    pub granted_scopes: BTreeSet<String>,
}

/// Result of validating a presented bearer.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// Whether the bearer is currently valid.
    pub valid: bool,
    /// Credential id, when a row was identified.
    pub credential_id: Option<Uuid>,
    /// Agent the credential belongs to.
    pub agent_id: Option<Uuid>,
    /// Tool the credential is bound to.
    pub tool_id: Option<Uuid>,
    /// Granted scopes.
    pub scopes: BTreeSet<String>,
    /// Expiry instant.
    pub expires_at: Option<DateTime<Utc>>,
    /// Why validation succeeded or failed. Internal only; the HTTP layer
    /// collapses failures to one terse response.
    pub reason_code: ReasonCode,
}

impl ValidationOutcome {
    fn invalid(reason_code: ReasonCode) -> Self {
        Self {
            valid: false,
            credential_id: None,
            agent_id: None,
            tool_id: None,
            scopes: BTreeSet::new(),
            expires_at: None,
            reason_code,
        }
    }
}

/// Issues, validates, and revokes signed short-lived credentials.
pub struct CredentialVendor {
    store: Arc<Store>,
    secrets: Arc<dyn SecretStore>,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
}

impl CredentialVendor {
    /// Create a vendor over the given collaborators.
    pub fn new(
        store: Arc<Store>,
        secrets: Arc<dyn SecretStore>,
        audit: Arc<AuditLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            secrets,
            audit,
            clock,
        }
    }

    /// Mint a credential and co-commit its row with the issuance log entry
    /// (plus any `extra_logs` the caller wants in the same transaction,
    /// appended before the issuance entry).
    pub async fn issue(
        &self,
        ctx: &RequestContext,
        params: IssueParams,
        extra_logs: Vec<AccessLogEntry>,
    ) -> Result<IssuedCredential, VendorError> {
        let (kid, key) = self.secrets.active_signing_key().await?;

        let credential_id = Uuid::new_v4();
        let issued_at = self.clock.now();
        let lifetime = i64::try_from(params.lifetime_secs.max(1)).unwrap_or(i64::MAX);
        let expires_at = issued_at + Duration::seconds(lifetime);

        let mut nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let claims = BearerClaims {
            sub: params.agent_id,
            aud: params.tool_id,
            scopes: params.scopes.iter().cloned().collect(),
            jti: credential_id,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            nce: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(nonce),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid);

        let token = jsonwebtoken::encode(
            &header,
            &claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .map_err(|e| VendorError::Signing(e.to_string()))?;

        let credential = Credential {
            credential_id,
            agent_id: params.agent_id,
            tool_id: params.tool_id,
            granted_scopes: params.scopes.clone(),
            token_fingerprint: fingerprint(key.as_bytes(), &token),
            issued_at,
            expires_at,
            revoked_at: None,
            source_policy_id: params.source_policy_id,
            source_request_id: params.source_request_id,
        };

        let mut issued_entry = NewLogEntry::for_event(
            AccessEvent::CredentialIssued,
            ReasonCode::PolicyMatched,
        );
        issued_entry.agent_id = Some(params.agent_id);
        issued_entry.tool_id = Some(params.tool_id);
        issued_entry.policy_id = Some(params.source_policy_id);
        issued_entry.credential_id = Some(credential_id);
        issued_entry.decision = Some(DecisionOutcome::Allow);
        issued_entry.requested_scopes = params.requested_scopes;
        issued_entry.granted_scopes = params.scopes.clone();
        let issued_entry = self.audit.prepare(ctx, issued_entry)?;

        let mut logs = extra_logs;
        logs.push(issued_entry);
        self.store.issue_credential_txn(&credential, &logs).await?;

        tracing::info!(
            credential_id = %credential_id,
            agent_id = %params.agent_id,
            tool_id = %params.tool_id,
            "credential issued"
        );

        Ok(IssuedCredential {
            credential_id,
            token,
            expires_at,
            granted_scopes: params.scopes,
        })
    }

    /// Validate a presented bearer, optionally requiring one scope.
    ///
    /// Every identified credential gets a `CREDENTIAL_VALIDATED` log entry
    /// carrying the outcome; unidentifiable bearers (bad signature, no
    /// matching row) are only traced, since there is no credential to
    /// attribute them to.
    pub async fn validate(
        &self,
        ctx: &RequestContext,
        token: &str,
        required_scope: Option<&str>,
    ) -> ValidationOutcome {
        let credential = match self.lookup(token).await {
            Ok(credential) => credential,
            Err(reason) => {
                tracing::debug!(reason = reason.as_str(), "bearer rejected before lookup");
                return ValidationOutcome::invalid(reason);
            }
        };

        let now = self.clock.now();
        let reason = if credential.revoked_at.is_some() {
            ReasonCode::Revoked
        } else if now >= credential.expires_at {
            ReasonCode::Expired
        } else if now < credential.issued_at {
            ReasonCode::InvalidSignature
        } else {
            match required_scope {
                Some(scope) if !credential.granted_scopes.contains(scope) => {
                    ReasonCode::InsufficientScope
                }
                _ => ReasonCode::CredentialValid,
            }
        };
        let valid = reason == ReasonCode::CredentialValid;

        let mut entry = NewLogEntry::for_event(AccessEvent::CredentialValidated, reason);
        entry.agent_id = Some(credential.agent_id);
        entry.tool_id = Some(credential.tool_id);
        entry.policy_id = Some(credential.source_policy_id);
        entry.credential_id = Some(credential.credential_id);
        entry.decision = Some(if valid {
            DecisionOutcome::Allow
        } else {
            DecisionOutcome::Deny
        });
        entry.granted_scopes = credential.granted_scopes.clone();
        if let Err(e) = self.audit.log_event(ctx, entry).await {
            // Fail closed: a validation that cannot be audited is invalid.
            tracing::error!(error = %e, "audit append failed during validation");
            return ValidationOutcome::invalid(ReasonCode::StoreUnavailable);
        }

        ValidationOutcome {
            valid,
            credential_id: Some(credential.credential_id),
            agent_id: Some(credential.agent_id),
            tool_id: Some(credential.tool_id),
            scopes: credential.granted_scopes,
            expires_at: Some(credential.expires_at),
            reason_code: reason,
        }
    }

    /// Verify the bearer's signature and find its credential row.
    async fn lookup(&self, token: &str) -> Result<Credential, ReasonCode> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|_| ReasonCode::InvalidSignature)?;
        if header.alg != Algorithm::HS256 {
            return Err(ReasonCode::InvalidSignature);
        }
        let kid = header.kid.ok_or(ReasonCode::InvalidSignature)?;

        let key = match self.secrets.signing_key(&kid).await {
            Ok(key) => key,
            Err(SecretsError::UnknownKey(_)) => return Err(ReasonCode::InvalidSignature),
            Err(SecretsError::Unavailable(_)) => return Err(ReasonCode::KeystoreUnavailable),
        };

        // Expiry and audience are enforced against the stored row below,
        // under the injected clock; signature and shape are enforced here.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = Default::default();
        jsonwebtoken::decode::<BearerClaims>(
            token,
            &DecodingKey::from_secret(key.as_bytes()),
            &validation,
        )
        .map_err(|_| ReasonCode::InvalidSignature)?;

        let computed = fingerprint(key.as_bytes(), token);
        let credential = self
            .store
            .get_credential_by_fingerprint(&computed)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => ReasonCode::UnknownCredential,
                StoreError::Unavailable(_) => ReasonCode::StoreUnavailable,
                _ => ReasonCode::Internal,
            })?;

        // The row was found by fingerprint; compare again in constant time
        // so equality itself is not a timing oracle.
        let matches: bool = computed
            .as_bytes()
            .ct_eq(credential.token_fingerprint.as_bytes())
            .into();
        if !matches {
            return Err(ReasonCode::UnknownCredential);
        }
        Ok(credential)
    }

    /// Revoke a credential. Idempotent: the first call sets `revoked_at`
    /// and logs `CREDENTIAL_REVOKED`; later calls succeed without logging
    /// again.
    pub async fn revoke(
        &self,
        ctx: &RequestContext,
        credential_id: Uuid,
    ) -> Result<bool, VendorError> {
        let now = self.clock.now();
        let transitioned = self.store.revoke_credential(credential_id, now).await?;

        if transitioned {
            let credential = self.store.get_credential(credential_id).await?;
            let mut entry =
                NewLogEntry::for_event(AccessEvent::CredentialRevoked, ReasonCode::Revoked);
            entry.agent_id = Some(credential.agent_id);
            entry.tool_id = Some(credential.tool_id);
            entry.policy_id = Some(credential.source_policy_id);
            entry.credential_id = Some(credential_id);
            entry.decision = Some(DecisionOutcome::Deny);
            self.audit.log_event(ctx, entry).await?;
            tracing::info!(credential_id = %credential_id, "credential revoked");
        }
        Ok(transitioned)
    }

    /// Delete credential rows expired longer than `retention_secs` ago.
    /// Access logs are retained independently of this sweep.
    pub async fn cleanup(&self, retention_secs: u64) -> Result<u64, VendorError> {
        let retention = i64::try_from(retention_secs).unwrap_or(i64::MAX);
        let cutoff = self.clock.now() - Duration::seconds(retention);
        let removed = self.store.cleanup_expired_credentials(cutoff).await?;
        if removed > 0 {
            tracing::debug!(removed, "expired credentials swept");
        }
        Ok(removed)
    }
}

/// Keyed fingerprint over the compact bearer serialization.
fn fingerprint(key: &[u8], token: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(token.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}
