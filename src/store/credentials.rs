//! Credential persistence.
//!
//! Only fingerprints are stored, never bearer material. Credential
//! insertion is co-committed with its log entries so `CREDENTIAL_ISSUED`
//! is observable before any `CREDENTIAL_VALIDATED` for the same
//! credential.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::types::{AccessLogEntry, Credential};

use super::{
    access_log::insert_log, fmt_ts, map_sqlx, parse_ts, parse_ts_opt, parse_uuid, parse_uuid_opt,
    scopes_from_json, scopes_to_json, Store, StoreError,
};

impl Store {
    /// Insert a credential row on its own, outside any transaction.
    pub async fn insert_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut conn = self.pool().acquire().await.map_err(map_sqlx)?;
        insert_credential_row(&mut *conn, credential).await
    }

    /// Insert a credential and append its log entries in one transaction:
    /// either all commit or none do.
    pub async fn issue_credential_txn(
        &self,
        credential: &Credential,
        logs: &[AccessLogEntry],
    ) -> Result<(), StoreError> {
        let mut txn = self.pool().begin().await.map_err(map_sqlx)?;

        insert_credential_row(&mut *txn, credential).await?;
        for entry in logs {
            insert_log(&mut *txn, entry).await?;
        }

        txn.commit().await.map_err(map_sqlx)
    }

    /// Fetch a credential by id.
    pub async fn get_credential(&self, credential_id: Uuid) -> Result<Credential, StoreError> {
        let row = sqlx::query(
            "SELECT credential_id, agent_id, tool_id, granted_scopes, fingerprint, issued_at, \
             expires_at, revoked_at, source_policy_id, source_request_id \
             FROM credentials WHERE credential_id = ?1",
        )
        .bind(credential_id.to_string())
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx)?;
        row_to_credential(&row)
    }

    /// Fetch a credential by token fingerprint.
    pub async fn get_credential_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Credential, StoreError> {
        let row = sqlx::query(
            "SELECT credential_id, agent_id, tool_id, granted_scopes, fingerprint, issued_at, \
             expires_at, revoked_at, source_policy_id, source_request_id \
             FROM credentials WHERE fingerprint = ?1",
        )
        .bind(fingerprint)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx)?;
        row_to_credential(&row)
    }

    /// Set `revoked_at` if it is not already set. Returns `true` when this
    /// call performed the transition, `false` when the credential was
    /// already revoked (idempotent).
    pub async fn revoke_credential(
        &self,
        credential_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE credentials SET revoked_at = ?1 \
             WHERE credential_id = ?2 AND revoked_at IS NULL",
        )
        .bind(fmt_ts(at))
        .bind(credential_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // No transition: either already revoked or missing.
        self.get_credential(credential_id).await.map(|_| false)
    }

    /// Remove credential rows that expired before `cutoff`. Access logs are
    /// retained independently. Returns the number of deleted rows.
    pub async fn cleanup_expired_credentials(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM credentials WHERE expires_at < ?1")
            .bind(fmt_ts(cutoff))
            .execute(self.pool())
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }
}

async fn insert_credential_row<'c, E>(executor: E, credential: &Credential) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO credentials (credential_id, agent_id, tool_id, granted_scopes, fingerprint, \
         issued_at, expires_at, revoked_at, source_policy_id, source_request_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(credential.credential_id.to_string())
    .bind(credential.agent_id.to_string())
    .bind(credential.tool_id.to_string())
    .bind(scopes_to_json(&credential.granted_scopes))
    .bind(&credential.token_fingerprint)
    .bind(fmt_ts(credential.issued_at))
    .bind(fmt_ts(credential.expires_at))
    .bind(credential.revoked_at.map(fmt_ts))
    .bind(credential.source_policy_id.to_string())
    .bind(credential.source_request_id.map(|id| id.to_string()))
    .execute(executor)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

fn row_to_credential(row: &sqlx::sqlite::SqliteRow) -> Result<Credential, StoreError> {
    let credential_id: String = row.try_get("credential_id").map_err(map_sqlx)?;
    let agent_id: String = row.try_get("agent_id").map_err(map_sqlx)?;
    let tool_id: String = row.try_get("tool_id").map_err(map_sqlx)?;
    let granted_scopes: String = row.try_get("granted_scopes").map_err(map_sqlx)?;
    let issued_at: String = row.try_get("issued_at").map_err(map_sqlx)?;
    let expires_at: String = row.try_get("expires_at").map_err(map_sqlx)?;
    let revoked_at: Option<String> = row.try_get("revoked_at").map_err(map_sqlx)?;
    let source_policy_id: String = row.try_get("source_policy_id").map_err(map_sqlx)?;
    let source_request_id: Option<String> = row.try_get("source_request_id").map_err(map_sqlx)?;

    Ok(Credential {
        credential_id: parse_uuid(&credential_id)?,
        agent_id: parse_uuid(&agent_id)?,
        tool_id: parse_uuid(&tool_id)?,
        granted_scopes: scopes_from_json(&granted_scopes)?,
        token_fingerprint: row.try_get("fingerprint").map_err(map_sqlx)?,
        issued_at: parse_ts(&issued_at)?,
        expires_at: parse_ts(&expires_at)?,
        revoked_at: parse_ts_opt(revoked_at)?,
        source_policy_id: parse_uuid(&source_policy_id)?,
        source_request_id: parse_uuid_opt(source_request_id)?,
    })
}
