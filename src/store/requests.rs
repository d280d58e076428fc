//! Access-request persistence.
//!
//! A `PENDING` request left unresolved for seven days reads back as
//! `EXPIRED`; a sweeper marks the rows so queries and reads agree.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::types::{AccessLogEntry, AccessRequest, RequestStatus, PENDING_REQUEST_TTL_DAYS};

use super::{
    access_log::insert_log, fmt_ts, map_sqlx, parse_ts, parse_ts_opt, parse_uuid, parse_uuid_opt,
    scopes_from_json, scopes_to_json, Store, StoreError,
};

impl Store {
    /// Insert a new access request.
    pub async fn insert_access_request(&self, request: &AccessRequest) -> Result<(), StoreError> {
        let mut conn = self.pool().acquire().await.map_err(map_sqlx)?;
        insert_request_row(&mut *conn, request).await
    }

    /// Insert an access request and append its evaluation log entry in one
    /// transaction: either both commit or neither does. A parked request
    /// must never outlive a failed audit append.
    pub async fn park_request_txn(
        &self,
        request: &AccessRequest,
        log: &AccessLogEntry,
    ) -> Result<(), StoreError> {
        let mut txn = self.pool().begin().await.map_err(map_sqlx)?;

        insert_request_row(&mut *txn, request).await?;
        insert_log(&mut *txn, log).await?;

        txn.commit().await.map_err(map_sqlx)
    }

    /// Fetch a request by id. A pending row past its deadline is reported
    /// as `EXPIRED` even if the sweeper has not caught up.
    pub async fn get_access_request(
        &self,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AccessRequest, StoreError> {
        let row = sqlx::query(
            "SELECT request_id, agent_id, tool_id, requested_scopes, justification, status, \
             matched_policy_id, created_at, resolved_at, resolver_id \
             FROM access_requests WHERE request_id = ?1",
        )
        .bind(request_id.to_string())
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx)?;

        let mut request = row_to_request(&row)?;
        if request.status == RequestStatus::Pending && is_past_deadline(&request, now) {
            request.status = RequestStatus::Expired;
        }
        Ok(request)
    }

    /// Atomically transition a `PENDING` request to `APPROVED` or
    /// `REJECTED`. Loses with [`StoreError::ConflictingUpdate`] when the
    /// request was already resolved.
    pub async fn resolve_access_request(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        resolver_id: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> Result<AccessRequest, StoreError> {
        let result = sqlx::query(
            "UPDATE access_requests SET status = ?1, resolver_id = ?2, resolved_at = ?3 \
             WHERE request_id = ?4 AND status = 'PENDING'",
        )
        .bind(status.as_str())
        .bind(resolver_id.to_string())
        .bind(fmt_ts(resolved_at))
        .bind(request_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return match self.get_access_request(request_id, resolved_at).await {
                Ok(_) => Err(StoreError::ConflictingUpdate),
                Err(e) => Err(e),
            };
        }
        self.get_access_request(request_id, resolved_at).await
    }

    /// Mark pending requests older than the deadline as `EXPIRED`. Returns
    /// the number of rows swept.
    pub async fn expire_stale_requests(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now - Duration::days(PENDING_REQUEST_TTL_DAYS);
        let result = sqlx::query(
            "UPDATE access_requests SET status = 'EXPIRED' \
             WHERE status = 'PENDING' AND created_at < ?1",
        )
        .bind(fmt_ts(cutoff))
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }
}

async fn insert_request_row<'c, E>(executor: E, request: &AccessRequest) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO access_requests (request_id, agent_id, tool_id, requested_scopes, \
         justification, status, matched_policy_id, created_at, resolved_at, resolver_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(request.request_id.to_string())
    .bind(request.agent_id.to_string())
    .bind(request.tool_id.to_string())
    .bind(scopes_to_json(&request.requested_scopes))
    .bind(&request.justification)
    .bind(request.status.as_str())
    .bind(request.matched_policy_id.map(|id| id.to_string()))
    .bind(fmt_ts(request.created_at))
    .bind(request.resolved_at.map(fmt_ts))
    .bind(request.resolver_id.map(|id| id.to_string()))
    .execute(executor)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

fn is_past_deadline(request: &AccessRequest, now: DateTime<Utc>) -> bool {
    now - request.created_at > Duration::days(PENDING_REQUEST_TTL_DAYS)
}

fn parse_status(raw: &str) -> Result<RequestStatus, StoreError> {
    match raw {
        "PENDING" => Ok(RequestStatus::Pending),
        "APPROVED" => Ok(RequestStatus::Approved),
        "REJECTED" => Ok(RequestStatus::Rejected),
        "EXPIRED" => Ok(RequestStatus::Expired),
        other => Err(StoreError::Database(format!("unknown request status: {other}"))),
    }
}

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> Result<AccessRequest, StoreError> {
    let request_id: String = row.try_get("request_id").map_err(map_sqlx)?;
    let agent_id: String = row.try_get("agent_id").map_err(map_sqlx)?;
    let tool_id: String = row.try_get("tool_id").map_err(map_sqlx)?;
    let requested_scopes: String = row.try_get("requested_scopes").map_err(map_sqlx)?;
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    let matched_policy_id: Option<String> = row.try_get("matched_policy_id").map_err(map_sqlx)?;
    let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;
    let resolved_at: Option<String> = row.try_get("resolved_at").map_err(map_sqlx)?;
    let resolver_id: Option<String> = row.try_get("resolver_id").map_err(map_sqlx)?;

    Ok(AccessRequest {
        request_id: parse_uuid(&request_id)?,
        agent_id: parse_uuid(&agent_id)?,
        tool_id: parse_uuid(&tool_id)?,
        requested_scopes: scopes_from_json(&requested_scopes)?,
        justification: row.try_get("justification").map_err(map_sqlx)?,
        status: parse_status(&status)?,
        matched_policy_id: parse_uuid_opt(matched_policy_id)?,
        created_at: parse_ts(&created_at)?,
        resolved_at: parse_ts_opt(resolved_at)?,
        resolver_id: parse_uuid_opt(resolver_id)?,
    })
}
