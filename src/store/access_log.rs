//! Append-only access log.
//!
//! There are no UPDATE or DELETE statements for `access_logs` anywhere in
//! the crate; the only mutation is the append below. Queries paginate by
//! rowid keyset so the cursor order matches insertion order.

use sqlx::Row;
use uuid::Uuid;

use crate::types::{AccessEvent, AccessLogEntry, DecisionOutcome, ReasonCode};

use super::{
    fmt_ts, map_sqlx, parse_ts, parse_uuid, parse_uuid_opt, scopes_from_json, scopes_to_json,
    Store, StoreError,
};

use chrono::{DateTime, Utc};

/// Filters for access-log queries. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Only entries for this agent.
    pub agent_id: Option<Uuid>,
    /// Only entries for this tool.
    pub tool_id: Option<Uuid>,
    /// Only entries of this event kind.
    pub event: Option<AccessEvent>,
    /// Only entries with this decision.
    pub decision: Option<DecisionOutcome>,
    /// Only entries at or after this instant.
    pub start: Option<DateTime<Utc>>,
    /// Only entries before this instant.
    pub end: Option<DateTime<Utc>>,
    /// Opaque cursor from a previous page.
    pub cursor: Option<String>,
    /// Page size; clamped to 1..=500, default 100.
    pub limit: Option<u32>,
}

/// One page of access-log entries plus the cursor for the next page.
#[derive(Debug, Clone)]
pub struct LogPage {
    /// Entries in insertion order.
    pub items: Vec<AccessLogEntry>,
    /// Pass back as [`LogFilter::cursor`] to continue; `None` at the end.
    pub next_cursor: Option<String>,
}

impl Store {
    /// Append one entry. Strictly insert-only.
    pub async fn append_access_log(&self, entry: &AccessLogEntry) -> Result<(), StoreError> {
        let mut conn = self.pool().acquire().await.map_err(map_sqlx)?;
        insert_log(&mut *conn, entry).await
    }

    /// Query the log with filters and keyset pagination.
    pub async fn list_access_logs(&self, filter: &LogFilter) -> Result<LogPage, StoreError> {
        let limit = i64::from(filter.limit.unwrap_or(100).clamp(1, 500));
        let cursor: i64 = match &filter.cursor {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Database(format!("bad cursor '{raw}'")))?,
            None => 0,
        };

        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT rowid, log_id, timestamp, request_id, agent_id, tool_id, policy_id, \
             credential_id, event, decision, reason_code, request_ip, user_agent, \
             requested_scopes, granted_scopes FROM access_logs WHERE rowid > ",
        );
        builder.push_bind(cursor);

        if let Some(agent_id) = filter.agent_id {
            builder.push(" AND agent_id = ");
            builder.push_bind(agent_id.to_string());
        }
        if let Some(tool_id) = filter.tool_id {
            builder.push(" AND tool_id = ");
            builder.push_bind(tool_id.to_string());
        }
        if let Some(event) = filter.event {
            builder.push(" AND event = ");
            builder.push_bind(event.as_str());
        }
        if let Some(decision) = filter.decision {
            builder.push(" AND decision = ");
            builder.push_bind(decision.as_str());
        }
        if let Some(start) = filter.start {
            builder.push(" AND timestamp >= ");
            builder.push_bind(fmt_ts(start));
        }
        if let Some(end) = filter.end {
            builder.push(" AND timestamp < ");
            builder.push_bind(fmt_ts(end));
        }

        builder.push(" ORDER BY rowid ASC LIMIT ");
        builder.push_bind(limit);

        let rows = builder
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx)?;

        let mut items = Vec::with_capacity(rows.len());
        let mut last_rowid = cursor;
        for row in &rows {
            last_rowid = row.try_get("rowid").map_err(map_sqlx)?;
            items.push(row_to_entry(row)?);
        }

        let next_cursor = if items.len() as i64 == limit {
            Some(last_rowid.to_string())
        } else {
            None
        };
        Ok(LogPage { items, next_cursor })
    }
}

/// Insert one log row through any executor, so the append can join a
/// caller's transaction.
pub(crate) async fn insert_log<'c, E>(executor: E, entry: &AccessLogEntry) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO access_logs (log_id, timestamp, request_id, agent_id, tool_id, policy_id, \
         credential_id, event, decision, reason_code, request_ip, user_agent, requested_scopes, \
         granted_scopes) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )
    .bind(entry.log_id.to_string())
    .bind(fmt_ts(entry.timestamp))
    .bind(entry.request_id.map(|id| id.to_string()))
    .bind(entry.agent_id.map(|id| id.to_string()))
    .bind(entry.tool_id.map(|id| id.to_string()))
    .bind(entry.policy_id.map(|id| id.to_string()))
    .bind(entry.credential_id.map(|id| id.to_string()))
    .bind(entry.event.as_str())
    .bind(entry.decision.map(DecisionOutcome::as_str))
    .bind(entry.reason_code.as_str())
    .bind(&entry.request_ip)
    .bind(&entry.user_agent)
    .bind(scopes_to_json(&entry.requested_scopes))
    .bind(scopes_to_json(&entry.granted_scopes))
    .execute(executor)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

fn parse_event(raw: &str) -> Result<AccessEvent, StoreError> {
    match raw {
        "REQUEST_EVALUATED" => Ok(AccessEvent::RequestEvaluated),
        "CREDENTIAL_ISSUED" => Ok(AccessEvent::CredentialIssued),
        "CREDENTIAL_VALIDATED" => Ok(AccessEvent::CredentialValidated),
        "CREDENTIAL_REVOKED" => Ok(AccessEvent::CredentialRevoked),
        "RATE_LIMITED" => Ok(AccessEvent::RateLimited),
        other => Err(StoreError::Database(format!("unknown event: {other}"))),
    }
}

fn parse_decision(raw: Option<String>) -> Result<Option<DecisionOutcome>, StoreError> {
    match raw.as_deref() {
        None => Ok(None),
        Some("ALLOW") => Ok(Some(DecisionOutcome::Allow)),
        Some("DENY") => Ok(Some(DecisionOutcome::Deny)),
        Some("PENDING_APPROVAL") => Ok(Some(DecisionOutcome::PendingApproval)),
        Some(other) => Err(StoreError::Database(format!("unknown decision: {other}"))),
    }
}

fn parse_reason(raw: &str) -> Result<ReasonCode, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_owned()))
        .map_err(|_| StoreError::Database(format!("unknown reason code: {raw}")))
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<AccessLogEntry, StoreError> {
    let log_id: String = row.try_get("log_id").map_err(map_sqlx)?;
    let timestamp: String = row.try_get("timestamp").map_err(map_sqlx)?;
    let request_id: Option<String> = row.try_get("request_id").map_err(map_sqlx)?;
    let agent_id: Option<String> = row.try_get("agent_id").map_err(map_sqlx)?;
    let tool_id: Option<String> = row.try_get("tool_id").map_err(map_sqlx)?;
    let policy_id: Option<String> = row.try_get("policy_id").map_err(map_sqlx)?;
    let credential_id: Option<String> = row.try_get("credential_id").map_err(map_sqlx)?;
    let event: String = row.try_get("event").map_err(map_sqlx)?;
    let decision: Option<String> = row.try_get("decision").map_err(map_sqlx)?;
    let reason_code: String = row.try_get("reason_code").map_err(map_sqlx)?;
    let requested_scopes: String = row.try_get("requested_scopes").map_err(map_sqlx)?;
    let granted_scopes: String = row.try_get("granted_scopes").map_err(map_sqlx)?;

    Ok(AccessLogEntry {
        log_id: parse_uuid(&log_id)?,
        timestamp: parse_ts(&timestamp)?,
        request_id: parse_uuid_opt(request_id)?,
        agent_id: parse_uuid_opt(agent_id)?,
        tool_id: parse_uuid_opt(tool_id)?,
        policy_id: parse_uuid_opt(policy_id)?,
        credential_id: parse_uuid_opt(credential_id)?,
        event: parse_event(&event)?,
        decision: parse_decision(decision)?,
        reason_code: parse_reason(&reason_code)?,
        request_ip: row.try_get("request_ip").map_err(map_sqlx)?,
        user_agent: row.try_get("user_agent").map_err(map_sqlx)?,
        requested_scopes: scopes_from_json(&requested_scopes)?,
        granted_scopes: scopes_from_json(&granted_scopes)?,
    })
}
