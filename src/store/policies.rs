//! Policy persistence.
//!
//! `conditions` and `rules` are stored as JSON and decoded into the closed
//! structs from [`crate::types`]. Keys outside the recognized set are
//! dropped, with one warning per policy load, so forward-compatible
//! policies written by newer builds stay readable.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::types::{Policy, PolicyConditions, PolicyRules};

use super::{
    fmt_ts, map_sqlx, parse_ts, parse_uuid, parse_uuid_opt, scopes_from_json, scopes_to_json,
    Store, StoreError,
};

const KNOWN_CONDITION_KEYS: &[&str] = &[
    "max_requests_per_day",
    "allowed_hours",
    "allowed_days",
    "required_roles",
    "any_roles",
    "ip_cidrs",
];

const KNOWN_RULE_KEYS: &[&str] = &[
    "require_approval",
    "log_usage",
    "max_credential_lifetime_seconds",
    "rate_limit_key",
];

impl Store {
    /// Insert a new policy.
    pub async fn create_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        let conditions = serde_json::to_string(&policy.conditions)
            .map_err(|e| StoreError::Database(format!("encode conditions: {e}")))?;
        let rules = serde_json::to_string(&policy.rules)
            .map_err(|e| StoreError::Database(format!("encode rules: {e}")))?;

        sqlx::query(
            "INSERT INTO policies (policy_id, name, tool_id, created_by, allowed_scopes, \
             conditions, rules, priority, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(policy.policy_id.to_string())
        .bind(&policy.name)
        .bind(policy.tool_id.map(|id| id.to_string()))
        .bind(policy.created_by.to_string())
        .bind(scopes_to_json(&policy.allowed_scopes))
        .bind(conditions)
        .bind(rules)
        .bind(policy.priority)
        .bind(policy.is_active)
        .bind(fmt_ts(policy.created_at))
        .bind(fmt_ts(policy.updated_at))
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// Fetch a policy by id.
    pub async fn get_policy(&self, policy_id: Uuid) -> Result<Policy, StoreError> {
        let row = sqlx::query(
            "SELECT policy_id, name, tool_id, created_by, allowed_scopes, conditions, rules, \
             priority, is_active, created_at, updated_at FROM policies WHERE policy_id = ?1",
        )
        .bind(policy_id.to_string())
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx)?;
        row_to_policy(&row)
    }

    /// Update a policy's mutable fields with optimistic locking on
    /// `updated_at`. Updates do not retroactively change past decisions;
    /// log rows keep the policy id, not its contents.
    pub async fn update_policy(
        &self,
        policy: &Policy,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Policy, StoreError> {
        let conditions = serde_json::to_string(&policy.conditions)
            .map_err(|e| StoreError::Database(format!("encode conditions: {e}")))?;
        let rules = serde_json::to_string(&policy.rules)
            .map_err(|e| StoreError::Database(format!("encode rules: {e}")))?;

        let result = sqlx::query(
            "UPDATE policies SET name = ?1, allowed_scopes = ?2, conditions = ?3, rules = ?4, \
             priority = ?5, updated_at = ?6 WHERE policy_id = ?7 AND updated_at = ?8",
        )
        .bind(&policy.name)
        .bind(scopes_to_json(&policy.allowed_scopes))
        .bind(conditions)
        .bind(rules)
        .bind(policy.priority)
        .bind(fmt_ts(now))
        .bind(policy.policy_id.to_string())
        .bind(fmt_ts(expected_updated_at))
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return match self.get_policy(policy.policy_id).await {
                Ok(_) => Err(StoreError::ConflictingUpdate),
                Err(StoreError::NotFound) => Err(StoreError::NotFound),
                Err(other) => Err(other),
            };
        }
        self.get_policy(policy.policy_id).await
    }

    /// List policies in creation order, paginated.
    pub async fn list_policies(&self, page: u32, page_size: u32) -> Result<Vec<Policy>, StoreError> {
        let limit = i64::from(page_size.clamp(1, 500));
        let offset = i64::from(page.saturating_sub(1)) * limit;

        let rows = sqlx::query(
            "SELECT policy_id, name, tool_id, created_by, allowed_scopes, conditions, rules, \
             priority, is_active, created_at, updated_at FROM policies \
             ORDER BY created_at ASC, policy_id ASC LIMIT ?1 OFFSET ?2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_policy).collect()
    }

    /// Active policies applicable to `tool_id`, meaning those targeting the
    /// tool plus the global ones (`tool_id IS NULL`), ordered by
    /// `priority DESC, created_at ASC`. This is the candidate order the
    /// policy engine evaluates in.
    pub async fn list_policies_for_tool(&self, tool_id: Uuid) -> Result<Vec<Policy>, StoreError> {
        let rows = sqlx::query(
            "SELECT policy_id, name, tool_id, created_by, allowed_scopes, conditions, rules, \
             priority, is_active, created_at, updated_at FROM policies \
             WHERE is_active = 1 AND (tool_id = ?1 OR tool_id IS NULL) \
             ORDER BY priority DESC, created_at ASC, policy_id ASC",
        )
        .bind(tool_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_policy).collect()
    }

    /// Flip a policy inactive.
    pub async fn deactivate_policy(&self, policy_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE policies SET is_active = 0, updated_at = ?1 WHERE policy_id = ?2",
        )
        .bind(fmt_ts(now))
        .bind(policy_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> Result<Policy, StoreError> {
    let policy_id: String = row.try_get("policy_id").map_err(map_sqlx)?;
    let tool_id: Option<String> = row.try_get("tool_id").map_err(map_sqlx)?;
    let created_by: String = row.try_get("created_by").map_err(map_sqlx)?;
    let allowed_scopes: String = row.try_get("allowed_scopes").map_err(map_sqlx)?;
    let conditions: String = row.try_get("conditions").map_err(map_sqlx)?;
    let rules: String = row.try_get("rules").map_err(map_sqlx)?;
    let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;
    let updated_at: String = row.try_get("updated_at").map_err(map_sqlx)?;

    let policy_uuid = parse_uuid(&policy_id)?;

    Ok(Policy {
        policy_id: policy_uuid,
        name: row.try_get("name").map_err(map_sqlx)?,
        tool_id: parse_uuid_opt(tool_id)?,
        created_by: parse_uuid(&created_by)?,
        allowed_scopes: scopes_from_json(&allowed_scopes)?,
        conditions: decode_closed(policy_uuid, "conditions", &conditions, KNOWN_CONDITION_KEYS)?,
        rules: decode_closed(policy_uuid, "rules", &rules, KNOWN_RULE_KEYS)?,
        priority: row.try_get("priority").map_err(map_sqlx)?,
        is_active: row.try_get("is_active").map_err(map_sqlx)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

/// Decode a JSON object into a closed struct, warning once about keys the
/// struct does not recognize.
fn decode_closed<T: serde::de::DeserializeOwned>(
    policy_id: Uuid,
    field: &str,
    raw: &str,
    known_keys: &[&str],
) -> Result<T, StoreError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| StoreError::Database(format!("bad {field} JSON: {e}")))?;

    if let Some(object) = value.as_object() {
        let unknown: Vec<&str> = object
            .keys()
            .map(String::as_str)
            .filter(|key| !known_keys.contains(key))
            .collect();
        if !unknown.is_empty() {
            tracing::warn!(
                policy_id = %policy_id,
                field,
                keys = ?unknown,
                "ignoring unrecognized policy keys"
            );
        }
    }

    serde_json::from_value(value)
        .map_err(|e| StoreError::Database(format!("bad {field} shape: {e}")))
}

/// Build a policy value for insertion.
#[allow(clippy::too_many_arguments)]
pub fn new_policy(
    name: impl Into<String>,
    tool_id: Option<Uuid>,
    created_by: Uuid,
    allowed_scopes: impl IntoIterator<Item = String>,
    conditions: PolicyConditions,
    rules: PolicyRules,
    priority: i64,
    created_at: DateTime<Utc>,
) -> Policy {
    Policy {
        policy_id: Uuid::new_v4(),
        name: name.into(),
        tool_id,
        created_by,
        allowed_scopes: allowed_scopes.into_iter().collect(),
        conditions,
        rules,
        priority,
        is_active: true,
        created_at,
        updated_at: created_at,
    }
}
