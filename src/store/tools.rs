//! Tool persistence.
//!
//! Tool names are unique among active tools, compared case-insensitively.
//! Updates use optimistic locking on `updated_at`.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::types::Tool;

use super::{
    fmt_ts, map_sqlx, parse_ts, parse_uuid, scopes_from_json, scopes_to_json, strings_from_json,
    strings_to_json, Store, StoreError,
};

/// Listing filter for tools.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    /// Case-insensitive match against name, description, or a tag.
    pub search: Option<String>,
    /// 1-based page.
    pub page: u32,
    /// Rows per page.
    pub page_size: u32,
}

impl Store {
    /// Insert a new tool. Fails with [`StoreError::AlreadyExists`] when an
    /// active tool with the same case-folded name exists.
    pub async fn create_tool(&self, tool: &Tool) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO tools (tool_id, name, description, api_endpoint, version, owner_id, \
             allowed_scopes, tags, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(tool.tool_id.to_string())
        .bind(&tool.name)
        .bind(&tool.description)
        .bind(&tool.api_endpoint)
        .bind(&tool.version)
        .bind(tool.owner_id.to_string())
        .bind(scopes_to_json(&tool.allowed_scopes))
        .bind(strings_to_json(&tool.tags))
        .bind(tool.is_active)
        .bind(fmt_ts(tool.created_at))
        .bind(fmt_ts(tool.updated_at))
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => match map_sqlx(e) {
                StoreError::AlreadyExists(_) => Err(StoreError::AlreadyExists(format!(
                    "Tool with name '{}' already exists",
                    tool.name
                ))),
                other => Err(other),
            },
        }
    }

    /// Fetch a tool by id.
    pub async fn get_tool(&self, tool_id: Uuid) -> Result<Tool, StoreError> {
        let row = sqlx::query(
            "SELECT tool_id, name, description, api_endpoint, version, owner_id, allowed_scopes, \
             tags, is_active, created_at, updated_at FROM tools WHERE tool_id = ?1",
        )
        .bind(tool_id.to_string())
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx)?;
        row_to_tool(&row)
    }

    /// Update a tool's mutable fields. `expected_updated_at` must match the
    /// stored value or the update loses with [`StoreError::ConflictingUpdate`].
    pub async fn update_tool(
        &self,
        tool: &Tool,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Tool, StoreError> {
        let result = sqlx::query(
            "UPDATE tools SET name = ?1, description = ?2, api_endpoint = ?3, version = ?4, \
             allowed_scopes = ?5, tags = ?6, updated_at = ?7 \
             WHERE tool_id = ?8 AND updated_at = ?9",
        )
        .bind(&tool.name)
        .bind(&tool.description)
        .bind(&tool.api_endpoint)
        .bind(&tool.version)
        .bind(scopes_to_json(&tool.allowed_scopes))
        .bind(strings_to_json(&tool.tags))
        .bind(fmt_ts(now))
        .bind(tool.tool_id.to_string())
        .bind(fmt_ts(expected_updated_at))
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a missing row.
            return match self.get_tool(tool.tool_id).await {
                Ok(_) => Err(StoreError::ConflictingUpdate),
                Err(StoreError::NotFound) => Err(StoreError::NotFound),
                Err(other) => Err(other),
            };
        }
        self.get_tool(tool.tool_id).await
    }

    /// List tools, optionally filtered by a search term over name,
    /// description, and tags.
    pub async fn list_tools(&self, filter: &ToolFilter) -> Result<Vec<Tool>, StoreError> {
        let limit = i64::from(filter.page_size.clamp(1, 500));
        let offset = i64::from(filter.page.saturating_sub(1)) * limit;

        let rows = match &filter.search {
            Some(term) => {
                let like = format!("%{}%", term.to_lowercase());
                sqlx::query(
                    "SELECT tool_id, name, description, api_endpoint, version, owner_id, \
                     allowed_scopes, tags, is_active, created_at, updated_at FROM tools \
                     WHERE lower(name) LIKE ?1 OR lower(description) LIKE ?1 OR lower(tags) LIKE ?1 \
                     ORDER BY created_at ASC, tool_id ASC LIMIT ?2 OFFSET ?3",
                )
                .bind(like)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query(
                    "SELECT tool_id, name, description, api_endpoint, version, owner_id, \
                     allowed_scopes, tags, is_active, created_at, updated_at FROM tools \
                     ORDER BY created_at ASC, tool_id ASC LIMIT ?1 OFFSET ?2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await
            }
        }
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_tool).collect()
    }

    /// Flip a tool inactive, freeing its name for reuse while the row stays
    /// for log references.
    pub async fn deactivate_tool(&self, tool_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tools SET is_active = 0, updated_at = ?1 WHERE tool_id = ?2",
        )
        .bind(fmt_ts(now))
        .bind(tool_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_tool(row: &sqlx::sqlite::SqliteRow) -> Result<Tool, StoreError> {
    let tool_id: String = row.try_get("tool_id").map_err(map_sqlx)?;
    let owner_id: String = row.try_get("owner_id").map_err(map_sqlx)?;
    let allowed_scopes: String = row.try_get("allowed_scopes").map_err(map_sqlx)?;
    let tags: String = row.try_get("tags").map_err(map_sqlx)?;
    let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;
    let updated_at: String = row.try_get("updated_at").map_err(map_sqlx)?;

    Ok(Tool {
        tool_id: parse_uuid(&tool_id)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        api_endpoint: row.try_get("api_endpoint").map_err(map_sqlx)?,
        version: row.try_get("version").map_err(map_sqlx)?,
        owner_id: parse_uuid(&owner_id)?,
        allowed_scopes: scopes_from_json(&allowed_scopes)?,
        tags: strings_from_json(&tags)?,
        is_active: row.try_get("is_active").map_err(map_sqlx)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}
