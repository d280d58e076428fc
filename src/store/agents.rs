//! Agent persistence.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::types::Agent;

use super::{fmt_ts, map_sqlx, parse_ts, parse_uuid, scopes_from_json, scopes_to_json, Store, StoreError};

impl Store {
    /// Insert a new agent.
    pub async fn create_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agents (agent_id, name, description, roles, is_active, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(agent.agent_id.to_string())
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(scopes_to_json(&agent.roles))
        .bind(agent.is_active)
        .bind(fmt_ts(agent.created_at))
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// Fetch an agent by id.
    pub async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, StoreError> {
        let row = sqlx::query(
            "SELECT agent_id, name, description, roles, is_active, created_at \
             FROM agents WHERE agent_id = ?1",
        )
        .bind(agent_id.to_string())
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx)?;
        row_to_agent(&row)
    }

    /// Update an agent's mutable fields.
    pub async fn update_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE agents SET name = ?1, description = ?2, roles = ?3, is_active = ?4 \
             WHERE agent_id = ?5",
        )
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(scopes_to_json(&agent.roles))
        .bind(agent.is_active)
        .bind(agent.agent_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// List agents in creation order, paginated.
    pub async fn list_agents(&self, page: u32, page_size: u32) -> Result<Vec<Agent>, StoreError> {
        let limit = i64::from(page_size.clamp(1, 500));
        let offset = i64::from(page.saturating_sub(1)) * limit;

        let rows = sqlx::query(
            "SELECT agent_id, name, description, roles, is_active, created_at \
             FROM agents ORDER BY created_at ASC, agent_id ASC LIMIT ?1 OFFSET ?2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_agent).collect()
    }

    /// Flip an agent inactive. The row stays so historical logs remain valid.
    pub async fn deactivate_agent(&self, agent_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE agents SET is_active = 0 WHERE agent_id = ?1")
            .bind(agent_id.to_string())
            .execute(self.pool())
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> Result<Agent, StoreError> {
    let agent_id: String = row.try_get("agent_id").map_err(map_sqlx)?;
    let roles: String = row.try_get("roles").map_err(map_sqlx)?;
    let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;

    Ok(Agent {
        agent_id: parse_uuid(&agent_id)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        roles: scopes_from_json(&roles)?,
        is_active: row.try_get("is_active").map_err(map_sqlx)?,
        created_at: parse_ts(&created_at)?,
    })
}

/// Build an agent value for insertion.
pub fn new_agent(
    name: impl Into<String>,
    description: impl Into<String>,
    roles: impl IntoIterator<Item = String>,
    created_at: DateTime<Utc>,
) -> Agent {
    Agent {
        agent_id: Uuid::new_v4(),
        name: name.into(),
        description: description.into(),
        roles: roles.into_iter().collect(),
        is_active: true,
        created_at,
    }
}
