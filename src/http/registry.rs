//! CRUD plumbing for tools, agents, and policies.
//!
//! DELETE deactivates; referenced entities are never removed, so access
//! log rows stay valid forever.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::clock::Clock as _;
use crate::store::ToolFilter;
use crate::types::{Agent, Policy, PolicyConditions, PolicyRules, Tool};

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    search: Option<String>,
}

fn page(query: &PageQuery) -> (u32, u32) {
    (query.page.unwrap_or(1).max(1), query.page_size.unwrap_or(50))
}

// ── Tools ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct CreateToolBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    api_endpoint: String,
    #[serde(default = "default_version")]
    version: String,
    owner_id: Uuid,
    allowed_scopes: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_owned()
}

/// Register a new tool.
pub async fn create_tool(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateToolBody>,
) -> Result<(StatusCode, Json<Tool>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    if body.allowed_scopes.is_empty() {
        return Err(ApiError::bad_request("allowed_scopes must not be empty"));
    }
    // The owner must exist and be active.
    let owner = state.store.get_agent(body.owner_id).await.map_err(|e| {
        match e {
            crate::store::StoreError::NotFound => ApiError::not_found("owner agent not found"),
            other => other.into(),
        }
    })?;
    if !owner.is_active {
        return Err(ApiError::bad_request("owner agent is inactive"));
    }

    let now = state.clock.now();
    let tool = Tool {
        tool_id: Uuid::new_v4(),
        name: body.name,
        description: body.description,
        api_endpoint: body.api_endpoint,
        version: body.version,
        owner_id: body.owner_id,
        allowed_scopes: body.allowed_scopes.into_iter().collect(),
        tags: body.tags,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    state.store.create_tool(&tool).await?;
    Ok((StatusCode::CREATED, Json(tool)))
}

/// Fetch one tool.
pub async fn get_tool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Tool>, ApiError> {
    Ok(Json(state.store.get_tool(id).await?))
}

/// List tools with optional search.
pub async fn list_tools(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<Tool>>, ApiError> {
    let (page, page_size) = page(&query);
    let tools = state
        .store
        .list_tools(&ToolFilter {
            search: query.search,
            page,
            page_size,
        })
        .await?;
    Ok(Json(tools))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateToolBody {
    name: Option<String>,
    description: Option<String>,
    api_endpoint: Option<String>,
    version: Option<String>,
    allowed_scopes: Option<Vec<String>>,
    tags: Option<Vec<String>>,
}

/// Update a tool. Concurrent writers lose with a 409.
pub async fn update_tool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateToolBody>,
) -> Result<Json<Tool>, ApiError> {
    let mut tool = state.store.get_tool(id).await?;
    let expected = tool.updated_at;

    if let Some(name) = body.name {
        tool.name = name;
    }
    if let Some(description) = body.description {
        tool.description = description;
    }
    if let Some(api_endpoint) = body.api_endpoint {
        tool.api_endpoint = api_endpoint;
    }
    if let Some(version) = body.version {
        tool.version = version;
    }
    if let Some(scopes) = body.allowed_scopes {
        tool.allowed_scopes = scopes.into_iter().collect();
    }
    if let Some(tags) = body.tags {
        tool.tags = tags;
    }

    let updated = state
        .store
        .update_tool(&tool, expected, state.clock.now())
        .await?;
    Ok(Json(updated))
}

/// Deactivate a tool.
pub async fn deactivate_tool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.deactivate_tool(id, state.clock.now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Agents ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct CreateAgentBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    roles: Vec<String>,
}

/// Register a new agent.
pub async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateAgentBody>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    let agent = Agent {
        agent_id: Uuid::new_v4(),
        name: body.name,
        description: body.description,
        roles: body.roles.into_iter().collect(),
        is_active: true,
        created_at: state.clock.now(),
    };
    state.store.create_agent(&agent).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// Fetch one agent.
pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.store.get_agent(id).await?))
}

/// List agents.
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    let (page, page_size) = page(&query);
    Ok(Json(state.store.list_agents(page, page_size).await?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateAgentBody {
    name: Option<String>,
    description: Option<String>,
    roles: Option<Vec<String>>,
}

/// Update an agent's mutable fields.
pub async fn update_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateAgentBody>,
) -> Result<Json<Agent>, ApiError> {
    let mut agent = state.store.get_agent(id).await?;
    if let Some(name) = body.name {
        agent.name = name;
    }
    if let Some(description) = body.description {
        agent.description = description;
    }
    if let Some(roles) = body.roles {
        agent.roles = roles.into_iter().collect();
    }
    state.store.update_agent(&agent).await?;
    Ok(Json(agent))
}

/// Deactivate an agent.
pub async fn deactivate_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.deactivate_agent(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Policies ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct CreatePolicyBody {
    name: String,
    tool_id: Option<Uuid>,
    created_by: Uuid,
    allowed_scopes: Vec<String>,
    #[serde(default)]
    conditions: PolicyConditions,
    #[serde(default)]
    rules: PolicyRules,
    #[serde(default)]
    priority: i64,
}

/// Create a new policy.
pub async fn create_policy(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePolicyBody>,
) -> Result<(StatusCode, Json<Policy>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    if body.allowed_scopes.is_empty() {
        return Err(ApiError::bad_request("allowed_scopes must not be empty"));
    }
    if let Some(tool_id) = body.tool_id {
        state.store.get_tool(tool_id).await.map_err(|e| match e {
            crate::store::StoreError::NotFound => ApiError::not_found("tool not found"),
            other => other.into(),
        })?;
    }

    let now = state.clock.now();
    let policy = Policy {
        policy_id: Uuid::new_v4(),
        name: body.name,
        tool_id: body.tool_id,
        created_by: body.created_by,
        allowed_scopes: body.allowed_scopes.into_iter().collect(),
        conditions: body.conditions,
        rules: body.rules,
        priority: body.priority,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    state.store.create_policy(&policy).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

/// Fetch one policy.
pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Policy>, ApiError> {
    Ok(Json(state.store.get_policy(id).await?))
}

/// List policies.
pub async fn list_policies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<Policy>>, ApiError> {
    let (page, page_size) = page(&query);
    Ok(Json(state.store.list_policies(page, page_size).await?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdatePolicyBody {
    name: Option<String>,
    allowed_scopes: Option<Vec<String>>,
    conditions: Option<PolicyConditions>,
    rules: Option<PolicyRules>,
    priority: Option<i64>,
}

/// Update a policy. Past decisions keep referencing the policy id and are
/// not rewritten.
pub async fn update_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdatePolicyBody>,
) -> Result<Json<Policy>, ApiError> {
    let mut policy = state.store.get_policy(id).await?;
    let expected = policy.updated_at;

    if let Some(name) = body.name {
        policy.name = name;
    }
    if let Some(scopes) = body.allowed_scopes {
        policy.allowed_scopes = scopes.into_iter().collect();
    }
    if let Some(conditions) = body.conditions {
        policy.conditions = conditions;
    }
    if let Some(rules) = body.rules {
        policy.rules = rules;
    }
    if let Some(priority) = body.priority {
        policy.priority = priority;
    }

    let updated = state
        .store
        .update_policy(&policy, expected, state.clock.now())
        .await?;
    Ok(Json(updated))
}

/// Deactivate a policy.
pub async fn deactivate_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.deactivate_policy(id, state.clock.now()).await?;
    Ok(StatusCode::NO_CONTENT)
}
