//! Access broker: orchestrates the hot path for every access request.
//!
//! Pipeline: load targets → rate limit → policy evaluation → mint /
//! park / deny → audit. The broker owns all persistence around the
//! decision; the engine stays pure. Every failure mode maps to a denial;
//! the pipeline never fails open and never panics outward.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::audit::{AuditLogger, NewLogEntry};
use crate::clock::Clock;
use crate::limiter::RateLimiter;
use crate::policy::{Decision, LifetimeBounds, PolicyEngine};
use crate::store::{Store, StoreError};
use crate::types::{
    AccessEvent, AccessRequest, Agent, DecisionOutcome, Policy, RateLimitKey, ReasonCode,
    RequestContext, RequestStatus, Tool,
};
use crate::vendor::{CredentialVendor, IssueParams, IssuedCredential, VendorError};

/// How long a completed decision is replayed for an idempotency key.
const IDEMPOTENCY_TTL_SECS: i64 = 600;

/// Bound on the idempotency cache.
const IDEMPOTENCY_CACHE_CAP: usize = 10_000;

/// Caller input for [`AccessBroker::request_access`].
#[derive(Debug, Clone)]
pub struct AccessRequestInput {
    /// Requesting agent.
    pub agent_id: Uuid,
    /// Target tool.
    pub tool_id: Uuid,
    /// Scopes the agent wants.
    pub requested_scopes: BTreeSet<String>,
    /// Requested credential lifetime; bounded by policy and global caps.
    pub requested_lifetime_seconds: Option<u64>,
    /// Free-text justification, surfaced to human resolvers.
    pub justification: Option<String>,
    /// When present, a completed decision for the same key within ten
    /// minutes is returned as-is and no second credential is minted.
    pub idempotency_key: Option<String>,
}

/// The broker's answer to one access request.
#[derive(Debug, Clone)]
pub enum AccessDecision {
    /// A policy allowed the request and a credential was minted.
    Approved {
        /// The minted credential, bearer included (returned exactly once
        /// per decision; idempotent replays return the same decision).
        credential: IssuedCredential,
        /// The policy that matched.
        matched_policy_id: Uuid,
    },
    /// A policy matched but demands human approval.
    PendingApproval {
        /// The parked access request to poll or resolve.
        access_request_id: Uuid,
        /// The policy that matched.
        matched_policy_id: Uuid,
    },
    /// The request was denied.
    Denied {
        /// Machine-readable reason.
        reason_code: ReasonCode,
        /// Present on rate-limit denials.
        retry_after_secs: Option<u64>,
    },
}

impl AccessDecision {
    fn denied(reason_code: ReasonCode) -> Self {
        AccessDecision::Denied {
            reason_code,
            retry_after_secs: None,
        }
    }
}

/// Failures of human resolution of a pending request.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No such access request.
    #[error("access request not found")]
    NotFound,
    /// The request was already approved or rejected.
    #[error("access request already resolved")]
    AlreadyResolved,
    /// The request sat pending past its deadline.
    #[error("access request expired")]
    Expired,
    /// The request references an agent, tool, or policy that is gone or
    /// inactive.
    #[error("request target is unknown or inactive")]
    UnknownTarget,
    /// Transient backend failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Unclassified failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Outcome of resolving a pending access request.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    /// The request in its terminal state.
    pub request: AccessRequest,
    /// The credential minted on approval.
    pub credential: Option<IssuedCredential>,
}

/// Orchestrates rate limiter, policy engine, credential vendor, and audit
/// logger for every request.
pub struct AccessBroker {
    store: Arc<Store>,
    engine: PolicyEngine,
    vendor: Arc<CredentialVendor>,
    limiter: Arc<RateLimiter>,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
    bounds: LifetimeBounds,
    idempotency: Mutex<HashMap<String, (DateTime<Utc>, AccessDecision)>>,
}

impl AccessBroker {
    /// Wire up the broker from its collaborators.
    pub fn new(
        store: Arc<Store>,
        engine: PolicyEngine,
        vendor: Arc<CredentialVendor>,
        limiter: Arc<RateLimiter>,
        audit: Arc<AuditLogger>,
        clock: Arc<dyn Clock>,
        bounds: LifetimeBounds,
    ) -> Self {
        Self {
            store,
            engine,
            vendor,
            limiter,
            audit,
            clock,
            bounds,
            idempotency: Mutex::new(HashMap::new()),
        }
    }

    /// Run the full decision pipeline for one access request.
    pub async fn request_access(
        &self,
        ctx: &RequestContext,
        input: AccessRequestInput,
    ) -> AccessDecision {
        if let Some(key) = &input.idempotency_key {
            if let Some(prior) = self.replay(key) {
                tracing::debug!(idempotency_key = %key, "replaying completed decision");
                return prior;
            }
        }

        let decision = self.decide(ctx, &input).await;

        if let Some(key) = input.idempotency_key {
            self.remember(key, decision.clone());
        }
        decision
    }

    async fn decide(&self, ctx: &RequestContext, input: &AccessRequestInput) -> AccessDecision {
        // Load and activity-check both targets before any counters move.
        let agent = match self.load_agent(input.agent_id).await {
            Ok(agent) => agent,
            Err(decision) => {
                self.log_denied(ctx, input, None, *deny_reason(&decision)).await;
                return decision;
            }
        };
        let tool = match self.load_tool(input.tool_id).await {
            Ok(tool) => tool,
            Err(decision) => {
                self.log_denied(ctx, input, Some(&agent), *deny_reason(&decision))
                    .await;
                return decision;
            }
        };

        // Broker-level ceiling, keyed by agent. Rejections here never reach
        // the policy engine.
        let check = self.limiter.check(&agent_identity(agent.agent_id)).await;
        if !check.allowed {
            let retry_after = check.retry_after_secs(self.clock.now());
            self.log_rate_limited(ctx, input, retry_after).await;
            return AccessDecision::Denied {
                reason_code: ReasonCode::RateLimited,
                retry_after_secs: Some(retry_after),
            };
        }

        if self.expired_or_cancelled(ctx) {
            self.log_denied(ctx, input, Some(&agent), ReasonCode::Cancelled)
                .await;
            return AccessDecision::denied(ReasonCode::Cancelled);
        }

        let decision = self
            .engine
            .evaluate(
                ctx,
                &agent,
                &tool,
                &input.requested_scopes,
                input.requested_lifetime_seconds,
            )
            .await;

        // Cancellation between approval and issuance leaves no credential
        // behind, only a denied evaluation entry.
        if self.expired_or_cancelled(ctx) {
            self.log_denied(ctx, input, Some(&agent), ReasonCode::Cancelled)
                .await;
            return AccessDecision::denied(ReasonCode::Cancelled);
        }

        match decision.outcome {
            DecisionOutcome::Allow => self.grant(ctx, input, &agent, &tool, &decision).await,
            DecisionOutcome::PendingApproval => self.park(ctx, input, &decision).await,
            DecisionOutcome::Deny => {
                self.log_denied(ctx, input, Some(&agent), decision.reason_code)
                    .await;
                AccessDecision::denied(decision.reason_code)
            }
        }
    }

    async fn grant(
        &self,
        ctx: &RequestContext,
        input: &AccessRequestInput,
        agent: &Agent,
        tool: &Tool,
        decision: &Decision,
    ) -> AccessDecision {
        let matched_policy_id = match decision.matched_policy_id {
            Some(id) => id,
            None => {
                self.log_denied(ctx, input, Some(agent), ReasonCode::Internal)
                    .await;
                return AccessDecision::denied(ReasonCode::Internal);
            }
        };

        let policy = match self.store.get_policy(matched_policy_id).await {
            Ok(policy) => policy,
            Err(e) => {
                let reason = store_reason(&e);
                self.log_denied(ctx, input, Some(agent), reason).await;
                return AccessDecision::denied(reason);
            }
        };

        // A policy may bucket the ceiling by a different identity than the
        // broker's default agent key; enforce that before minting.
        if let Some(decision) = self
            .policy_rate_limit(ctx, input, agent, tool, &policy)
            .await
        {
            return decision;
        }

        self.engine
            .consume_quota(&policy, agent.agent_id, tool.tool_id)
            .await;

        let mut evaluated = NewLogEntry::for_event(
            AccessEvent::RequestEvaluated,
            ReasonCode::PolicyMatched,
        );
        evaluated.agent_id = Some(agent.agent_id);
        evaluated.tool_id = Some(tool.tool_id);
        evaluated.policy_id = Some(matched_policy_id);
        evaluated.decision = Some(DecisionOutcome::Allow);
        evaluated.requested_scopes = input.requested_scopes.clone();
        evaluated.granted_scopes = decision.granted_scopes.clone();
        let evaluated = match self.audit.prepare(ctx, evaluated) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(error = %e, "audit prepare failed");
                return AccessDecision::denied(ReasonCode::Internal);
            }
        };

        let issue = self
            .vendor
            .issue(
                ctx,
                IssueParams {
                    agent_id: agent.agent_id,
                    tool_id: tool.tool_id,
                    scopes: decision.granted_scopes.clone(),
                    requested_scopes: input.requested_scopes.clone(),
                    lifetime_secs: decision.credential_lifetime_secs.unwrap_or(1),
                    source_policy_id: matched_policy_id,
                    source_request_id: None,
                },
                vec![evaluated],
            )
            .await;

        match issue {
            Ok(credential) => AccessDecision::Approved {
                credential,
                matched_policy_id,
            },
            Err(e) => {
                let reason = vendor_reason(&e);
                tracing::warn!(error = %e, "issuance failed, denying");
                self.log_denied(ctx, input, Some(agent), reason).await;
                AccessDecision::denied(reason)
            }
        }
    }

    async fn park(
        &self,
        ctx: &RequestContext,
        input: &AccessRequestInput,
        decision: &Decision,
    ) -> AccessDecision {
        let matched_policy_id = match decision.matched_policy_id {
            Some(id) => id,
            None => {
                self.log_denied(ctx, input, None, ReasonCode::Internal).await;
                return AccessDecision::denied(ReasonCode::Internal);
            }
        };

        let request = AccessRequest {
            request_id: Uuid::new_v4(),
            agent_id: input.agent_id,
            tool_id: input.tool_id,
            requested_scopes: input.requested_scopes.clone(),
            justification: input.justification.clone(),
            status: RequestStatus::Pending,
            matched_policy_id: Some(matched_policy_id),
            created_at: self.clock.now(),
            resolved_at: None,
            resolver_id: None,
        };

        let mut entry = NewLogEntry::for_event(
            AccessEvent::RequestEvaluated,
            ReasonCode::ApprovalRequired,
        );
        entry.agent_id = Some(input.agent_id);
        entry.tool_id = Some(input.tool_id);
        entry.policy_id = Some(matched_policy_id);
        entry.decision = Some(DecisionOutcome::PendingApproval);
        entry.requested_scopes = input.requested_scopes.clone();
        let entry = match self.audit.prepare(ctx, entry) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(error = %e, "audit prepare failed");
                return AccessDecision::denied(ReasonCode::Internal);
            }
        };

        // One transaction: a resolvable PENDING row must never exist
        // without its evaluation entry.
        if let Err(e) = self.store.park_request_txn(&request, &entry).await {
            let reason = store_reason(&e);
            tracing::warn!(error = %e, "failed to park access request");
            self.log_denied(ctx, input, None, reason).await;
            return AccessDecision::denied(reason);
        }

        AccessDecision::PendingApproval {
            access_request_id: request.request_id,
            matched_policy_id,
        }
    }

    /// Resolve a parked request: approve (minting a credential under the
    /// originally matched policy) or reject.
    pub async fn resolve_request(
        &self,
        ctx: &RequestContext,
        request_id: Uuid,
        approve: bool,
        resolver_id: Uuid,
    ) -> Result<ResolveOutcome, ResolveError> {
        let now = self.clock.now();
        let request = self
            .store
            .get_access_request(request_id, now)
            .await
            .map_err(resolve_store_err)?;

        match request.status {
            RequestStatus::Pending => {}
            RequestStatus::Expired => return Err(ResolveError::Expired),
            _ => return Err(ResolveError::AlreadyResolved),
        }

        if !approve {
            let request = self
                .store
                .resolve_access_request(request_id, RequestStatus::Rejected, resolver_id, now)
                .await
                .map_err(resolve_store_err)?;
            return Ok(ResolveOutcome {
                request,
                credential: None,
            });
        }

        let agent = self
            .store
            .get_agent(request.agent_id)
            .await
            .map_err(resolve_store_err)?;
        let tool = self
            .store
            .get_tool(request.tool_id)
            .await
            .map_err(resolve_store_err)?;
        if !agent.is_active || !tool.is_active {
            return Err(ResolveError::UnknownTarget);
        }
        let policy_id = request.matched_policy_id.ok_or_else(|| {
            ResolveError::Internal("pending request has no matched policy".to_owned())
        })?;
        let policy = self
            .store
            .get_policy(policy_id)
            .await
            .map_err(resolve_store_err)?;

        // Re-intersect at resolution time: the tool or policy may have
        // narrowed since the request was parked.
        let granted: BTreeSet<String> = request
            .requested_scopes
            .iter()
            .filter(|scope| tool.allowed_scopes.contains(*scope))
            .filter(|scope| policy.allowed_scopes.contains(*scope))
            .cloned()
            .collect();
        if granted.is_empty() {
            return Err(ResolveError::UnknownTarget);
        }

        // Transition first so a concurrent resolver loses cleanly; mint
        // after. An issuance failure leaves an approved request without a
        // credential, which the resolver sees as an error and can retry
        // through a fresh access request.
        let request = self
            .store
            .resolve_access_request(request_id, RequestStatus::Approved, resolver_id, now)
            .await
            .map_err(resolve_store_err)?;

        let credential = self
            .vendor
            .issue(
                ctx,
                IssueParams {
                    agent_id: agent.agent_id,
                    tool_id: tool.tool_id,
                    scopes: granted.clone(),
                    requested_scopes: request.requested_scopes.clone(),
                    lifetime_secs: bound_lifetime(&policy, &self.bounds),
                    source_policy_id: policy.policy_id,
                    source_request_id: Some(request_id),
                },
                vec![],
            )
            .await
            .map_err(|e| ResolveError::Internal(e.to_string()))?;

        Ok(ResolveOutcome {
            request,
            credential: Some(credential),
        })
    }

    // ── Pipeline helpers ────────────────────────────────────────

    async fn load_agent(&self, agent_id: Uuid) -> Result<Agent, AccessDecision> {
        match self.store.get_agent(agent_id).await {
            Ok(agent) if agent.is_active => Ok(agent),
            Ok(_) => Err(AccessDecision::denied(ReasonCode::UnknownTarget)),
            Err(StoreError::NotFound) => Err(AccessDecision::denied(ReasonCode::UnknownTarget)),
            Err(e) => Err(AccessDecision::denied(store_reason(&e))),
        }
    }

    async fn load_tool(&self, tool_id: Uuid) -> Result<Tool, AccessDecision> {
        match self.store.get_tool(tool_id).await {
            Ok(tool) if tool.is_active => Ok(tool),
            Ok(_) => Err(AccessDecision::denied(ReasonCode::UnknownTarget)),
            Err(StoreError::NotFound) => Err(AccessDecision::denied(ReasonCode::UnknownTarget)),
            Err(e) => Err(AccessDecision::denied(store_reason(&e))),
        }
    }

    async fn policy_rate_limit(
        &self,
        ctx: &RequestContext,
        input: &AccessRequestInput,
        agent: &Agent,
        tool: &Tool,
        policy: &Policy,
    ) -> Option<AccessDecision> {
        let identity = match policy.rules.rate_limit_key {
            // The agent key was already consumed by the broker-level check.
            None | Some(RateLimitKey::Agent) => return None,
            Some(RateLimitKey::Ip) => format!(
                "ip:{}",
                ctx.remote_ip.map_or_else(|| "unknown".to_owned(), |ip| ip.to_string())
            ),
            Some(RateLimitKey::AgentTool) => {
                format!("agent:{}:tool:{}", agent.agent_id, tool.tool_id)
            }
        };

        let check = self.limiter.check(&identity).await;
        if check.allowed {
            return None;
        }
        let retry_after = check.retry_after_secs(self.clock.now());
        self.log_rate_limited(ctx, input, retry_after).await;
        Some(AccessDecision::Denied {
            reason_code: ReasonCode::RateLimited,
            retry_after_secs: Some(retry_after),
        })
    }

    fn expired_or_cancelled(&self, ctx: &RequestContext) -> bool {
        if ctx.cancel.is_cancelled() {
            return true;
        }
        match ctx.deadline {
            Some(deadline) => self.clock.now() > deadline,
            None => false,
        }
    }

    async fn log_denied(
        &self,
        ctx: &RequestContext,
        input: &AccessRequestInput,
        agent: Option<&Agent>,
        reason_code: ReasonCode,
    ) {
        let mut entry = NewLogEntry::for_event(AccessEvent::RequestEvaluated, reason_code);
        entry.agent_id = agent.map(|a| a.agent_id).or(Some(input.agent_id));
        entry.tool_id = Some(input.tool_id);
        entry.decision = Some(DecisionOutcome::Deny);
        entry.requested_scopes = input.requested_scopes.clone();
        if let Err(e) = self.audit.log_event(ctx, entry).await {
            // The decision is already a denial; nothing further to fail
            // closed, but the gap must be visible.
            tracing::error!(error = %e, "audit append failed for denial");
        }
    }

    async fn log_rate_limited(
        &self,
        ctx: &RequestContext,
        input: &AccessRequestInput,
        retry_after_secs: u64,
    ) {
        let mut entry = NewLogEntry::for_event(AccessEvent::RateLimited, ReasonCode::RateLimited);
        entry.agent_id = Some(input.agent_id);
        entry.tool_id = Some(input.tool_id);
        entry.decision = Some(DecisionOutcome::Deny);
        entry.requested_scopes = input.requested_scopes.clone();
        if let Err(e) = self.audit.log_event(ctx, entry).await {
            tracing::error!(error = %e, "audit append failed for rate-limit denial");
        }
        tracing::debug!(retry_after_secs, "request rate limited");
    }

    // ── Idempotency cache ───────────────────────────────────────

    fn replay(&self, key: &str) -> Option<AccessDecision> {
        let now = self.clock.now();
        let mut cache = self.idempotency.lock().ok()?;
        cache.retain(|_, (stored_at, _)| now - *stored_at < Duration::seconds(IDEMPOTENCY_TTL_SECS));
        cache.get(key).map(|(_, decision)| decision.clone())
    }

    fn remember(&self, key: String, decision: AccessDecision) {
        let now = self.clock.now();
        if let Ok(mut cache) = self.idempotency.lock() {
            if cache.len() >= IDEMPOTENCY_CACHE_CAP {
                cache.retain(|_, (stored_at, _)| {
                    now - *stored_at < Duration::seconds(IDEMPOTENCY_TTL_SECS)
                });
                if cache.len() >= IDEMPOTENCY_CACHE_CAP {
                    cache.clear();
                }
            }
            cache.insert(key, (now, decision));
        }
    }
}

fn agent_identity(agent_id: Uuid) -> String {
    format!("agent:{agent_id}")
}

fn deny_reason(decision: &AccessDecision) -> &ReasonCode {
    match decision {
        AccessDecision::Denied { reason_code, .. } => reason_code,
        _ => &ReasonCode::Internal,
    }
}

fn store_reason(e: &StoreError) -> ReasonCode {
    match e {
        StoreError::Unavailable(_) => ReasonCode::StoreUnavailable,
        _ => ReasonCode::Internal,
    }
}

fn vendor_reason(e: &VendorError) -> ReasonCode {
    match e {
        VendorError::Keystore(_) => ReasonCode::KeystoreUnavailable,
        VendorError::Store(StoreError::Unavailable(_)) => ReasonCode::StoreUnavailable,
        VendorError::Audit(_) => ReasonCode::StoreUnavailable,
        _ => ReasonCode::Internal,
    }
}

fn resolve_store_err(e: StoreError) -> ResolveError {
    match e {
        StoreError::NotFound => ResolveError::NotFound,
        StoreError::ConflictingUpdate => ResolveError::AlreadyResolved,
        StoreError::Unavailable(msg) => ResolveError::Unavailable(msg),
        other => ResolveError::Internal(other.to_string()),
    }
}

fn bound_lifetime(policy: &Policy, bounds: &LifetimeBounds) -> u64 {
    let mut lifetime = bounds.default_secs;
    if let Some(policy_max) = policy.rules.max_credential_lifetime_seconds {
        lifetime = lifetime.min(policy_max);
    }
    lifetime.min(bounds.global_max_secs).max(1)
}
