//! Policy engine: select and evaluate policies for an access request.
//!
//! Evaluation is deterministic and side-effect free: the engine reads
//! candidate policies through the store and peeks (never increments) the
//! daily quota counter. All persistence happens in the broker after the
//! decision comes back.

use std::collections::BTreeSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::limiter::RateLimiter;
use crate::store::{Store, StoreError};
use crate::types::{
    Agent, DecisionOutcome, Policy, ReasonCode, RequestContext, Tool,
};

mod conditions;

pub(crate) use conditions::static_conditions_hold;

/// Seconds in the daily-quota window.
const QUOTA_WINDOW_SECS: u64 = 86_400;

/// The engine's verdict for one access request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Allow, deny, or park for approval.
    pub outcome: DecisionOutcome,
    /// The winning policy, when one matched.
    pub matched_policy_id: Option<Uuid>,
    /// `requested ∩ tool.allowed ∩ policy.allowed`; empty unless allowed
    /// or pending.
    pub granted_scopes: BTreeSet<String>,
    /// Lifetime for the credential to mint, present only on allow.
    pub credential_lifetime_secs: Option<u64>,
    /// Machine-readable reason.
    pub reason_code: ReasonCode,
}

impl Decision {
    fn deny(reason_code: ReasonCode) -> Self {
        Self {
            outcome: DecisionOutcome::Deny,
            matched_policy_id: None,
            granted_scopes: BTreeSet::new(),
            credential_lifetime_secs: None,
            reason_code,
        }
    }
}

/// Lifetime bounds applied to every allow decision.
#[derive(Debug, Clone, Copy)]
pub struct LifetimeBounds {
    /// Used when the caller does not request a lifetime.
    pub default_secs: u64,
    /// Hard ceiling regardless of policy or request.
    pub global_max_secs: u64,
}

/// Evaluates layered policies for (agent, tool, scopes, context) tuples.
pub struct PolicyEngine {
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    bounds: LifetimeBounds,
}

impl PolicyEngine {
    /// Create an engine over the given collaborators.
    pub fn new(
        store: Arc<Store>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        bounds: LifetimeBounds,
    ) -> Self {
        Self {
            store,
            limiter,
            clock,
            bounds,
        }
    }

    /// The key the daily quota counter is bucketed by.
    pub fn quota_key(agent_id: Uuid, tool_id: Uuid, policy_id: Uuid) -> String {
        format!("quota:{agent_id}:{tool_id}:{policy_id}")
    }

    /// Evaluate the request and return a decision.
    ///
    /// Candidates come back from the store already ordered by
    /// `priority DESC, created_at ASC`; the first fully matching policy
    /// with a non-empty scope intersection wins. Store failures deny;
    /// the engine never fails open.
    pub async fn evaluate(
        &self,
        ctx: &RequestContext,
        agent: &Agent,
        tool: &Tool,
        requested_scopes: &BTreeSet<String>,
        requested_lifetime_secs: Option<u64>,
    ) -> Decision {
        let candidates = match self.store.list_policies_for_tool(tool.tool_id).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(error = %e, tool_id = %tool.tool_id, "policy load failed, denying");
                let reason = match e {
                    StoreError::Unavailable(_) => ReasonCode::StoreUnavailable,
                    _ => ReasonCode::Internal,
                };
                return Decision::deny(reason);
            }
        };

        let now = self.clock.now();
        for policy in &candidates {
            if !static_conditions_hold(&policy.conditions, agent, ctx, now) {
                continue;
            }
            if !self.quota_allows(policy, agent, tool).await {
                continue;
            }

            let granted = intersect_scopes(requested_scopes, tool, policy);
            if granted.is_empty() {
                // A matching policy that can grant nothing the caller asked
                // for is passed over, not a terminal deny.
                continue;
            }

            if policy.rules.require_approval {
                return Decision {
                    outcome: DecisionOutcome::PendingApproval,
                    matched_policy_id: Some(policy.policy_id),
                    granted_scopes: granted,
                    credential_lifetime_secs: None,
                    reason_code: ReasonCode::ApprovalRequired,
                };
            }

            return Decision {
                outcome: DecisionOutcome::Allow,
                matched_policy_id: Some(policy.policy_id),
                granted_scopes: granted,
                credential_lifetime_secs: Some(self.bound_lifetime(policy, requested_lifetime_secs)),
                reason_code: ReasonCode::PolicyMatched,
            };
        }

        Decision::deny(ReasonCode::NoPolicyMatch)
    }

    /// Peek the daily quota for `(agent, tool, policy)` without consuming
    /// it. The broker records the consumption after provisional approval.
    async fn quota_allows(&self, policy: &Policy, agent: &Agent, tool: &Tool) -> bool {
        let max = match policy.conditions.max_requests_per_day {
            // 0 means unlimited.
            None | Some(0) => return true,
            Some(max) => max,
        };
        let key = Self::quota_key(agent.agent_id, tool.tool_id, policy.policy_id);
        let used = self.limiter.peek(&key, QUOTA_WINDOW_SECS).await;
        used < u64::from(max)
    }

    fn bound_lifetime(&self, policy: &Policy, requested_secs: Option<u64>) -> u64 {
        let mut lifetime = requested_secs.unwrap_or(self.bounds.default_secs);
        if let Some(policy_max) = policy.rules.max_credential_lifetime_seconds {
            lifetime = lifetime.min(policy_max);
        }
        lifetime.min(self.bounds.global_max_secs).max(1)
    }

    /// Record the daily-quota consumption for an approved decision.
    pub async fn consume_quota(&self, policy: &Policy, agent_id: Uuid, tool_id: Uuid) {
        if matches!(policy.conditions.max_requests_per_day, None | Some(0)) {
            return;
        }
        let key = Self::quota_key(agent_id, tool_id, policy.policy_id);
        self.limiter.record(&key, QUOTA_WINDOW_SECS).await;
    }
}

/// `requested ∩ tool.allowed_scopes ∩ policy.allowed_scopes`.
fn intersect_scopes(
    requested: &BTreeSet<String>,
    tool: &Tool,
    policy: &Policy,
) -> BTreeSet<String> {
    requested
        .iter()
        .filter(|scope| tool.allowed_scopes.contains(*scope))
        .filter(|scope| policy.allowed_scopes.contains(*scope))
        .cloned()
        .collect()
}
