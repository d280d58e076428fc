//! Core data model: agents, tools, policies, access requests, credentials,
//! and the append-only access log.
//!
//! Policy `conditions` and `rules` are closed structs with the recognized
//! keys only; unknown keys in stored JSON are dropped (and logged once at
//! policy load) rather than carried around as free-form maps.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Entities ────────────────────────────────────────────────────

/// A non-human caller identity known to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Immutable identifier.
    pub agent_id: Uuid,
    /// Display name.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Opaque role strings consumed by the policy engine.
    pub roles: BTreeSet<String>,
    /// Deactivated agents keep their row so historical logs stay valid.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A registered remote capability with declared scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Immutable identifier.
    pub tool_id: Uuid,
    /// Unique among active tools, compared case-insensitively.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Advertised endpoint of the tool itself (informational; the broker
    /// never proxies tool traffic).
    pub api_endpoint: String,
    /// Semver version string.
    pub version: String,
    /// Owning agent.
    pub owner_id: Uuid,
    /// The universe of scopes this tool understands. Policy scopes outside
    /// this set are ignored.
    pub allowed_scopes: BTreeSet<String>,
    /// Search tags.
    pub tags: Vec<String>,
    /// Deactivated tools keep their row for log references.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time, used for optimistic locking.
    pub updated_at: DateTime<Utc>,
}

/// A rule set deciding whether an agent may obtain scopes for a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Immutable identifier.
    pub policy_id: Uuid,
    /// Display name.
    pub name: String,
    /// Target tool; `None` applies the policy to every tool.
    pub tool_id: Option<Uuid>,
    /// Agent that created the policy.
    pub created_by: Uuid,
    /// Scopes this policy can grant.
    pub allowed_scopes: BTreeSet<String>,
    /// Match conditions; every declared condition must hold.
    pub conditions: PolicyConditions,
    /// Behavior once matched.
    pub rules: PolicyRules,
    /// Higher priority wins; ties broken by older `created_at`.
    pub priority: i64,
    /// Inactive policies are never candidates.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time, used for optimistic locking.
    pub updated_at: DateTime<Utc>,
}

/// Recognized policy match conditions. A missing key means "no constraint
/// on that axis".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConditions {
    /// Daily request ceiling for (agent, tool, policy); 0 means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests_per_day: Option<u32>,
    /// Wall-clock window in which the policy matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_hours: Option<HoursWindow>,
    /// Allowed weekdays, 0 = Monday .. 6 = Sunday.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_days: Option<Vec<u8>>,
    /// Agent must hold ALL of these roles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_roles: Option<BTreeSet<String>>,
    /// Agent must hold AT LEAST ONE of these roles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_roles: Option<BTreeSet<String>>,
    /// Remote IP must fall in at least one of these CIDR blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_cidrs: Option<Vec<String>>,
}

/// Daily time window declared in an IANA zone.
///
/// Inclusive of `start`, exclusive of `end`, minute granularity. When
/// `end <= start` the window wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoursWindow {
    /// "HH:MM".
    pub start: String,
    /// "HH:MM".
    pub end: String,
    /// IANA zone name, e.g. "Europe/Berlin".
    pub tz: String,
}

/// Recognized policy rules applied after a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    /// When true, a match parks the request for human approval instead of
    /// minting a credential.
    pub require_approval: bool,
    /// Record usage in the access log.
    pub log_usage: bool,
    /// Upper bound on issued credential TTL, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_credential_lifetime_seconds: Option<u64>,
    /// Identity key the rate limiter buckets by for this policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_key: Option<RateLimitKey>,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            require_approval: false,
            log_usage: true,
            max_credential_lifetime_seconds: None,
            rate_limit_key: None,
        }
    }
}

/// Which identity a rate-limit bucket is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    /// Per requesting agent.
    Agent,
    /// Per remote IP.
    Ip,
    /// Per (agent, tool) pair.
    AgentTool,
}

// ── Access requests ─────────────────────────────────────────────

/// Lifecycle state of an access request awaiting human resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Waiting for a resolver.
    Pending,
    /// Approved; a credential was minted.
    Approved,
    /// Rejected by a resolver.
    Rejected,
    /// Unresolved past the pending deadline.
    Expired,
}

impl RequestStatus {
    /// Stable string form used in storage and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Approved => "APPROVED",
            RequestStatus::Rejected => "REJECTED",
            RequestStatus::Expired => "EXPIRED",
        }
    }
}

/// A request parked for human approval by a `require_approval` policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Immutable identifier.
    pub request_id: Uuid,
    /// Requesting agent.
    pub agent_id: Uuid,
    /// Target tool.
    pub tool_id: Uuid,
    /// Scopes the agent asked for.
    pub requested_scopes: BTreeSet<String>,
    /// Caller-supplied justification shown to the resolver.
    pub justification: Option<String>,
    /// Current lifecycle state.
    pub status: RequestStatus,
    /// Policy that parked the request.
    pub matched_policy_id: Option<Uuid>,
    /// Creation time; pending requests expire after [`PENDING_REQUEST_TTL_DAYS`].
    pub created_at: DateTime<Utc>,
    /// When a resolver acted.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Agent that resolved the request.
    pub resolver_id: Option<Uuid>,
}

/// How long a pending access request stays resolvable.
pub const PENDING_REQUEST_TTL_DAYS: i64 = 7;

// ── Credentials ─────────────────────────────────────────────────

/// A minted short-lived credential. The bearer token itself is never
/// persisted; only its fingerprint is kept for lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Immutable identifier; also the bearer's `jti` claim.
    pub credential_id: Uuid,
    /// Agent the credential was issued to.
    pub agent_id: Uuid,
    /// Tool the credential is bound to.
    pub tool_id: Uuid,
    /// Granted scopes: subset of policy ∩ tool ∩ requested scopes.
    pub granted_scopes: BTreeSet<String>,
    /// Keyed hash of the bearer, used for lookup at validation.
    pub token_fingerprint: String,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// Expiry; always after `issued_at`.
    pub expires_at: DateTime<Utc>,
    /// Set exactly once on revocation.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Policy whose match produced this credential.
    pub source_policy_id: Uuid,
    /// Access request this credential resolved, if any.
    pub source_request_id: Option<Uuid>,
}

impl Credential {
    /// A credential is valid iff `now ∈ [issued_at, expires_at)` and it has
    /// not been revoked.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now >= self.issued_at && now < self.expires_at
    }
}

// ── Decisions and reasons ───────────────────────────────────────

/// Outcome of a policy evaluation or broker decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionOutcome {
    /// Access granted.
    Allow,
    /// Access denied.
    Deny,
    /// Parked for human approval.
    PendingApproval,
}

impl DecisionOutcome {
    /// Stable string form used in storage and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionOutcome::Allow => "ALLOW",
            DecisionOutcome::Deny => "DENY",
            DecisionOutcome::PendingApproval => "PENDING_APPROVAL",
        }
    }
}

/// Machine-readable reason attached to every decision and log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// A policy matched and allowed the request.
    PolicyMatched,
    /// No active policy matched the request.
    NoPolicyMatch,
    /// The matched policy requires human approval.
    ApprovalRequired,
    /// The caller exceeded its request ceiling.
    RateLimited,
    /// Referenced agent or tool is missing or inactive.
    UnknownTarget,
    /// Persistence backend unavailable; decision failed closed.
    StoreUnavailable,
    /// Signing-key backend unavailable; decision failed closed.
    KeystoreUnavailable,
    /// The request was cancelled before issuance.
    Cancelled,
    /// Unclassified internal failure.
    Internal,
    /// Credential was revoked.
    Revoked,
    /// Credential expired.
    Expired,
    /// Bearer signature or shape did not verify.
    InvalidSignature,
    /// No credential row matches the presented bearer.
    UnknownCredential,
    /// Credential lacks the required scope.
    InsufficientScope,
    /// Credential verified and valid.
    CredentialValid,
    /// Pending request passed its resolution deadline.
    RequestExpired,
}

impl ReasonCode {
    /// Stable string form used in storage and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::PolicyMatched => "POLICY_MATCHED",
            ReasonCode::NoPolicyMatch => "NO_POLICY_MATCH",
            ReasonCode::ApprovalRequired => "APPROVAL_REQUIRED",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::UnknownTarget => "UNKNOWN_TARGET",
            ReasonCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ReasonCode::KeystoreUnavailable => "KEYSTORE_UNAVAILABLE",
            ReasonCode::Cancelled => "CANCELLED",
            ReasonCode::Internal => "INTERNAL",
            ReasonCode::Revoked => "REVOKED",
            ReasonCode::Expired => "EXPIRED",
            ReasonCode::InvalidSignature => "INVALID_SIGNATURE",
            ReasonCode::UnknownCredential => "UNKNOWN_CREDENTIAL",
            ReasonCode::InsufficientScope => "INSUFFICIENT_SCOPE",
            ReasonCode::CredentialValid => "CREDENTIAL_VALID",
            ReasonCode::RequestExpired => "REQUEST_EXPIRED",
        }
    }
}

// ── Access log ──────────────────────────────────────────────────

/// Kind of event recorded in the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessEvent {
    /// A `RequestAccess` call was evaluated end to end.
    RequestEvaluated,
    /// A credential was minted.
    CredentialIssued,
    /// A presented bearer was validated.
    CredentialValidated,
    /// A credential was revoked.
    CredentialRevoked,
    /// The rate limiter rejected the call before evaluation.
    RateLimited,
}

impl AccessEvent {
    /// Stable string form used in storage and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            AccessEvent::RequestEvaluated => "REQUEST_EVALUATED",
            AccessEvent::CredentialIssued => "CREDENTIAL_ISSUED",
            AccessEvent::CredentialValidated => "CREDENTIAL_VALIDATED",
            AccessEvent::CredentialRevoked => "CREDENTIAL_REVOKED",
            AccessEvent::RateLimited => "RATE_LIMITED",
        }
    }
}

/// One append-only access log row. Never updated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// Immutable identifier.
    pub log_id: Uuid,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Correlates all entries of a single `RequestAccess` call.
    pub request_id: Option<Uuid>,
    /// Requesting agent, when known.
    pub agent_id: Option<Uuid>,
    /// Target tool, when known.
    pub tool_id: Option<Uuid>,
    /// Matched policy, when any.
    pub policy_id: Option<Uuid>,
    /// Credential involved, when any.
    pub credential_id: Option<Uuid>,
    /// Event kind.
    pub event: AccessEvent,
    /// Decision attached to the event.
    pub decision: Option<DecisionOutcome>,
    /// Machine-readable reason.
    pub reason_code: ReasonCode,
    /// Remote IP of the caller.
    pub request_ip: Option<String>,
    /// Caller's user agent.
    pub user_agent: Option<String>,
    /// Scopes the caller asked for.
    pub requested_scopes: BTreeSet<String>,
    /// Scopes actually granted.
    pub granted_scopes: BTreeSet<String>,
}

// ── Request context ─────────────────────────────────────────────

/// Cooperative cancellation flag threaded through a request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// New, un-cancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call context carried through the broker pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlates every log entry produced by this call.
    pub request_id: Uuid,
    /// Remote IP of the caller, when known.
    pub remote_ip: Option<IpAddr>,
    /// Caller's user agent, when known.
    pub user_agent: Option<String>,
    /// Cooperative cancellation; checked between pipeline stages.
    pub cancel: CancelFlag,
    /// Hard deadline for the whole call.
    pub deadline: Option<DateTime<Utc>>,
}

impl RequestContext {
    /// Fresh context with a new correlation id and no caller metadata.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            remote_ip: None,
            user_agent: None,
            cancel: CancelFlag::new(),
            deadline: None,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
