//! Audit logging for access decisions and credential lifecycle events.
//!
//! Everything funnels through [`AuditLogger::log_event`], which stamps ids
//! and timestamps, validates the fields each event kind requires, and
//! appends through the store. For co-committed writes, [`AuditLogger::prepare`]
//! returns a validated entry the store transaction appends itself. A failed
//! append fails the enclosing decision closed; persistence errors are
//! never swallowed.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::{Store, StoreError};
use crate::types::{
    AccessEvent, AccessLogEntry, DecisionOutcome, ReasonCode, RequestContext,
};

/// Audit failures.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The entry is missing a field its event kind requires.
    #[error("audit entry for {event:?} is missing {field}")]
    MissingField {
        /// Event kind being logged.
        event: AccessEvent,
        /// Name of the absent field.
        field: &'static str,
    },
    /// The append itself failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fields of a log entry before the logger stamps id and timestamp.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    /// Correlates all entries of one broker call.
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
    /// Scopes the caller asked for.
    pub requested_scopes: BTreeSet<String>,
    /// Scopes granted.
    pub granted_scopes: BTreeSet<String>,
}

impl NewLogEntry {
    /// Entry skeleton carrying the call context.
    pub fn for_event(event: AccessEvent, reason_code: ReasonCode) -> Self {
        Self {
            request_id: None,
            agent_id: None,
            tool_id: None,
            policy_id: None,
            credential_id: None,
            event,
            decision: None,
            reason_code,
            requested_scopes: BTreeSet::new(),
            granted_scopes: BTreeSet::new(),
        }
    }
}

/// Records every access decision and credential lifecycle event.
pub struct AuditLogger {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl AuditLogger {
    /// Create a logger over the given store and clock.
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate and stamp an entry without persisting it. Used when the
    /// caller appends inside its own store transaction.
    pub fn prepare(
        &self,
        ctx: &RequestContext,
        entry: NewLogEntry,
    ) -> Result<AccessLogEntry, AuditError> {
        validate(&entry)?;
        Ok(AccessLogEntry {
            log_id: Uuid::new_v4(),
            timestamp: self.clock.now(),
            request_id: entry.request_id.or(Some(ctx.request_id)),
            agent_id: entry.agent_id,
            tool_id: entry.tool_id,
            policy_id: entry.policy_id,
            credential_id: entry.credential_id,
            event: entry.event,
            decision: entry.decision,
            reason_code: entry.reason_code,
            request_ip: ctx.remote_ip.map(|ip| ip.to_string()),
            user_agent: ctx.user_agent.clone(),
            requested_scopes: entry.requested_scopes,
            granted_scopes: entry.granted_scopes,
        })
    }

    /// Validate, stamp, and persist an entry in its own append.
    pub async fn log_event(
        &self,
        ctx: &RequestContext,
        entry: NewLogEntry,
    ) -> Result<AccessLogEntry, AuditError> {
        let entry = self.prepare(ctx, entry)?;
        self.store.append_access_log(&entry).await?;
        Ok(entry)
    }
}

fn validate(entry: &NewLogEntry) -> Result<(), AuditError> {
    match entry.event {
        AccessEvent::RequestEvaluated | AccessEvent::RateLimited => {
            if entry.decision.is_none() {
                return Err(AuditError::MissingField {
                    event: entry.event,
                    field: "decision",
                });
            }
        }
        AccessEvent::CredentialIssued
        | AccessEvent::CredentialValidated
        | AccessEvent::CredentialRevoked => {
            if entry.credential_id.is_none() {
                return Err(AuditError::MissingField {
                    event: entry.event,
                    field: "credential_id",
                });
            }
        }
    }
    Ok(())
}
