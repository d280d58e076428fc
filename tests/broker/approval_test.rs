//! Human-in-the-loop approval flow: parking, resolution, expiry.

use toolbroker::broker::{AccessDecision, AccessRequestInput, ResolveError};
use toolbroker::clock::Clock as _;
use toolbroker::types::{
    AccessEvent, DecisionOutcome, PolicyConditions, PolicyRules, RequestContext, RequestStatus,
    PENDING_REQUEST_TTL_DAYS,
};
use uuid::Uuid;

use crate::support::{scopes, TestEnv};

fn input(agent_id: Uuid, tool_id: Uuid) -> AccessRequestInput {
    AccessRequestInput {
        agent_id,
        tool_id,
        requested_scopes: scopes(&["write"]),
        requested_lifetime_seconds: None,
        justification: Some("nightly batch export".to_owned()),
        idempotency_key: None,
    }
}

async fn parked_request(env: &TestEnv) -> (Uuid, Uuid, Uuid) {
    let agent = env.seed_agent("runner", &[]).await;
    let tool = env
        .seed_tool("exporter", agent.agent_id, &["read", "write"])
        .await;
    env.seed_policy(
        "guarded-writes",
        Some(tool.tool_id),
        agent.agent_id,
        &["write"],
        PolicyConditions::default(),
        PolicyRules {
            require_approval: true,
            ..PolicyRules::default()
        },
        5,
    )
    .await;

    let decision = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    match decision {
        AccessDecision::PendingApproval {
            access_request_id, ..
        } => (access_request_id, agent.agent_id, tool.tool_id),
        other => panic!("expected pending approval, got {other:?}"),
    }
}

#[tokio::test]
async fn approval_policy_parks_the_request_without_minting() {
    let env = TestEnv::new().await;
    let (request_id, _, _) = parked_request(&env).await;

    let request = env
        .store
        .get_access_request(request_id, env.clock.now())
        .await
        .expect("request row");
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.justification.as_deref(), Some("nightly batch export"));

    let logs = env.logs().await;
    let evaluated: Vec<_> = logs
        .iter()
        .filter(|entry| entry.event == AccessEvent::RequestEvaluated)
        .collect();
    assert_eq!(evaluated.len(), 1);
    assert_eq!(
        evaluated[0].decision,
        Some(DecisionOutcome::PendingApproval)
    );
    assert!(logs
        .iter()
        .all(|entry| entry.event != AccessEvent::CredentialIssued));
}

#[tokio::test]
async fn approval_mints_a_credential_tied_to_the_request() {
    let env = TestEnv::new().await;
    let (request_id, agent_id, tool_id) = parked_request(&env).await;
    let resolver = env.seed_agent("operator", &["approver"]).await;

    env.clock.advance_secs(3600);
    let outcome = env
        .broker
        .resolve_request(&RequestContext::new(), request_id, true, resolver.agent_id)
        .await
        .expect("approve");

    assert_eq!(outcome.request.status, RequestStatus::Approved);
    assert_eq!(outcome.request.resolver_id, Some(resolver.agent_id));
    let credential = outcome.credential.expect("credential minted");
    assert_eq!(credential.granted_scopes, scopes(&["write"]));

    let validated = env
        .vendor
        .validate(&RequestContext::new(), &credential.token, Some("write"))
        .await;
    assert!(validated.valid);
    assert_eq!(validated.agent_id, Some(agent_id));
    assert_eq!(validated.tool_id, Some(tool_id));

    // The credential row points back at the originating request.
    let row = env
        .store
        .get_credential(credential.credential_id)
        .await
        .expect("credential row");
    assert_eq!(row.source_request_id, Some(request_id));
}

#[tokio::test]
async fn rejection_is_terminal() {
    let env = TestEnv::new().await;
    let (request_id, _, _) = parked_request(&env).await;
    let resolver = env.seed_agent("operator", &[]).await;

    let outcome = env
        .broker
        .resolve_request(&RequestContext::new(), request_id, false, resolver.agent_id)
        .await
        .expect("reject");
    assert_eq!(outcome.request.status, RequestStatus::Rejected);
    assert!(outcome.credential.is_none());

    // A second resolution attempt loses.
    let again = env
        .broker
        .resolve_request(&RequestContext::new(), request_id, true, resolver.agent_id)
        .await;
    assert!(matches!(again, Err(ResolveError::AlreadyResolved)));
}

#[tokio::test]
async fn expired_requests_cannot_be_resolved() {
    let env = TestEnv::new().await;
    let (request_id, _, _) = parked_request(&env).await;
    let resolver = env.seed_agent("operator", &[]).await;

    env.clock
        .advance_secs(PENDING_REQUEST_TTL_DAYS * 86_400 + 60);

    let result = env
        .broker
        .resolve_request(&RequestContext::new(), request_id, true, resolver.agent_id)
        .await;
    assert!(matches!(result, Err(ResolveError::Expired)));
}

#[tokio::test]
async fn resolving_a_missing_request_is_not_found() {
    let env = TestEnv::new().await;
    let resolver = env.seed_agent("operator", &[]).await;
    let result = env
        .broker
        .resolve_request(
            &RequestContext::new(),
            Uuid::new_v4(),
            true,
            resolver.agent_id,
        )
        .await;
    assert!(matches!(result, Err(ResolveError::NotFound)));
}
