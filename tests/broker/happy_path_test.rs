//! Approved-path scenarios: issuance, scope narrowing, lifetime clamping,
//! and log completeness.

use chrono::Duration;

use toolbroker::broker::{AccessDecision, AccessRequestInput};
use toolbroker::clock::Clock as _;
use toolbroker::types::{
    AccessEvent, DecisionOutcome, PolicyConditions, PolicyRules, RequestContext,
};

use crate::support::{scopes, TestEnv};

fn input(env_agent: uuid::Uuid, env_tool: uuid::Uuid, wanted: &[&str]) -> AccessRequestInput {
    AccessRequestInput {
        agent_id: env_agent,
        tool_id: env_tool,
        requested_scopes: scopes(wanted),
        requested_lifetime_seconds: None,
        justification: None,
        idempotency_key: None,
    }
}

#[tokio::test]
async fn role_gated_policy_grants_and_clamps_lifetime() {
    let env = TestEnv::new().await;
    let agent = env.seed_agent("runner", &["tool_user"]).await;
    let tool = env
        .seed_tool("search", agent.agent_id, &["read", "write"])
        .await;
    env.seed_policy(
        "tool-users",
        Some(tool.tool_id),
        agent.agent_id,
        &["read", "write"],
        PolicyConditions {
            required_roles: Some(scopes(&["tool_user"])),
            ..PolicyConditions::default()
        },
        PolicyRules {
            max_credential_lifetime_seconds: Some(3600),
            ..PolicyRules::default()
        },
        10,
    )
    .await;

    let mut request = input(agent.agent_id, tool.tool_id, &["read"]);
    request.requested_lifetime_seconds = Some(7200);

    let decision = env
        .broker
        .request_access(&RequestContext::new(), request)
        .await;

    let credential = match decision {
        AccessDecision::Approved { credential, .. } => credential,
        other => panic!("expected approval, got {other:?}"),
    };
    assert_eq!(credential.granted_scopes, scopes(&["read"]));
    // Requested 7200s, policy caps at 3600s.
    assert_eq!(
        credential.expires_at - env.clock.now(),
        Duration::seconds(3600)
    );

    // Exactly one CREDENTIAL_ISSUED entry exists.
    let logs = env.logs().await;
    let issued: Vec<_> = logs
        .iter()
        .filter(|entry| entry.event == AccessEvent::CredentialIssued)
        .collect();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].credential_id, Some(credential.credential_id));
}

#[tokio::test]
async fn requested_scopes_narrow_to_policy_grant() {
    let env = TestEnv::new().await;
    let agent = env.seed_agent("runner", &[]).await;
    let tool = env
        .seed_tool("search", agent.agent_id, &["read", "write"])
        .await;
    // Policy can only grant "read".
    env.seed_policy(
        "read-only",
        Some(tool.tool_id),
        agent.agent_id,
        &["read"],
        PolicyConditions::default(),
        PolicyRules::default(),
        1,
    )
    .await;

    let decision = env
        .broker
        .request_access(
            &RequestContext::new(),
            input(agent.agent_id, tool.tool_id, &["read", "write"]),
        )
        .await;

    match decision {
        AccessDecision::Approved { credential, .. } => {
            assert_eq!(credential.granted_scopes, scopes(&["read"]));
        }
        other => panic!("expected approval, got {other:?}"),
    }
}

#[tokio::test]
async fn every_call_produces_exactly_one_evaluated_entry() {
    let env = TestEnv::new().await;
    let agent = env.seed_agent("runner", &[]).await;
    let tool = env.seed_tool("search", agent.agent_id, &["read"]).await;
    env.seed_policy(
        "open",
        Some(tool.tool_id),
        agent.agent_id,
        &["read"],
        PolicyConditions::default(),
        PolicyRules::default(),
        1,
    )
    .await;

    let ctx = RequestContext::new();
    let decision = env
        .broker
        .request_access(&ctx, input(agent.agent_id, tool.tool_id, &["read"]))
        .await;
    assert!(matches!(decision, AccessDecision::Approved { .. }));

    let logs = env.logs().await;
    let evaluated: Vec<_> = logs
        .iter()
        .filter(|entry| entry.event == AccessEvent::RequestEvaluated)
        .collect();
    assert_eq!(evaluated.len(), 1);
    assert_eq!(evaluated[0].decision, Some(DecisionOutcome::Allow));

    // The issuance entry correlates through the same request id.
    let issued = logs
        .iter()
        .find(|entry| entry.event == AccessEvent::CredentialIssued)
        .expect("issuance entry");
    assert_eq!(issued.request_id, evaluated[0].request_id);
    assert_eq!(issued.request_id, Some(ctx.request_id));
}

#[tokio::test]
async fn issued_bearer_validates_against_the_vendor() {
    let env = TestEnv::new().await;
    let agent = env.seed_agent("runner", &[]).await;
    let tool = env.seed_tool("search", agent.agent_id, &["read"]).await;
    env.seed_policy(
        "open",
        Some(tool.tool_id),
        agent.agent_id,
        &["read"],
        PolicyConditions::default(),
        PolicyRules::default(),
        1,
    )
    .await;

    let decision = env
        .broker
        .request_access(
            &RequestContext::new(),
            input(agent.agent_id, tool.tool_id, &["read"]),
        )
        .await;
    let credential = match decision {
        AccessDecision::Approved { credential, .. } => credential,
        other => panic!("expected approval, got {other:?}"),
    };

    let outcome = env
        .vendor
        .validate(&RequestContext::new(), &credential.token, Some("read"))
        .await;
    assert!(outcome.valid);
    assert_eq!(outcome.agent_id, Some(agent.agent_id));
    assert_eq!(outcome.tool_id, Some(tool.tool_id));
}

#[tokio::test]
async fn global_policy_covers_new_tools() {
    let env = TestEnv::new().await;
    let agent = env.seed_agent("runner", &["tool_user"]).await;
    env.seed_policy(
        "org-wide-read",
        None,
        agent.agent_id,
        &["read"],
        PolicyConditions {
            any_roles: Some(scopes(&["tool_user", "admin"])),
            ..PolicyConditions::default()
        },
        PolicyRules::default(),
        0,
    )
    .await;

    let tool = env.seed_tool("brand-new", agent.agent_id, &["read"]).await;
    let decision = env
        .broker
        .request_access(
            &RequestContext::new(),
            input(agent.agent_id, tool.tool_id, &["read"]),
        )
        .await;
    assert!(matches!(decision, AccessDecision::Approved { .. }));
}
