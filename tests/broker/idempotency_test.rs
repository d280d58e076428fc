//! Idempotency-key replay semantics.

use toolbroker::broker::{AccessDecision, AccessRequestInput};
use toolbroker::types::{AccessEvent, PolicyConditions, PolicyRules, RequestContext};
use uuid::Uuid;

use crate::support::{scopes, TestEnv};

fn keyed_input(agent_id: Uuid, tool_id: Uuid, key: &str) -> AccessRequestInput {
    AccessRequestInput {
        agent_id,
        tool_id,
        requested_scopes: scopes(&["read"]),
        requested_lifetime_seconds: None,
        justification: None,
        idempotency_key: Some(key.to_owned()),
    }
}

async fn seeded(env: &TestEnv) -> (Uuid, Uuid) {
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
    (agent.agent_id, tool.tool_id)
}

#[tokio::test]
async fn same_key_replays_the_same_credential() {
    let env = TestEnv::new().await;
    let (agent_id, tool_id) = seeded(&env).await;

    let first = env
        .broker
        .request_access(&RequestContext::new(), keyed_input(agent_id, tool_id, "k-1"))
        .await;
    let first_credential = match &first {
        AccessDecision::Approved { credential, .. } => credential.clone(),
        other => panic!("expected approval, got {other:?}"),
    };

    env.clock.advance_secs(120);
    let second = env
        .broker
        .request_access(&RequestContext::new(), keyed_input(agent_id, tool_id, "k-1"))
        .await;
    match second {
        AccessDecision::Approved { credential, .. } => {
            assert_eq!(credential.credential_id, first_credential.credential_id);
            assert_eq!(credential.token, first_credential.token);
        }
        other => panic!("expected replayed approval, got {other:?}"),
    }

    // No second credential was minted: one issuance entry total.
    let issued = env
        .logs()
        .await
        .into_iter()
        .filter(|entry| entry.event == AccessEvent::CredentialIssued)
        .count();
    assert_eq!(issued, 1);
}

#[tokio::test]
async fn different_keys_mint_distinct_credentials() {
    let env = TestEnv::new().await;
    let (agent_id, tool_id) = seeded(&env).await;

    let first = env
        .broker
        .request_access(&RequestContext::new(), keyed_input(agent_id, tool_id, "k-1"))
        .await;
    let second = env
        .broker
        .request_access(&RequestContext::new(), keyed_input(agent_id, tool_id, "k-2"))
        .await;

    match (first, second) {
        (
            AccessDecision::Approved {
                credential: first, ..
            },
            AccessDecision::Approved {
                credential: second, ..
            },
        ) => {
            assert_ne!(first.credential_id, second.credential_id);
        }
        other => panic!("expected two approvals, got {other:?}"),
    }
}

#[tokio::test]
async fn replay_window_expires_after_ten_minutes() {
    let env = TestEnv::new().await;
    let (agent_id, tool_id) = seeded(&env).await;

    let first = env
        .broker
        .request_access(&RequestContext::new(), keyed_input(agent_id, tool_id, "k-1"))
        .await;
    let first_id = match &first {
        AccessDecision::Approved { credential, .. } => credential.credential_id,
        other => panic!("expected approval, got {other:?}"),
    };

    env.clock.advance_secs(601);
    let second = env
        .broker
        .request_access(&RequestContext::new(), keyed_input(agent_id, tool_id, "k-1"))
        .await;
    match second {
        AccessDecision::Approved { credential, .. } => {
            assert_ne!(credential.credential_id, first_id);
        }
        other => panic!("expected fresh approval, got {other:?}"),
    }
}

#[tokio::test]
async fn denials_are_replayed_too() {
    let env = TestEnv::new().await;
    let agent = env.seed_agent("runner", &[]).await;
    let tool = env.seed_tool("search", agent.agent_id, &["read"]).await;
    // No policy: every evaluation denies.

    let first = env
        .broker
        .request_access(
            &RequestContext::new(),
            keyed_input(agent.agent_id, tool.tool_id, "k-deny"),
        )
        .await;
    assert!(matches!(first, AccessDecision::Denied { .. }));

    let evaluated_before = env
        .logs()
        .await
        .into_iter()
        .filter(|entry| entry.event == AccessEvent::RequestEvaluated)
        .count();

    let second = env
        .broker
        .request_access(
            &RequestContext::new(),
            keyed_input(agent.agent_id, tool.tool_id, "k-deny"),
        )
        .await;
    assert!(matches!(second, AccessDecision::Denied { .. }));

    // The replay skipped the pipeline entirely: no new evaluation entry.
    let evaluated_after = env
        .logs()
        .await
        .into_iter()
        .filter(|entry| entry.event == AccessEvent::RequestEvaluated)
        .count();
    assert_eq!(evaluated_before, evaluated_after);
}
