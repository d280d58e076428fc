//! Cancellation and deadline handling: no credential survives a cancelled
//! call.

use chrono::Duration;

use toolbroker::broker::{AccessDecision, AccessRequestInput};
use toolbroker::clock::Clock as _;
use toolbroker::types::{
    AccessEvent, DecisionOutcome, PolicyConditions, PolicyRules, ReasonCode, RequestContext,
};
use uuid::Uuid;

use crate::support::{scopes, TestEnv};

fn input(agent_id: Uuid, tool_id: Uuid) -> AccessRequestInput {
    AccessRequestInput {
        agent_id,
        tool_id,
        requested_scopes: scopes(&["read"]),
        requested_lifetime_seconds: None,
        justification: None,
        idempotency_key: None,
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
async fn cancelled_context_denies_and_leaves_no_credential() {
    let env = TestEnv::new().await;
    let (agent_id, tool_id) = seeded(&env).await;

    let ctx = RequestContext::new();
    ctx.cancel.cancel();

    let decision = env
        .broker
        .request_access(&ctx, input(agent_id, tool_id))
        .await;
    match decision {
        AccessDecision::Denied { reason_code, .. } => {
            assert_eq!(reason_code, ReasonCode::Cancelled);
        }
        other => panic!("expected cancelled denial, got {other:?}"),
    }

    let logs = env.logs().await;
    let evaluated: Vec<_> = logs
        .iter()
        .filter(|entry| entry.event == AccessEvent::RequestEvaluated)
        .collect();
    assert_eq!(evaluated.len(), 1);
    assert_eq!(evaluated[0].decision, Some(DecisionOutcome::Deny));
    // No credential state survives.
    assert!(logs
        .iter()
        .all(|entry| entry.event != AccessEvent::CredentialIssued));
}

#[tokio::test]
async fn expired_deadline_fails_closed() {
    let env = TestEnv::new().await;
    let (agent_id, tool_id) = seeded(&env).await;

    let mut ctx = RequestContext::new();
    ctx.deadline = Some(env.clock.now() - Duration::seconds(1));

    let decision = env
        .broker
        .request_access(&ctx, input(agent_id, tool_id))
        .await;
    assert!(matches!(
        decision,
        AccessDecision::Denied {
            reason_code: ReasonCode::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn future_deadline_does_not_interfere() {
    let env = TestEnv::new().await;
    let (agent_id, tool_id) = seeded(&env).await;

    let mut ctx = RequestContext::new();
    ctx.deadline = Some(env.clock.now() + Duration::seconds(30));

    let decision = env
        .broker
        .request_access(&ctx, input(agent_id, tool_id))
        .await;
    assert!(matches!(decision, AccessDecision::Approved { .. }));
}
