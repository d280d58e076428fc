//! Broker-level rate limiting: early rejection, Retry-After, window
//! rollover, and the policy-selected identity key.

use toolbroker::broker::{AccessDecision, AccessRequestInput};
use toolbroker::types::{
    AccessEvent, PolicyConditions, PolicyRules, RateLimitKey, ReasonCode, RequestContext,
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

#[tokio::test]
async fn third_request_in_window_is_rejected_before_evaluation() {
    let env = TestEnv::with_rate_limit(2, 60).await;
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

    for _ in 0..2 {
        let decision = env
            .broker
            .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
            .await;
        assert!(matches!(decision, AccessDecision::Approved { .. }));
    }

    let decision = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    match decision {
        AccessDecision::Denied {
            reason_code,
            retry_after_secs,
        } => {
            assert_eq!(reason_code, ReasonCode::RateLimited);
            assert!(retry_after_secs.expect("retry-after") > 0);
        }
        other => panic!("expected rate-limit denial, got {other:?}"),
    }

    let logs = env.logs().await;
    // The third call logs RATE_LIMITED and never reaches the engine: only
    // two REQUEST_EVALUATED entries exist.
    assert_eq!(
        logs.iter()
            .filter(|entry| entry.event == AccessEvent::RateLimited)
            .count(),
        1
    );
    assert_eq!(
        logs.iter()
            .filter(|entry| entry.event == AccessEvent::RequestEvaluated)
            .count(),
        2
    );
}

#[tokio::test]
async fn window_rollover_admits_again() {
    let env = TestEnv::with_rate_limit(1, 60).await;
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

    let first = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    assert!(matches!(first, AccessDecision::Approved { .. }));

    let second = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    assert!(matches!(
        second,
        AccessDecision::Denied {
            reason_code: ReasonCode::RateLimited,
            ..
        }
    ));

    env.clock.advance_secs(60);
    let third = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    assert!(matches!(third, AccessDecision::Approved { .. }));
}

#[tokio::test]
async fn limits_are_per_agent() {
    let env = TestEnv::with_rate_limit(1, 60).await;
    let first = env.seed_agent("first", &[]).await;
    let second = env.seed_agent("second", &[]).await;
    let tool = env.seed_tool("search", first.agent_id, &["read"]).await;
    env.seed_policy(
        "open",
        Some(tool.tool_id),
        first.agent_id,
        &["read"],
        PolicyConditions::default(),
        PolicyRules::default(),
        1,
    )
    .await;

    assert!(matches!(
        env.broker
            .request_access(&RequestContext::new(), input(first.agent_id, tool.tool_id))
            .await,
        AccessDecision::Approved { .. }
    ));
    // A different agent has its own bucket.
    assert!(matches!(
        env.broker
            .request_access(&RequestContext::new(), input(second.agent_id, tool.tool_id))
            .await,
        AccessDecision::Approved { .. }
    ));
}

#[tokio::test]
async fn policy_can_bucket_by_agent_tool_pair() {
    let env = TestEnv::with_rate_limit(2, 60).await;
    let agent = env.seed_agent("runner", &[]).await;
    let tool = env.seed_tool("search", agent.agent_id, &["read"]).await;
    env.seed_policy(
        "per-pair",
        Some(tool.tool_id),
        agent.agent_id,
        &["read"],
        PolicyConditions::default(),
        PolicyRules {
            rate_limit_key: Some(RateLimitKey::AgentTool),
            ..PolicyRules::default()
        },
        1,
    )
    .await;

    // Call one consumes agent bucket (1/2) and pair bucket (1/2).
    let decision = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    assert!(matches!(decision, AccessDecision::Approved { .. }));

    // Call two: agent bucket (2/2) passes, pair bucket (2/2) passes.
    let decision = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    assert!(matches!(decision, AccessDecision::Approved { .. }));

    // Call three: agent bucket is already exhausted.
    let decision = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    assert!(matches!(
        decision,
        AccessDecision::Denied {
            reason_code: ReasonCode::RateLimited,
            ..
        }
    ));
}

#[tokio::test]
async fn daily_quota_is_consumed_only_on_approval() {
    let env = TestEnv::new().await;
    let agent = env.seed_agent("runner", &[]).await;
    let tool = env.seed_tool("search", agent.agent_id, &["read"]).await;
    env.seed_policy(
        "two-a-day",
        Some(tool.tool_id),
        agent.agent_id,
        &["read"],
        PolicyConditions {
            max_requests_per_day: Some(2),
            ..PolicyConditions::default()
        },
        PolicyRules::default(),
        1,
    )
    .await;

    for _ in 0..2 {
        let decision = env
            .broker
            .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
            .await;
        assert!(matches!(decision, AccessDecision::Approved { .. }));
    }

    // Quota spent: the policy stops matching.
    let decision = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    assert!(matches!(
        decision,
        AccessDecision::Denied {
            reason_code: ReasonCode::NoPolicyMatch,
            ..
        }
    ));

    // A day later the quota window has rolled.
    env.clock.advance_secs(86_400);
    let decision = env
        .broker
        .request_access(&RequestContext::new(), input(agent.agent_id, tool.tool_id))
        .await;
    assert!(matches!(decision, AccessDecision::Approved { .. }));
}
