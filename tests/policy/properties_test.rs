//! Randomized invariants: deterministic evaluation, scope intersection,
//! and the credential lifetime bound.
//!
//! Each case builds a fresh in-memory environment on a current-thread
//! runtime, so the case count is kept deliberately small.

use std::collections::BTreeSet;

use proptest::collection::btree_set;
use proptest::prelude::*;

use toolbroker::broker::{AccessDecision, AccessRequestInput};
use toolbroker::clock::Clock as _;
use toolbroker::types::{PolicyConditions, PolicyRules, RequestContext};

use crate::support::TestEnv;

const SCOPE_POOL: &[&str] = &["read", "write", "execute", "admin", "export"];

fn scope_subset() -> impl Strategy<Value = BTreeSet<String>> {
    btree_set(
        proptest::sample::select(SCOPE_POOL).prop_map(str::to_owned),
        0..=SCOPE_POOL.len(),
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// For any allowed decision: granted ⊆ requested ∩ tool ∩ policy.
    #[test]
    fn granted_scopes_are_bounded_by_all_three_sets(
        tool_scopes in scope_subset(),
        policy_scopes in scope_subset(),
        requested in scope_subset(),
    ) {
        runtime().block_on(async {
            let env = TestEnv::new().await;
            let agent = env.seed_agent("runner", &[]).await;
            let tool_refs: Vec<&str> = tool_scopes.iter().map(String::as_str).collect();
            let policy_refs: Vec<&str> = policy_scopes.iter().map(String::as_str).collect();

            // Seeding requires non-empty scope universes; empty sets are
            // covered by the denial assertion below.
            if !tool_refs.is_empty() {
                let tool = env.seed_tool("search", agent.agent_id, &tool_refs).await;
                if !policy_refs.is_empty() {
                    env.seed_policy(
                        "under-test",
                        Some(tool.tool_id),
                        agent.agent_id,
                        &policy_refs,
                        PolicyConditions::default(),
                        PolicyRules::default(),
                        1,
                    )
                    .await;
                }

                if !requested.is_empty() {
                    let decision = env
                        .broker
                        .request_access(
                            &RequestContext::new(),
                            AccessRequestInput {
                                agent_id: agent.agent_id,
                                tool_id: tool.tool_id,
                                requested_scopes: requested.clone(),
                                requested_lifetime_seconds: None,
                                justification: None,
                                idempotency_key: None,
                            },
                        )
                        .await;

                    match decision {
                        AccessDecision::Approved { credential, .. } => {
                            for scope in &credential.granted_scopes {
                                prop_assert!(requested.contains(scope));
                                prop_assert!(tool_scopes.contains(scope));
                                prop_assert!(policy_scopes.contains(scope));
                            }
                            prop_assert!(!credential.granted_scopes.is_empty());
                        }
                        AccessDecision::Denied { .. } => {
                            // Denial is correct exactly when the triple
                            // intersection is empty.
                            let intersection: BTreeSet<_> = requested
                                .iter()
                                .filter(|s| tool_scopes.contains(*s))
                                .filter(|s| policy_scopes.contains(*s))
                                .collect();
                            prop_assert!(intersection.is_empty());
                        }
                        AccessDecision::PendingApproval { .. } => {
                            prop_assert!(false, "no approval policy was seeded");
                        }
                    }
                }
            }
            Ok(())
        })?;
    }

    /// Repeated evaluation of the same inputs yields the same decision.
    #[test]
    fn evaluation_is_deterministic(
        requested in scope_subset(),
        priority in 0i64..100,
    ) {
        runtime().block_on(async {
            let env = TestEnv::new().await;
            let agent = env.seed_agent("runner", &["tool_user"]).await;
            let tool = env
                .seed_tool("search", agent.agent_id, &["read", "write", "execute"])
                .await;
            env.seed_policy(
                "under-test",
                Some(tool.tool_id),
                agent.agent_id,
                &["read", "write"],
                PolicyConditions::default(),
                PolicyRules::default(),
                priority,
            )
            .await;

            let mk_input = || AccessRequestInput {
                agent_id: agent.agent_id,
                tool_id: tool.tool_id,
                requested_scopes: requested.clone(),
                requested_lifetime_seconds: Some(900),
                justification: None,
                idempotency_key: None,
            };

            let first = env
                .broker
                .request_access(&RequestContext::new(), mk_input())
                .await;
            let second = env
                .broker
                .request_access(&RequestContext::new(), mk_input())
                .await;

            // Outcomes agree; credential ids of course differ per mint.
            match (&first, &second) {
                (
                    AccessDecision::Approved { credential: a, matched_policy_id: pa },
                    AccessDecision::Approved { credential: b, matched_policy_id: pb },
                ) => {
                    prop_assert_eq!(pa, pb);
                    prop_assert_eq!(&a.granted_scopes, &b.granted_scopes);
                }
                (
                    AccessDecision::Denied { reason_code: a, .. },
                    AccessDecision::Denied { reason_code: b, .. },
                ) => {
                    prop_assert_eq!(a, b);
                }
                other => prop_assert!(false, "outcomes diverged: {other:?}"),
            }
            Ok(())
        })?;
    }

    /// `expires_at - issued_at` never exceeds min(policy cap, global cap).
    #[test]
    fn credential_lifetime_is_bounded(
        requested_lifetime in prop::option::of(1u64..200_000),
        policy_cap in prop::option::of(1u64..200_000),
    ) {
        runtime().block_on(async {
            let env = TestEnv::new().await;
            let agent = env.seed_agent("runner", &[]).await;
            let tool = env.seed_tool("search", agent.agent_id, &["read"]).await;
            env.seed_policy(
                "under-test",
                Some(tool.tool_id),
                agent.agent_id,
                &["read"],
                PolicyConditions::default(),
                PolicyRules {
                    max_credential_lifetime_seconds: policy_cap,
                    ..PolicyRules::default()
                },
                1,
            )
            .await;

            let decision = env
                .broker
                .request_access(
                    &RequestContext::new(),
                    AccessRequestInput {
                        agent_id: agent.agent_id,
                        tool_id: tool.tool_id,
                        requested_scopes: crate::support::scopes(&["read"]),
                        requested_lifetime_seconds: requested_lifetime,
                        justification: None,
                        idempotency_key: None,
                    },
                )
                .await;

            let credential = match decision {
                AccessDecision::Approved { credential, .. } => credential,
                other => {
                    prop_assert!(false, "expected approval, got {other:?}");
                    unreachable!();
                }
            };

            let lifetime = (credential.expires_at - env.clock.now()).num_seconds();
            // TestEnv bounds: default 1800, global max 86_400.
            let mut cap = i64::try_from(requested_lifetime.unwrap_or(1800)).unwrap();
            if let Some(policy_cap) = policy_cap {
                cap = cap.min(i64::try_from(policy_cap).unwrap());
            }
            cap = cap.min(86_400);

            prop_assert!(lifetime >= 1);
            prop_assert!(lifetime <= cap.max(1));
            Ok(())
        })?;
    }
}
