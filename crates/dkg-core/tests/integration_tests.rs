//! DKG Core Integration Tests
//!
//! End-to-end runs of the coordinator and query engine against the in-memory
//! network, under tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use dkg_core::{
    Error,
    assertion::Graph,
    coordinator::{
        Coordinator, CoordinatorConfig, IdempotencyKey, OperationOptions, OperationStep,
        PublishOptions, WaitMode,
    },
    finalization::{FinalizationConfig, FinalizationState},
    gateway::memory::{Call, InMemoryNetwork},
    query::{QueryEngine, Verification},
    ual::{Address, Ual},
};
use tokio_util::sync::CancellationToken;

fn alice() -> Address {
    Address::parse("0x00000000000000000000000000000000000000a1").unwrap()
}

fn bob() -> Address {
    Address::parse("0x00000000000000000000000000000000000000b2").unwrap()
}

fn person(name: &str) -> Graph {
    Graph::NQuads(format!(
        "<urn:person:1> <http://schema.org/name> \"{}\" .\n\
         <urn:person:1> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://schema.org/Person> .",
        name
    ))
}

fn catalogue(items: usize) -> Graph {
    let lines: Vec<String> = (0..items)
        .map(|i| format!("<urn:item:{}> <http://schema.org/position> \"{}\" .", i, i))
        .collect();
    Graph::NQuads(lines.join("\n"))
}

fn coordinator(network: &InMemoryNetwork, account: Address) -> Coordinator {
    coordinator_with(network, account, CoordinatorConfig::default(), FinalizationConfig::default())
}

fn coordinator_with(
    network: &InMemoryNetwork,
    account: Address,
    config: CoordinatorConfig,
    finalization: FinalizationConfig,
) -> Coordinator {
    Coordinator::builder()
        .chain(Arc::new(network.chain(account)))
        .node(Arc::new(network.node()))
        .config(config)
        .finalization(finalization)
        .build()
        .unwrap()
}

fn query_engine(network: &InMemoryNetwork) -> QueryEngine {
    QueryEngine::new(Arc::new(network.chain(alice())), Arc::new(network.node()))
}

fn count(calls: &[Call], predicate: impl Fn(&Call) -> bool) -> usize {
    calls.iter().filter(|call| predicate(*call)).count()
}

// ========== Publish ==========

#[tokio::test(start_paused = true)]
async fn test_publish_then_resolve_verifies() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());

    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();

    let resolution = query_engine(&network).resolve(&ual).await.unwrap();
    assert_eq!(resolution.verification, Verification::Verified);
    assert_eq!(resolution.lines.len(), 2);

    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateAsset { .. })), 1);
    assert_eq!(count(&calls, |c| matches!(c, Call::SubmitAssertion { .. })), 1);
    assert_eq!(network.asset(ual.token_id()).await.unwrap().owner, alice());
}

#[tokio::test(start_paused = true)]
async fn test_short_allowance_is_raised_exactly_once_before_create() {
    let network = InMemoryNetwork::builder().fixed_bid(10).build();
    network.seed_allowance(&alice(), 5).await;
    let coordinator = coordinator(&network, alice());

    coordinator
        .publish(&catalogue(1200), PublishOptions::new())
        .await
        .unwrap();

    let calls = network.calls().await;
    let raises: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            matches!(
                c,
                Call::SetAllowance { .. } | Call::IncreaseAllowance { .. }
            )
        })
        .map(|(i, _)| i)
        .collect();
    assert_eq!(raises.len(), 1);
    assert_eq!(
        calls[raises[0]],
        Call::SetAllowance {
            account: alice(),
            amount: 10
        }
    );

    let create = calls
        .iter()
        .position(|c| matches!(c, Call::CreateAsset { token_amount: 10, .. }))
        .unwrap();
    assert!(raises[0] < create);
    assert_eq!(network.allowance_of(&alice()).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sufficient_allowance_is_left_alone() {
    let network = InMemoryNetwork::builder().fixed_bid(10).build();
    network.seed_allowance(&alice(), 50).await;
    let coordinator = coordinator(&network, alice());

    coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();

    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::SetAllowance { .. })), 0);
    assert_eq!(network.allowance_of(&alice()).await, 40);
}

#[tokio::test(start_paused = true)]
async fn test_spend_limit_below_bid_writes_nothing() {
    let network = InMemoryNetwork::builder().fixed_bid(10).build();
    let coordinator = coordinator(&network, alice());

    let result = coordinator
        .publish(&person("Alice"), PublishOptions::new().with_spend_limit(5))
        .await;

    assert!(matches!(
        result,
        Err(Error::SpendLimitExceeded {
            required: 10,
            limit: 5
        })
    ));
    assert!(!network.calls().await.iter().any(Call::is_write));
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_allowance_without_auto_raise() {
    let network = InMemoryNetwork::builder().fixed_bid(10).build();
    network.seed_allowance(&alice(), 3).await;
    let coordinator = coordinator(&network, alice());

    let result = coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new().with_auto_raise_allowance(false),
        )
        .await;

    assert!(matches!(
        result,
        Err(Error::InsufficientAllowance {
            required: 10,
            available: 3
        })
    ));
    assert!(!network.calls().await.iter().any(Call::is_write));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_graph_fails_before_any_call() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());

    let result = coordinator
        .publish(&Graph::NQuads("not a graph".to_string()), PublishOptions::new())
        .await;

    assert!(matches!(result, Err(Error::MalformedGraph(_))));
    assert!(network.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_bid_is_reported() {
    let network = InMemoryNetwork::default();
    network
        .reject_bids(Some("no nodes accept this size".to_string()))
        .await;
    let coordinator = coordinator(&network, alice());

    let result = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await;
    assert!(matches!(result, Err(Error::BidRejected(_))));
}

// ========== Idempotence and resumption ==========

#[tokio::test(start_paused = true)]
async fn test_retry_after_node_failure_resumes_node_leg_only() {
    let network = InMemoryNetwork::default();
    network.fail_next_node_submissions(1).await;
    let coordinator = coordinator(&network, alice());
    let key = IdempotencyKey::new("publish-alice");

    let first = coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new().with_idempotency_key(key.clone()),
        )
        .await;
    assert!(matches!(first, Err(Error::NodeSubmission { .. })));

    let record = coordinator.status(&key).await.unwrap();
    assert_eq!(record.step, OperationStep::ChainSubmitted);
    let recorded_ual = record.ual.clone().unwrap();

    let ual = coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new().with_idempotency_key(key.clone()),
        )
        .await
        .unwrap();
    assert_eq!(ual, recorded_ual);

    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateAsset { .. })), 1);
    assert_eq!(count(&calls, |c| matches!(c, Call::SubmitAssertion { .. })), 2);
    assert_eq!(count(&calls, |c| matches!(c, Call::SetAllowance { .. })), 1);

    let record = coordinator.status(&key).await.unwrap();
    assert!(record.is_finalized());
    assert_eq!(record.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_finalized_operation_replays_without_writes() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let options = PublishOptions::new().with_idempotency_key("once");

    let ual = coordinator
        .publish(&person("Alice"), options.clone())
        .await
        .unwrap();
    network.clear_calls().await;

    let replayed = coordinator.publish(&person("Alice"), options).await.unwrap();
    assert_eq!(replayed, ual);
    assert!(network.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_key_reuse_with_other_content_is_rejected() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());

    coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new().with_idempotency_key("shared"),
        )
        .await
        .unwrap();
    let result = coordinator
        .publish(
            &person("Bob"),
            PublishOptions::new().with_idempotency_key("shared"),
        )
        .await;

    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test(start_paused = true)]
async fn test_reverted_create_restarts_from_bid() {
    let network = InMemoryNetwork::default();
    network.seed_allowance(&alice(), 1_000).await;
    let coordinator = coordinator(&network, alice());
    let key = IdempotencyKey::new("revert-once");

    network.revert_next_tx("out of gas").await;
    let first = coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new().with_idempotency_key(key.clone()),
        )
        .await;
    assert!(matches!(first, Err(Error::OperationFailed { .. })));
    assert_eq!(network.allowance_of(&alice()).await, 1_000);

    let record = coordinator.status(&key).await.unwrap();
    assert_eq!(record.step, OperationStep::Started);
    assert!(record.chain_tx.is_none());

    let ual = coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new().with_idempotency_key(key.clone()),
        )
        .await
        .unwrap();

    let resolution = query_engine(&network).resolve(&ual).await.unwrap();
    assert!(resolution.verification.is_verified());
    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateAsset { .. })), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reverted_create_gives_back_raised_allowance() {
    let network = InMemoryNetwork::builder().fixed_bid(10).build();
    network.seed_allowance(&alice(), 5).await;
    network.revert_next_asset_write("out of gas").await;
    let coordinator = coordinator(&network, alice());

    let result = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await;

    assert!(matches!(result, Err(Error::OperationFailed { .. })));
    assert_eq!(network.allowance_of(&alice()).await, 5);
    let calls = network.calls().await;
    let raises: Vec<&Call> = calls
        .iter()
        .filter(|c| matches!(c, Call::SetAllowance { .. }))
        .collect();
    assert_eq!(
        raises,
        vec![
            &Call::SetAllowance {
                account: alice(),
                amount: 10
            },
            &Call::SetAllowance {
                account: alice(),
                amount: 5
            },
        ]
    );
}

// ========== Lost chain write responses ==========

#[tokio::test(start_paused = true)]
async fn test_lost_create_response_is_adopted_not_resent() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let key = IdempotencyKey::new("lost-create");
    let options = PublishOptions::new().with_idempotency_key(key.clone());

    network.time_out_next_write(true).await;
    let first = coordinator.publish(&person("Alice"), options.clone()).await;
    let error = first.unwrap_err();
    assert!(matches!(error, Error::Timeout { .. }));
    assert!(error.is_resumable());
    let record = coordinator.status(&key).await.unwrap();
    assert!(record.pending_write.is_some());
    assert!(record.chain_tx.is_none());

    let ual = coordinator.publish(&person("Alice"), options).await.unwrap();

    assert_eq!(ual.token_id(), 1);
    assert!(network.asset(2).await.is_none());
    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateAsset { .. })), 1);
    assert_eq!(count(&calls, |c| matches!(c, Call::SetAllowance { .. })), 1);
    assert_eq!(count(&calls, |c| matches!(c, Call::SubmitAssertion { .. })), 1);
    let resolution = query_engine(&network).resolve(&ual).await.unwrap();
    assert!(resolution.verification.is_verified());
}

#[tokio::test(start_paused = true)]
async fn test_create_that_never_reached_chain_is_sent_again() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let options = PublishOptions::new().with_idempotency_key("dropped-create");

    network.time_out_next_write(false).await;
    let first = coordinator.publish(&person("Alice"), options.clone()).await;
    assert!(matches!(first, Err(Error::Timeout { .. })));
    assert!(network.asset(1).await.is_none());

    let ual = coordinator.publish(&person("Alice"), options).await.unwrap();

    assert_eq!(ual.token_id(), 1);
    assert_eq!(network.asset(1).await.unwrap().owner, alice());
    assert!(network.asset(2).await.is_none());
    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateAsset { .. })), 2);
}

#[tokio::test(start_paused = true)]
async fn test_lost_update_response_resumes_node_leg() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();
    let options = PublishOptions::new().with_idempotency_key("lost-update");

    network.time_out_next_write(true).await;
    let first = coordinator.update(&ual, &person("Alicia"), options.clone()).await;
    assert!(matches!(first, Err(Error::Timeout { .. })));

    let handle = coordinator
        .update(&ual, &person("Alicia"), options)
        .await
        .unwrap();
    assert!(handle.is_finalized());

    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::UpdateAsset { .. })), 1);
    assert_eq!(count(&calls, |c| matches!(c, Call::SubmitAssertion { .. })), 2);
    let resolution = query_engine(&network).resolve(&ual).await.unwrap();
    assert!(resolution.verification.is_verified());
    assert!(resolution.lines.iter().any(|line| line.contains("Alicia")));
}

#[tokio::test(start_paused = true)]
async fn test_lost_transfer_response_is_not_resent() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();
    let options = OperationOptions::new().with_idempotency_key("lost-transfer");

    network.time_out_next_write(true).await;
    let first = coordinator.transfer(&ual, &bob(), options.clone()).await;
    assert!(matches!(first, Err(Error::Timeout { .. })));

    let handle = coordinator.transfer(&ual, &bob(), options).await.unwrap();
    assert!(handle.is_finalized());
    assert_eq!(network.asset(ual.token_id()).await.unwrap().owner, bob());
    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::TransferAsset { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswerable_lookup_reports_unknown_outcome() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let options = PublishOptions::new().with_idempotency_key("in-doubt");

    network.time_out_next_write(true).await;
    let first = coordinator.publish(&person("Alice"), options.clone()).await;
    assert!(matches!(first, Err(Error::Timeout { .. })));

    network.fail_next_reads(3).await;
    let second = coordinator
        .publish(&person("Alice"), options.clone())
        .await
        .unwrap_err();
    assert!(matches!(second, Error::OutcomeUnknown { .. }));
    assert!(!second.is_resumable());

    let ual = coordinator.publish(&person("Alice"), options).await.unwrap();
    assert_eq!(ual.token_id(), 1);
    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateAsset { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_attempt_on_busy_key_is_in_progress() {
    let network = InMemoryNetwork::builder()
        .latency(Duration::from_secs(1))
        .build();
    let config = CoordinatorConfig {
        lock_timeout: Duration::from_millis(100),
        ..CoordinatorConfig::default()
    };
    let coordinator = coordinator_with(&network, alice(), config, FinalizationConfig::default());
    let key = IdempotencyKey::new("busy");

    let running = {
        let coordinator = coordinator.clone();
        let key = key.clone();
        tokio::spawn(async move {
            coordinator
                .publish(
                    &person("Alice"),
                    PublishOptions::new().with_idempotency_key(key),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new().with_idempotency_key(key.clone()),
        )
        .await;
    assert!(matches!(second, Err(Error::OperationInProgress(k)) if k == key));

    assert!(running.await.unwrap().is_ok());
}

// ========== Waiting and cancellation ==========

#[tokio::test(start_paused = true)]
async fn test_submitted_mode_then_wait() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let key = IdempotencyKey::new("later");

    let ual = coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new()
                .with_idempotency_key(key.clone())
                .with_wait(WaitMode::Submitted),
        )
        .await
        .unwrap();

    let record = coordinator.status(&key).await.unwrap();
    assert_eq!(record.state, Some(FinalizationState::Submitted));
    assert!(!record.is_finalized());

    let handle = coordinator.wait(&key).await.unwrap();
    assert!(handle.is_finalized());
    assert_eq!(handle.ual(), &ual);
}

#[tokio::test(start_paused = true)]
async fn test_wait_on_unknown_key_is_not_found() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());

    let result = coordinator.wait(&IdempotencyKey::new("never")).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_chain_write_has_no_effect() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let token = CancellationToken::new();
    token.cancel();

    let result = coordinator
        .publish(&person("Alice"), PublishOptions::new().with_cancel(token))
        .await;

    assert!(matches!(result, Err(Error::Cancelled { .. })));
    assert!(!network.calls().await.iter().any(Call::is_write));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_replication_times_out_but_content_verifies() {
    let network = InMemoryNetwork::default();
    network.stall_replication(true).await;
    let finalization = FinalizationConfig {
        deadline: Duration::from_secs(60),
        ..FinalizationConfig::default()
    };
    let coordinator =
        coordinator_with(&network, alice(), CoordinatorConfig::default(), finalization);
    let key = IdempotencyKey::new("slow");

    let result = coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new().with_idempotency_key(key.clone()),
        )
        .await;

    let ual = match result {
        Err(Error::Timeout {
            stage,
            key: Some(timed_out),
            ual: Some(ual),
        }) => {
            assert_eq!(stage, "finalization");
            assert_eq!(timed_out, key);
            Ual::parse(&ual).unwrap()
        }
        other => panic!("expected a finalization timeout, got {:?}", other),
    };

    let record = coordinator.status(&key).await.unwrap();
    assert_eq!(record.state, Some(FinalizationState::TimedOut));
    assert_eq!(record.step, OperationStep::NodeSubmitted);

    let resolution = query_engine(&network).resolve(&ual).await.unwrap();
    assert_eq!(resolution.verification, Verification::Verified);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_chain_write_abandons_and_keeps_asset() {
    let network = InMemoryNetwork::default();
    network.stall_replication(true).await;
    let coordinator = coordinator(&network, alice());
    let key = IdempotencyKey::new("walk-away");
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let result = coordinator
        .publish(
            &person("Alice"),
            PublishOptions::new()
                .with_idempotency_key(key.clone())
                .with_cancel(token),
        )
        .await;

    assert!(matches!(
        result,
        Err(Error::Abandoned {
            step: OperationStep::NodeSubmitted,
            ..
        })
    ));
    let record = coordinator.status(&key).await.unwrap();
    let ual = record.ual.unwrap();
    assert!(record.chain_tx.is_some());
    assert_eq!(network.asset(ual.token_id()).await.unwrap().owner, alice());
    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateAsset { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_node_refusing_submission_fails_the_operation() {
    let network = InMemoryNetwork::default();
    network.refuse_next_submission("payload too large").await;
    let coordinator = coordinator(&network, alice());

    let error = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap_err();

    match &error {
        Error::OperationFailed { step, reason, .. } => {
            assert_eq!(*step, OperationStep::ChainSubmitted);
            assert_eq!(reason, "payload too large");
        }
        other => panic!("expected an operation failure, got {:?}", other),
    }
    assert!(!error.is_resumable());
    assert!(error.suggestion().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_node_rejection_during_finalization_keeps_chain_write() {
    let network = InMemoryNetwork::default();
    network.reject_next_submission("schema violation").await;
    let coordinator = coordinator(&network, alice());
    let key = IdempotencyKey::new("rejected-content");
    let options = PublishOptions::new().with_idempotency_key(key.clone());

    let first = coordinator.publish(&person("Alice"), options.clone()).await;
    assert!(matches!(first, Err(Error::OperationFailed { .. })));
    let record = coordinator.status(&key).await.unwrap();
    assert_eq!(record.step, OperationStep::ChainSubmitted);
    assert!(record.chain_tx.is_some());
    assert!(record.node_receipt.is_none());

    let ual = coordinator.publish(&person("Alice"), options).await.unwrap();

    assert_eq!(Some(ual), record.ual);
    let calls = network.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateAsset { .. })), 1);
    assert_eq!(count(&calls, |c| matches!(c, Call::SubmitAssertion { .. })), 2);
    assert!(coordinator.status(&key).await.unwrap().is_finalized());
}

// ========== Update ==========

#[tokio::test(start_paused = true)]
async fn test_update_replaces_content() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();

    let handle = coordinator
        .update(&ual, &person("Alicia"), PublishOptions::new())
        .await
        .unwrap();
    assert!(handle.is_finalized());
    assert_eq!(handle.ual(), &ual);

    let resolution = query_engine(&network).resolve(&ual).await.unwrap();
    assert!(resolution.verification.is_verified());
    assert!(resolution.lines.iter().any(|line| line.contains("Alicia")));
    assert_eq!(network.asset(ual.token_id()).await.unwrap().history.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_update_with_same_content_is_rejected() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();

    let result = coordinator
        .update(&ual, &person("Alice"), PublishOptions::new())
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test(start_paused = true)]
async fn test_update_by_non_owner_writes_nothing() {
    let network = InMemoryNetwork::default();
    let ual = coordinator(&network, alice())
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();
    network.clear_calls().await;

    let result = coordinator(&network, bob())
        .update(&ual, &person("Mallory"), PublishOptions::new())
        .await;

    match result {
        Err(Error::Unauthorized {
            token_id,
            owner,
            caller,
        }) => {
            assert_eq!(token_id, ual.token_id());
            assert_eq!(owner, alice().to_string());
            assert_eq!(caller, bob().to_string());
        }
        other => panic!("expected Unauthorized, got {:?}", other),
    }
    assert!(!network.calls().await.iter().any(Call::is_write));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_updates_one_wins() {
    let network = InMemoryNetwork::builder()
        .latency(Duration::from_millis(10))
        .build();
    network.seed_allowance(&alice(), 1_000_000).await;
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();

    let alicia = person("Alicia");
    let ally = person("Ally");
    let (first, second) = tokio::join!(
        coordinator.update(&ual, &alicia, PublishOptions::new()),
        coordinator.update(&ual, &ally, PublishOptions::new())
    );

    let outcomes = [first, second];
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(Error::ConcurrentUpdate { .. })))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(network.asset(ual.token_id()).await.unwrap().history.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_update_rejects_foreign_ual() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let foreign = Ual::parse("did:dkg:base:84532/0x5cac41237127f94c2d21dae0b14bfefa99880630/1").unwrap();

    let result = coordinator
        .update(&foreign, &person("Alice"), PublishOptions::new())
        .await;
    assert!(matches!(result, Err(Error::InvalidUal { .. })));
}

// ========== Chain-only operations ==========

#[tokio::test(start_paused = true)]
async fn test_transfer_then_burn() {
    let network = InMemoryNetwork::default();
    let ual = coordinator(&network, alice())
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();

    let handle = coordinator(&network, alice())
        .transfer(&ual, &bob(), OperationOptions::new())
        .await
        .unwrap();
    assert!(handle.is_finalized());
    assert_eq!(network.asset(ual.token_id()).await.unwrap().owner, bob());

    let not_owner = coordinator(&network, alice())
        .burn(&ual, OperationOptions::new())
        .await;
    assert!(matches!(not_owner, Err(Error::Unauthorized { .. })));

    coordinator(&network, bob())
        .burn(&ual, OperationOptions::new())
        .await
        .unwrap();
    assert!(network.asset(ual.token_id()).await.is_none());

    let resolution = query_engine(&network).resolve(&ual).await.unwrap();
    assert_eq!(resolution.verification, Verification::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_transfer_to_zero_address_is_rejected() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();

    let result = coordinator
        .transfer(&ual, &Address::zero(), OperationOptions::new())
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test(start_paused = true)]
async fn test_add_tokens_with_explicit_amount() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();
    let before = network.asset(ual.token_id()).await.unwrap().token_balance;

    coordinator
        .add_tokens(&ual, Some(5), OperationOptions::new())
        .await
        .unwrap();

    let after = network.asset(ual.token_id()).await.unwrap().token_balance;
    assert_eq!(after, before + 5);

    let zero = coordinator
        .add_tokens(&ual, Some(0), OperationOptions::new())
        .await;
    assert!(matches!(zero, Err(Error::InvalidTokenAmount(_))));
}

#[tokio::test(start_paused = true)]
async fn test_add_tokens_suggests_missing_amount() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());

    // Two epochs of a sub-KiB assertion cost 2; paying 1 leaves 1 missing
    let underpaid = coordinator
        .publish(&person("Alice"), PublishOptions::new().with_token_amount(1))
        .await
        .unwrap();
    coordinator
        .add_tokens(&underpaid, None, OperationOptions::new())
        .await
        .unwrap();
    let calls = network.calls().await;
    assert!(calls.contains(&Call::AddTokens {
        account: alice(),
        token_id: underpaid.token_id(),
        amount: 1
    }));

    let paid = coordinator
        .publish(&person("Bob"), PublishOptions::new())
        .await
        .unwrap();
    let result = coordinator
        .add_tokens(&paid, None, OperationOptions::new())
        .await;
    assert!(matches!(result, Err(Error::InvalidTokenAmount(_))));
}

#[tokio::test(start_paused = true)]
async fn test_add_tokens_after_storage_ended_needs_extension() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new().with_epochs(2))
        .await
        .unwrap();
    network.advance_epoch(5).await;
    network.clear_calls().await;

    let result = coordinator
        .add_tokens(&ual, None, OperationOptions::new())
        .await;

    match result {
        Err(Error::InvalidTokenAmount(reason)) => assert!(reason.contains("ended")),
        other => panic!("expected an invalid token amount, got {:?}", other),
    }
    assert!(!network.calls().await.iter().any(Call::is_write));
}

#[tokio::test(start_paused = true)]
async fn test_extend_storage_period_estimates_payment() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();
    let before = network.asset(ual.token_id()).await.unwrap();

    let handle = coordinator
        .extend_storage_period(&ual, 3, None, OperationOptions::new())
        .await
        .unwrap();
    assert!(handle.is_finalized());

    let after = network.asset(ual.token_id()).await.unwrap();
    assert_eq!(after.end_epoch, before.end_epoch + 3);
    assert_eq!(after.token_balance, before.token_balance + 3);

    let invalid = coordinator
        .extend_storage_period(&ual, 0, None, OperationOptions::new())
        .await;
    assert!(matches!(invalid, Err(Error::InvalidInput(_))));
}

#[tokio::test(start_paused = true)]
async fn test_chain_only_spend_limit() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();
    network.clear_calls().await;

    let result = coordinator
        .add_tokens(&ual, Some(100), OperationOptions::new().with_spend_limit(10))
        .await;
    assert!(matches!(result, Err(Error::SpendLimitExceeded { .. })));
    assert!(!network.calls().await.iter().any(Call::is_write));
}

// ========== Allowance API ==========

#[tokio::test(start_paused = true)]
async fn test_allowance_management() {
    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());

    coordinator.set_allowance(100).await.unwrap();
    assert_eq!(coordinator.get_allowance().await.unwrap(), 100);

    coordinator.set_allowance(40).await.unwrap();
    assert_eq!(coordinator.get_allowance().await.unwrap(), 40);

    assert!(coordinator.set_allowance(40).await.unwrap().is_none());

    coordinator.decrease_allowance(1_000).await.unwrap();
    assert_eq!(coordinator.get_allowance().await.unwrap(), 0);

    coordinator.increase_allowance(7).await.unwrap();
    assert_eq!(network.allowance_of(&alice()).await, 7);
}

// ========== Query ==========

#[tokio::test(start_paused = true)]
async fn test_tampered_node_is_detected() {
    let network = InMemoryNetwork::default();
    let ual = coordinator(&network, alice())
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();
    network
        .tamper_content(
            ual.token_id(),
            vec!["<urn:person:1> <http://schema.org/name> \"Eve\" .".to_string()],
        )
        .await;

    let result = query_engine(&network).resolve_verified(&ual).await;
    assert!(matches!(result, Err(Error::DigestMismatch { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_query_finds_published_assets() {
    use futures_util::StreamExt;

    let network = InMemoryNetwork::default();
    let coordinator = coordinator(&network, alice());
    let alice_ual = coordinator
        .publish(&person("Alice"), PublishOptions::new())
        .await
        .unwrap();
    coordinator
        .publish(&person("Bob"), PublishOptions::new())
        .await
        .unwrap();

    let hits: Vec<Ual> = query_engine(&network)
        .query("\"Alice\"")
        .filter_map(|hit| async move { hit.ok() })
        .collect()
        .await;
    assert_eq!(hits, vec![alice_ual]);
}
