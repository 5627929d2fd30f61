mod support;

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_core::CoordError;
use vigil_core::config::PresenceConfig;
use vigil_core::presence::{
    MonitorRequest, OperatorFilter, OperatorKey, OperatorPresence, OperatorState,
    OperatorType, PostgresOperatorPresence,
};

use support::WAIT;

const LONG: Duration = Duration::from_secs(60);

fn backend(name: &str) -> OperatorKey {
    OperatorKey::new("default", OperatorType::Backend, name)
}

fn agent(name: &str) -> OperatorKey {
    OperatorKey::new("default", OperatorType::Agent, name)
}

fn presence(pool: &PgPool) -> PostgresOperatorPresence {
    PostgresOperatorPresence::new(pool.clone(), PresenceConfig::default())
}

fn agents_of(controller: &str, micromanage: bool) -> MonitorRequest {
    MonitorRequest {
        op_type: OperatorType::Agent,
        controller_type: OperatorType::Backend,
        controller_name: controller.to_string(),
        controller_namespace: "default".to_string(),
        every: Duration::from_millis(50),
        micromanage,
        error_handler: None,
    }
}

/// Skip empty batches until one arrives with operators in it.
async fn next_nonempty(batches: &mut mpsc::Receiver<Vec<OperatorState>>) -> Vec<OperatorState> {
    tokio::time::timeout(WAIT, async {
        loop {
            let batch = batches.recv().await.expect("monitor stream open");
            if !batch.is_empty() {
                return batch;
            }
        }
    })
    .await
    .expect("non-empty batch")
}

async fn next_batch(batches: &mut mpsc::Receiver<Vec<OperatorState>>) -> Vec<OperatorState> {
    tokio::time::timeout(WAIT, batches.recv())
        .await
        .expect("batch within timeout")
        .expect("monitor stream open")
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn check_in_round_trips_with_controller(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    presence
        .check_in(&OperatorState::new(backend("backend-a"), LONG))
        .await?;

    let state = OperatorState::new(agent("agent-1"), Duration::from_secs(45))
        .with_controller(backend("backend-a"))
        .with_metadata(json!({ "version": "6.12.0", "subscriptions": ["linux"] }));
    presence.check_in(&state).await?;

    let stored = presence.query_operator(&agent("agent-1")).await?;
    assert_eq!(stored.key, state.key);
    assert_eq!(stored.controller, Some(backend("backend-a")));
    assert!(stored.present);
    assert_eq!(stored.check_in_timeout, Duration::from_secs(45));
    assert_eq!(stored.metadata, state.metadata);
    assert!(stored.last_update.is_some());

    let controller = presence.query_operator(&backend("backend-a")).await?;
    assert_eq!(controller.controller, None);
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn check_out_removes_operator(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    assert!(matches!(
        presence.check_out(&agent("ghost")).await,
        Err(CoordError::NotFound(_))
    ));

    presence
        .check_in(&OperatorState::new(agent("agent-1"), LONG))
        .await?;
    presence.check_out(&agent("agent-1")).await?;
    assert!(matches!(
        presence.query_operator(&agent("agent-1")).await,
        Err(CoordError::NotFound(_))
    ));
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn unknown_controller_is_not_found(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    let state = OperatorState::new(agent("agent-1"), LONG).with_controller(backend("missing"));
    assert!(matches!(
        presence.check_in(&state).await,
        Err(CoordError::NotFound(_))
    ));
    assert!(presence.query_operator(&agent("agent-1")).await.is_err());
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn silent_controller_is_replaced(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    presence
        .check_in(&OperatorState::new(backend("backend-a"), Duration::from_millis(200)))
        .await?;
    presence
        .check_in(&OperatorState::new(backend("backend-b"), LONG))
        .await?;
    presence
        .check_in(&OperatorState::new(backend("backend-c"), LONG))
        .await?;
    presence
        .check_in(&OperatorState::new(agent("agent-1"), LONG).with_controller(backend("backend-a")))
        .await?;

    tokio::time::sleep(Duration::from_millis(400)).await;

    let scope = CancellationToken::new();
    let mut batches = presence
        .monitor_operators(&scope, agents_of("backend-b", false))
        .await?;
    let batch = next_nonempty(&mut batches).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].key, agent("agent-1"));
    assert_eq!(batch[0].controller, Some(backend("backend-b")));

    let stored = presence.query_operator(&agent("agent-1")).await?;
    assert_eq!(stored.controller, Some(backend("backend-b")));

    scope.cancel();
    presence.close().await;
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn operators_without_controller_are_adopted(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    presence
        .check_in(&OperatorState::new(backend("backend-a"), LONG))
        .await?;
    presence
        .check_in(&OperatorState::new(agent("agent-1"), LONG))
        .await?;

    let scope = CancellationToken::new();
    let mut batches = presence
        .monitor_operators(&scope, agents_of("backend-a", false))
        .await?;
    let batch = next_nonempty(&mut batches).await;
    assert_eq!(batch[0].controller, Some(backend("backend-a")));

    scope.cancel();
    presence.close().await;
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn adoption_stays_within_namespace(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    let acme_backend = OperatorKey::new("acme", OperatorType::Backend, "backend-a");
    let acme_agent = OperatorKey::new("acme", OperatorType::Agent, "agent-1");
    presence
        .check_in(&OperatorState::new(acme_backend.clone(), LONG))
        .await?;
    presence
        .check_in(&OperatorState::new(backend("backend-z"), LONG))
        .await?;
    presence
        .check_in(&OperatorState::new(acme_agent.clone(), LONG))
        .await?;

    let scope = CancellationToken::new();
    let mut foreign = presence
        .monitor_operators(&scope, agents_of("backend-z", false))
        .await?;
    for _ in 0..5 {
        assert!(next_batch(&mut foreign).await.is_empty());
    }
    assert_eq!(presence.query_operator(&acme_agent).await?.controller, None);

    let mut local = presence
        .monitor_operators(
            &scope,
            MonitorRequest {
                controller_namespace: "acme".to_string(),
                ..agents_of("backend-a", false)
            },
        )
        .await?;
    let batch = next_nonempty(&mut local).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].key, acme_agent);
    assert_eq!(batch[0].controller, Some(acme_backend));

    scope.cancel();
    presence.close().await;
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn changes_are_delivered_once(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    presence
        .check_in(&OperatorState::new(backend("backend-a"), LONG))
        .await?;
    let agent_state =
        OperatorState::new(agent("agent-1"), LONG).with_controller(backend("backend-a"));
    presence.check_in(&agent_state).await?;

    let scope = CancellationToken::new();
    let mut batches = presence
        .monitor_operators(&scope, agents_of("backend-a", false))
        .await?;

    let first = next_batch(&mut batches).await;
    assert_eq!(first.len(), 1);
    assert!(next_batch(&mut batches).await.is_empty());

    // An unchanged check-in is not a change.
    presence.check_in(&agent_state).await?;
    assert!(next_batch(&mut batches).await.is_empty());

    let mut gone = agent_state.clone();
    gone.present = false;
    presence.check_in(&gone).await?;
    let batch = next_nonempty(&mut batches).await;
    assert_eq!(batch.len(), 1);
    assert!(!batch[0].present);

    scope.cancel();
    presence.close().await;
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn micromanaged_monitor_resends_membership(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    presence
        .check_in(&OperatorState::new(backend("backend-a"), LONG))
        .await?;
    for name in ["agent-2", "agent-1"] {
        presence
            .check_in(&OperatorState::new(agent(name), LONG).with_controller(backend("backend-a")))
            .await?;
    }

    let scope = CancellationToken::new();
    let mut batches = presence
        .monitor_operators(&scope, agents_of("backend-a", true))
        .await?;
    for _ in 0..3 {
        let batch = next_batch(&mut batches).await;
        let names: Vec<&str> = batch.iter().map(|op| op.key.name.as_str()).collect();
        assert_eq!(names, vec!["agent-1", "agent-2"]);
    }

    scope.cancel();
    presence.close().await;
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn timed_out_operators_are_reported_absent(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    presence
        .check_in(&OperatorState::new(backend("backend-a"), LONG))
        .await?;
    presence
        .check_in(
            &OperatorState::new(agent("agent-1"), Duration::from_millis(300))
                .with_controller(backend("backend-a")),
        )
        .await?;

    let scope = CancellationToken::new();
    let mut batches = presence
        .monitor_operators(&scope, agents_of("backend-a", false))
        .await?;
    assert!(next_nonempty(&mut batches).await[0].present);

    let batch = next_nonempty(&mut batches).await;
    assert_eq!(batch[0].key, agent("agent-1"));
    assert!(!batch[0].present);
    assert!(!presence.query_operator(&agent("agent-1")).await?.present);

    scope.cancel();
    presence.close().await;
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn monitor_for_unknown_controller_emits_empty_batches(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    let scope = CancellationToken::new();
    let mut batches = presence
        .monitor_operators(&scope, agents_of("backend-z", false))
        .await?;
    assert!(next_batch(&mut batches).await.is_empty());

    scope.cancel();
    presence.close().await;
    // Buffered batches drain, then the stream ends.
    while let Some(batch) = batches.recv().await {
        assert!(batch.is_empty());
    }
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn list_operators_filters_and_sorts(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    presence
        .check_in(&OperatorState::new(backend("backend-a"), LONG))
        .await?;
    for key in [
        agent("agent-2"),
        agent("agent-1"),
        OperatorKey::new("acme", OperatorType::Agent, "agent-9"),
    ] {
        presence.check_in(&OperatorState::new(key, LONG)).await?;
    }

    let all = presence.list_operators(&OperatorFilter::default()).await?;
    assert_eq!(all.len(), 4);
    assert_eq!(all[0].key.namespace, "acme");

    let agents = presence
        .list_operators(&OperatorFilter {
            namespace: Some("default".into()),
            op_type: Some(OperatorType::Agent),
        })
        .await?;
    let names: Vec<&str> = agents.iter().map(|op| op.key.name.as_str()).collect();
    assert_eq!(names, vec!["agent-1", "agent-2"]);
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn invalid_check_in_is_rejected(pool: PgPool) -> Result<()> {
    let presence = presence(&pool);
    let state = OperatorState::new(agent("agent-1"), Duration::ZERO);
    assert!(matches!(
        presence.check_in(&state).await,
        Err(CoordError::NotValid(_))
    ));
    Ok(())
}
