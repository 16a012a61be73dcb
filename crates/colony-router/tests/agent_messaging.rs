#![allow(clippy::unwrap_used, clippy::expect_used)]

use colony_agent::{Agent, AgentConfig, EchoHandler, SwarmState};
use colony_core::{ErrorKind, MessageEnvelope, SignalBus};
use colony_router::{MessageRouter, RouterConfig};
use std::sync::Arc;

async fn swarm_of(n: usize, inbox_capacity: usize) -> Arc<SwarmState> {
    let swarm = Arc::new(SwarmState::new());
    for _ in 0..n {
        let agent = Agent::builder(swarm.allocate_id(), Arc::new(EchoHandler))
            .with_config(AgentConfig {
                inbox_capacity,
                ..AgentConfig::default()
            })
            .build();
        agent.start().await.unwrap();
        swarm.insert(agent);
    }
    swarm
}

fn config() -> RouterConfig {
    RouterConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        ..RouterConfig::default()
    }
}

#[tokio::test]
async fn messages_reach_agent_inbox_in_send_order() {
    let swarm = swarm_of(2, 100).await;
    let router = MessageRouter::new(config(), swarm.clone(), SignalBus::new());
    let sender = swarm.get("agent-0001").unwrap();

    let pending: Vec<_> = (0..10)
        .map(|i| router.send_message(sender.send_message("agent-0002", serde_json::json!(i))))
        .collect();
    let batch: Vec<_> = futures_util::future::join_all(pending).await;
    assert!(batch.iter().all(|r| r.success));

    let inbox = swarm.get("agent-0002").unwrap().take_messages();
    let order: Vec<i64> = inbox.iter().map(|m| m.content.as_i64().unwrap()).collect();
    assert_eq!(order, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn full_inbox_is_retried_then_dead_lettered() {
    let swarm = swarm_of(2, 1).await;
    let router = MessageRouter::new(config(), swarm.clone(), SignalBus::new());

    let first = router
        .send_message(MessageEnvelope::new("agent-0001", "agent-0002", serde_json::json!(1)))
        .await;
    assert!(first.success);

    let second = router
        .send_message(MessageEnvelope::new("agent-0001", "agent-0002", serde_json::json!(2)))
        .await;
    assert!(!second.success);
    assert_eq!(second.error_type, Some(ErrorKind::Delivery));
    assert_eq!(second.attempts, 3);

    swarm.get("agent-0002").unwrap().take_messages();
    let report = router.reprocess_dead_letter_queue().await;
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn broadcast_reaches_every_other_agent() {
    let swarm = swarm_of(4, 10).await;
    let router = MessageRouter::new(config(), swarm.clone(), SignalBus::new());

    let original = MessageEnvelope::broadcast("agent-0002", serde_json::json!("hello"));
    let result = router.broadcast_message(original.clone()).await;
    assert_eq!(result.delivered_count, 3);

    for agent in swarm.agents() {
        let inbox = agent.take_messages();
        if agent.id() == "agent-0002" {
            assert!(inbox.is_empty());
        } else {
            assert_eq!(inbox.len(), 1);
            assert_eq!(inbox[0].correlation_id.as_deref(), Some(original.id.to_string().as_str()));
        }
    }
}
