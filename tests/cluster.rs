//! End-to-end cluster scenarios over the in-memory transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use raftlog::core::consensus::{ReplicatedLog, Role};
use raftlog::core::message::{ClientError, EntryType, ServerAddress, SetConfigurationError};
use raftlog::storage::{FileLog, LogStore};
use raftlog::testing::{test_address, TestCluster};

const LEADER_WAIT: Duration = Duration::from_secs(5);

/// Walk the committed stream of `log` until an entry with `payload` shows up.
async fn wait_for_payload(log: &Arc<ReplicatedLog>, payload: &[u8], timeout: Duration) -> bool {
    let walk = async {
        let mut at = 0;
        loop {
            match log.get_next_entry(at).await {
                Ok(entry) => {
                    at = entry.id;
                    if entry.kind == EntryType::Data && entry.payload == payload {
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
    };
    tokio::time::timeout(timeout, walk).await.unwrap_or(false)
}

#[tokio::test]
async fn three_server_commit_with_follower_outage() {
    let mut cluster = TestCluster::new(3).await;
    let leader_id = cluster.wait_for_ready_leader(LEADER_WAIT).await.unwrap();
    let leader = Arc::clone(&cluster.node(leader_id).log);

    // Replicate, then read the entry straight back from the stream.
    let id_a = leader.replicate(b"A".to_vec()).await.unwrap();
    let entry = leader.get_next_entry(id_a - 1).await.unwrap();
    assert_eq!(entry.payload, b"A");
    assert_eq!(entry.term, leader.status().await.term);

    // A two-of-three quorum commits without the dead follower.
    let dead = (1..=3).find(|&id| id != leader_id).unwrap();
    cluster.kill(dead);
    let id_b = leader.replicate(b"B".to_vec()).await.unwrap();
    assert_eq!(id_b, id_a + 1);

    // Once revived, the follower catches up and exposes the entry.
    cluster.revive(dead);
    let follower = Arc::clone(&cluster.node(dead).log);
    assert!(wait_for_payload(&follower, b"B", Duration::from_secs(5)).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn leader_failure_preserves_committed_entries() {
    let cluster = TestCluster::new(5).await;
    let old_leader_id = cluster.wait_for_ready_leader(LEADER_WAIT).await.unwrap();
    let old_leader = Arc::clone(&cluster.node(old_leader_id).log);
    let old_term = old_leader.status().await.term;

    let payloads: Vec<Vec<u8>> = (1..=5).map(|i| format!("entry-{i}").into_bytes()).collect();
    for payload in &payloads {
        old_leader.replicate(payload.clone()).await.unwrap();
    }

    // Partition the old leader away; the rest elect a successor.
    cluster.isolate(old_leader_id);
    let new_leader_id = loop {
        let mut found = None;
        for node in &cluster.nodes {
            if node.id == old_leader_id {
                continue;
            }
            let status = node.log.status().await;
            if status.role == Role::Leader && status.term > old_term {
                found = Some(node.id);
                break;
            }
        }
        if let Some(id) = found {
            break id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_ne!(new_leader_id, old_leader_id);

    // Every committed payload must be in the new leader's log.
    let new_leader = Arc::clone(&cluster.node(new_leader_id).log);
    for payload in &payloads {
        assert!(wait_for_payload(&new_leader, payload, Duration::from_secs(5)).await);
    }
    // And it can append in its own term.
    new_leader.replicate(b"after-failover".to_vec()).await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn joint_consensus_membership_change() {
    let mut cluster = TestCluster::new(3).await;
    let leader_id = cluster.wait_for_ready_leader(LEADER_WAIT).await.unwrap();
    let leader = Arc::clone(&cluster.node(leader_id).log);

    let (configuration_id, servers) = leader.get_configuration().await.unwrap();
    assert_eq!(servers.len(), 3);

    // New servers join with empty logs and are caught up as listeners.
    cluster.start_blank_node(4);
    cluster.start_blank_node(5);
    let new_servers: Vec<ServerAddress> = [3, 4, 5]
        .iter()
        .map(|&id| ServerAddress { id, address: test_address(id) })
        .collect();

    leader
        .set_configuration(configuration_id, new_servers.clone())
        .await
        .unwrap();

    // A leader from the new membership emerges (the old one steps down if it
    // was excluded) and reports the new server set.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let (final_id, final_servers) = loop {
        assert!(tokio::time::Instant::now() < deadline, "no leader of the new configuration");
        let mut result = None;
        for id in [3u64, 4, 5] {
            if let Ok(config) = cluster.node(id).log.get_configuration().await {
                result = Some(config);
                break;
            }
        }
        if let Some(config) = result {
            break config;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert!(final_id > configuration_id);
    assert_eq!(final_servers, new_servers);

    // Departed servers are followers now.
    for id in [1u64, 2] {
        if id == leader_id {
            assert_ne!(cluster.node(id).log.status().await.role, Role::Leader);
        }
    }

    // A stale configuration id is refused.
    let leader_now = cluster.wait_for_ready_leader(LEADER_WAIT).await.unwrap();
    let result = cluster
        .node(leader_now)
        .log
        .set_configuration(configuration_id, servers)
        .await;
    assert!(matches!(result, Err(SetConfigurationError::Changed { .. })));

    cluster.shutdown().await;
}

#[tokio::test]
async fn isolated_leader_steps_down_without_higher_term() {
    let cluster = TestCluster::new(3).await;
    let leader_id = cluster.wait_for_ready_leader(LEADER_WAIT).await.unwrap();
    let leader = Arc::clone(&cluster.node(leader_id).log);

    cluster.isolate(leader_id);

    // No RPC can reach the leader, so only the lease audit can demote it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let status = leader.status().await;
        if status.role != Role::Leader {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "leader never stepped down while isolated"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Its clients are told to go elsewhere.
    let result = leader.replicate(b"too-late".to_vec()).await;
    assert!(matches!(
        result,
        Err(ClientError::NotLeader { .. }) | Err(ClientError::Retry)
    ));

    // The healthy majority elects a replacement.
    let new_leader = loop {
        let mut found = None;
        for node in &cluster.nodes {
            if node.id != leader_id && node.log.status().await.role == Role::Leader {
                found = Some(node.id);
            }
        }
        if let Some(id) = found {
            break id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_ne!(new_leader, leader_id);

    cluster.shutdown().await;
}

#[tokio::test]
async fn at_most_one_leader_per_term() {
    let mut cluster = TestCluster::new(5).await;
    let mut leaders_by_term: HashMap<u64, u64> = HashMap::new();

    let mut observe = |statuses: Vec<(u64, Role, u64)>| {
        for (id, role, term) in statuses {
            if role == Role::Leader {
                if let Some(&previous) = leaders_by_term.get(&term) {
                    assert_eq!(previous, id, "two leaders in term {term}");
                } else {
                    leaders_by_term.insert(term, id);
                }
            }
        }
    };

    // Churn leadership a few times while continuously observing.
    for round in 0..3 {
        let leader_id = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
        for _ in 0..20 {
            let mut statuses = Vec::new();
            for node in &cluster.nodes {
                let status = node.log.status().await;
                statuses.push((node.id, status.role, status.term));
            }
            observe(statuses);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if round < 2 {
            cluster.kill(leader_id);
            tokio::time::sleep(Duration::from_millis(100)).await;
            cluster.revive(leader_id);
        }
    }
    assert!(!leaders_by_term.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn blank_server_neither_elects_nor_serves() {
    let mut cluster = TestCluster::with_options(0, TestCluster::fast_options()).await;
    cluster.start_blank_node(1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = cluster.node(1).log.status().await;
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.term, 0);

    let result = cluster.node(1).log.replicate(b"x".to_vec()).await;
    assert!(matches!(result, Err(ClientError::NotLeader { .. })));

    cluster.shutdown().await;
}

#[tokio::test]
async fn restart_recovers_term_vote_and_entries() {
    let dir = tempfile::TempDir::new().unwrap();
    let network = raftlog::transport::inmemory::InMemoryNetwork::new();
    let options = TestCluster::fast_options();

    let (term_before, last_before) = {
        let mut store = FileLog::open(dir.path()).unwrap();
        raftlog::core::consensus::bootstrap(
            &mut store,
            ServerAddress { id: 1, address: test_address(1) },
        )
        .unwrap();
        let transport = network.transport(&test_address(1), Duration::from_millis(100));
        let server = ReplicatedLog::spawn(
            1,
            &test_address(1),
            Box::new(store),
            Box::new(transport),
            options.clone(),
        );
        let deadline = tokio::time::Instant::now() + LEADER_WAIT;
        while server.status().await.role != Role::Leader {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.replicate(b"durable-1".to_vec()).await.unwrap();
        server.replicate(b"durable-2".to_vec()).await.unwrap();
        let status = server.status().await;
        server.exit().await;
        (status.term, status.last_log_id)
    };

    // A restart sees the acknowledged state.
    let store = FileLog::open(dir.path()).unwrap();
    assert_eq!(store.metadata().current_term, term_before);
    assert_eq!(store.metadata().voted_for, 1);
    assert_eq!(store.last_id(), last_before);

    let transport = network.transport(&test_address(1), Duration::from_millis(100));
    let server = ReplicatedLog::spawn(
        1,
        &test_address(1),
        Box::new(store),
        Box::new(transport),
        options,
    );
    assert!(wait_for_payload(&server, b"durable-1", Duration::from_secs(5)).await);
    assert!(wait_for_payload(&server, b"durable-2", Duration::from_secs(5)).await);
    // The new term is at least the persisted one.
    assert!(server.status().await.term >= term_before);
    server.exit().await;
}
