//! Testing utilities for cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process clusters over the
//! in-memory transport, with helpers to find leaders, kill and revive
//! servers, and partition the network.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::config::RaftOptions;
use crate::core::consensus::{bootstrap, ReplicatedLog, Role};
use crate::core::message::{ConfigurationDescriptor, Entry, ServerAddress};
use crate::storage::{LogStore, MemoryLog};
use crate::transport::inmemory::{InMemoryNetwork, NodeInbox, Request};

/// Address convention used by test clusters.
pub fn test_address(id: u64) -> String {
    format!("server-{id}")
}

/// A single test server.
pub struct TestNode {
    pub id: u64,
    pub address: String,
    pub log: Arc<ReplicatedLog>,
    serve_task: Option<JoinHandle<()>>,
}

/// An in-process cluster wired over [`InMemoryNetwork`].
pub struct TestCluster {
    pub network: InMemoryNetwork,
    pub nodes: Vec<TestNode>,
    options: RaftOptions,
}

/// Dispatch inbound RPCs from an inbox into the consensus handle.
fn serve(log: Arc<ReplicatedLog>, mut inbox: NodeInbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = inbox.recv().await {
            match request {
                Request::RequestVote { request, reply } => {
                    let _ = reply.send(log.handle_request_vote(request).await);
                }
                Request::AppendEntry { request, reply } => {
                    let _ = reply.send(log.handle_append_entry(request).await);
                }
            }
        }
    })
}

impl TestCluster {
    /// Timing tuned for fast, reliable tests.
    pub fn fast_options() -> RaftOptions {
        RaftOptions::default()
            .with_follower_timeout(Duration::from_millis(200))
            .with_heartbeat_period(Duration::from_millis(20))
            .with_rpc_failure_backoff(Duration::from_millis(40))
            .with_seed(42)
    }

    /// Start `count` servers (ids 1..=count) sharing a pre-seeded stable
    /// configuration.
    pub async fn new(count: usize) -> Self {
        Self::with_options(count, Self::fast_options()).await
    }

    pub async fn with_options(count: usize, options: RaftOptions) -> Self {
        let network = InMemoryNetwork::new();
        let servers: Vec<ServerAddress> = (1..=count as u64)
            .map(|id| ServerAddress { id, address: test_address(id) })
            .collect();

        let mut cluster = TestCluster { network, nodes: Vec::new(), options };
        for id in 1..=count as u64 {
            // Every log starts with the cluster configuration already in it,
            // the state a bootstrapped-and-grown cluster would have.
            let mut store = MemoryLog::new();
            store
                .append(Entry::configuration(
                    1,
                    ConfigurationDescriptor::stable(servers.clone()),
                ))
                .expect("memory log append");
            cluster.start_node(id, Box::new(store));
        }
        cluster
    }

    /// Start a brand-new single-server cluster via `bootstrap`.
    pub async fn bootstrapped_single(options: RaftOptions) -> Self {
        let network = InMemoryNetwork::new();
        let mut cluster = TestCluster { network, nodes: Vec::new(), options };
        let mut store = MemoryLog::new();
        bootstrap(&mut store, ServerAddress { id: 1, address: test_address(1) })
            .expect("bootstrap");
        cluster.start_node(1, Box::new(store));
        cluster
    }

    /// Start a server with an empty log. It stays a silent follower until a
    /// membership change adopts it.
    pub fn start_blank_node(&mut self, id: u64) {
        self.start_node(id, Box::new(MemoryLog::new()));
    }

    fn start_node(&mut self, id: u64, store: Box<dyn LogStore>) {
        let address = test_address(id);
        let inbox = self.network.register(&address);
        let transport = self.network.transport(&address, Duration::from_millis(100));
        let log = ReplicatedLog::spawn(id, &address, store, Box::new(transport), self.options.clone());
        let serve_task = serve(Arc::clone(&log), inbox);
        self.nodes.push(TestNode {
            id,
            address,
            log,
            serve_task: Some(serve_task),
        });
    }

    pub fn node(&self, id: u64) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .expect("unknown node id")
    }

    /// Make a server unreachable, as a crash would. Its in-memory state
    /// survives for a later [`revive`](Self::revive).
    pub fn kill(&mut self, id: u64) {
        let address = test_address(id);
        self.network.deregister(&address);
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            if let Some(task) = node.serve_task.take() {
                task.abort();
            }
        }
    }

    /// Reconnect a previously killed server.
    pub fn revive(&mut self, id: u64) {
        let address = test_address(id);
        let inbox = self.network.register(&address);
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.serve_task = Some(serve(Arc::clone(&node.log), inbox));
        }
    }

    /// Cut a server off from everyone without dropping its inbox.
    pub fn isolate(&self, id: u64) {
        self.network.isolate(&test_address(id));
    }

    pub fn heal(&self, id: u64) {
        self.network.heal(&test_address(id));
    }

    /// Wait for some server to become leader; returns its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            for node in &self.nodes {
                let status = node.log.status().await;
                if status.role == Role::Leader {
                    return Some(node.id);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Wait for a leader that can actually service requests (an entry of its
    /// own term has committed).
    pub async fn wait_for_ready_leader(&self, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            for node in &self.nodes {
                if node.log.get_configuration().await.is_ok() {
                    return Some(node.id);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Shut every server down.
    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            self.network.deregister(&node.address);
            node.log.exit().await;
            if let Some(task) = node.serve_task.take() {
                task.abort();
            }
        }
    }
}
