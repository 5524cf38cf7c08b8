//! In-memory transport implementation for testing
//!
//! Nodes register an inbox under their address on a shared [`InMemoryNetwork`];
//! RPCs travel over channels with a oneshot reply. The network can isolate
//! addresses to simulate partitions and drop inboxes to simulate crashes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::core::message::{
    AppendEntryRequest, AppendEntryResponse, RequestVoteRequest, RequestVoteResponse,
};

use super::{Transport, TransportError};

/// An RPC delivered to a node's inbox.
pub enum Request {
    RequestVote {
        request: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntry {
        request: AppendEntryRequest,
        reply: oneshot::Sender<AppendEntryResponse>,
    },
}

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<String, mpsc::Sender<Request>>,
    /// Ordered (from, to) pairs whose traffic is dropped.
    blocked: HashSet<(String, String)>,
}

/// A shared in-process "network" connecting [`InMemoryTransport`]s.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbox for `address`, replacing any previous one.
    pub fn register(&self, address: &str) -> NodeInbox {
        let (tx, rx) = mpsc::channel(64);
        self.state
            .lock()
            .unwrap()
            .inboxes
            .insert(address.to_string(), tx);
        NodeInbox { receiver: rx }
    }

    /// Drop the inbox for `address`; subsequent RPCs to it fail.
    pub fn deregister(&self, address: &str) {
        self.state.lock().unwrap().inboxes.remove(address);
    }

    /// Cut all traffic between `address` and every other node, both ways.
    pub fn isolate(&self, address: &str) {
        let mut state = self.state.lock().unwrap();
        let others: Vec<String> = state
            .inboxes
            .keys()
            .filter(|a| a.as_str() != address)
            .cloned()
            .collect();
        for other in others {
            state.blocked.insert((address.to_string(), other.clone()));
            state.blocked.insert((other, address.to_string()));
        }
    }

    /// Undo [`isolate`](Self::isolate) for `address`.
    pub fn heal(&self, address: &str) {
        self.state
            .lock()
            .unwrap()
            .blocked
            .retain(|(from, to)| from != address && to != address);
    }

    /// A transport that sends as `local_address` (so partitions apply to it),
    /// bounding each RPC by `timeout`.
    pub fn transport(&self, local_address: &str, timeout: Duration) -> InMemoryTransport {
        InMemoryTransport {
            network: self.clone(),
            local_address: local_address.to_string(),
            timeout,
        }
    }

    fn sender(&self, from: &str, to: &str) -> Result<mpsc::Sender<Request>, TransportError> {
        let state = self.state.lock().unwrap();
        if state.blocked.contains(&(from.to_string(), to.to_string())) {
            return Err(TransportError::ConnectionFailed);
        }
        state
            .inboxes
            .get(to)
            .cloned()
            .ok_or(TransportError::NodeNotFound)
    }
}

/// Receiving side of a registered address.
pub struct NodeInbox {
    receiver: mpsc::Receiver<Request>,
}

impl NodeInbox {
    /// Wait for the next inbound RPC; `None` once the inbox is deregistered
    /// and drained.
    pub async fn recv(&mut self) -> Option<Request> {
        self.receiver.recv().await
    }
}

/// Channel-backed transport; one per node.
pub struct InMemoryTransport {
    network: InMemoryNetwork,
    local_address: String,
    timeout: Duration,
}

impl InMemoryTransport {
    async fn roundtrip<T>(
        &self,
        address: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, TransportError> {
        let sender = self.network.sender(&self.local_address, address)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(build(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;
        tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        address: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        self.roundtrip(address, |reply| Request::RequestVote { request, reply })
            .await
    }

    async fn append_entry(
        &self,
        address: &str,
        request: AppendEntryRequest,
    ) -> Result<AppendEntryResponse, TransportError> {
        self.roundtrip(address, |reply| Request::AppendEntry { request, reply })
            .await
    }
}
