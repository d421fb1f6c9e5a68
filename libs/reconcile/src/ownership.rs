//! Node ownership resolution.
//!
//! Every node is reconciled by exactly one controller replica. Replica IDs are
//! the names of the nodes they run on, so a healthy node is pinned to its
//! co-located replica. Nodes without a live co-located replica are spread over
//! the remaining live replicas with rendezvous (highest-random-weight)
//! hashing, which only moves the nodes of a departed replica and only moves
//! nodes onto a newly joined one.
//!
//! A [`ClusterView`] is a snapshot. Build a fresh one for every pass instead of
//! caching assignments across membership changes.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use sha2::{Digest, Sha256};

/// Health facts for one node, as reported by the node-health collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub name: String,
    pub ready: bool,
    pub reachable: bool,
    /// Last time `ready` or `reachable` changed.
    pub last_transition: DateTime<Utc>,
}

impl NodeHealth {
    /// A healthy node.
    pub fn healthy(name: impl Into<String>, since: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            ready: true,
            reachable: true,
            last_transition: since,
        }
    }

    /// Whether the node has been unhealthy for at least `grace`.
    pub fn is_down(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        if self.ready && self.reachable {
            return false;
        }
        let grace = TimeDelta::from_std(grace).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.last_transition) >= grace
    }
}

/// Membership and node-health snapshot used for ownership decisions.
#[derive(Debug, Clone)]
pub struct ClusterView {
    nodes: BTreeMap<String, NodeHealth>,
    replicas: BTreeSet<String>,
    down_grace: Duration,
    now: DateTime<Utc>,
}

impl ClusterView {
    pub fn new<N, R, S>(nodes: N, replicas: R, down_grace: Duration, now: DateTime<Utc>) -> Self
    where
        N: IntoIterator<Item = NodeHealth>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
            replicas: replicas.into_iter().map(Into::into).collect(),
            down_grace,
            now,
        }
    }

    /// A node is down when it is unknown or unhealthy beyond the grace window.
    pub fn is_node_down(&self, node: &str) -> bool {
        match self.nodes.get(node) {
            Some(health) => health.is_down(self.down_grace, self.now),
            None => true,
        }
    }

    /// Registered replicas whose own node is not down.
    pub fn live_replicas(&self) -> impl Iterator<Item = &str> {
        self.replicas
            .iter()
            .map(String::as_str)
            .filter(|replica| !self.is_node_down(replica))
    }

    /// The replica responsible for `node`, if any replica is live.
    pub fn responsible_replica(&self, node: &str) -> Option<&str> {
        if !self.is_node_down(node) {
            if let Some(pinned) = self.replicas.get(node) {
                return Some(pinned.as_str());
            }
        }

        self.live_replicas()
            .max_by_key(|replica| (rendezvous_weight(replica, node), *replica))
    }

    pub fn is_responsible(&self, replica: &str, node: &str) -> bool {
        self.responsible_replica(node) == Some(replica)
    }
}

fn rendezvous_weight(replica: &str, node: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(replica.as_bytes());
    hasher.update(b"/");
    hasher.update(node.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
