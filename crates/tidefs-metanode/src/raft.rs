//! The replicated-log seam.
//!
//! Consensus itself is an external collaborator; a meta partition only
//! needs `submit` (propose a command, get back the applied response),
//! leadership queries, and a leader-change notification. The loopback
//! realization applies commands synchronously against the local state
//! machine, which is what single-replica deployments and tests run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Weak;

use crate::error::{MetaError, MetaResult};
use crate::fsm::FsmResponse;
use crate::partition::MetaPartition;

/// The interface a consensus implementation must satisfy.
pub trait ReplicatedLog: Send + Sync {
    /// Proposes a command and returns the state machine's response once
    /// the command has applied.
    fn submit(&self, command: Vec<u8>) -> MetaResult<FsmResponse>;

    /// Whether this replica currently leads the group.
    fn is_leader(&self) -> bool;

    /// The current leader's address, when known.
    fn leader_addr(&self) -> Option<String>;
}

/// Single-replica log: every submitted command applies immediately to
/// the local partition at the next index.
pub struct LoopbackLog {
    partition: Weak<MetaPartition>,
    index: AtomicU64,
    leader: AtomicBool,
}

impl LoopbackLog {
    /// Creates a loopback log over `partition`, initially leading.
    pub fn new(partition: Weak<MetaPartition>) -> Self {
        Self {
            partition,
            index: AtomicU64::new(0),
            leader: AtomicBool::new(true),
        }
    }

    /// Flips leadership, driving the partition's leader-change handler.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Highest index handed out.
    pub fn last_index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }
}

impl ReplicatedLog for LoopbackLog {
    fn submit(&self, command: Vec<u8>) -> MetaResult<FsmResponse> {
        if !self.is_leader() {
            return Err(MetaError::NotLeader { leader: None });
        }
        let partition = self
            .partition
            .upgrade()
            .ok_or_else(|| MetaError::Again("partition shut down".to_string()))?;
        let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        partition.apply(&command, index)
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_addr(&self) -> Option<String> {
        None
    }
}
