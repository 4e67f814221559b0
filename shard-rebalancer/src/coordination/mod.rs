//! Seams to the coordination service.
//!
//! The rebalance coordinator only talks to these traits. Two backends ship
//! with the crate:
//! - [`memory`]: an in-process hub shared by every node of a simulated fleet
//! - [`redis`]: sorted-set membership, Pub/Sub change notification and a
//!   set-based counted barrier

pub mod memory;
pub mod redis;

pub use self::memory::{BarrierStats, MemoryClient, MemoryCoordinator};
pub use self::redis::RedisClient;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::{Error, NodeId};

/// Capacity of membership change channels. Changes carry no payload, so a
/// lagging receiver loses nothing but duplicate triggers.
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Members of a group as read at one moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberSnapshot {
    /// Bumped by the coordination service on every join, leave or expiry.
    /// Readers of the same membership state see the same generation.
    pub generation: u64,
    /// Raw member list; order is not guaranteed to match across nodes.
    pub members: Vec<NodeId>,
}

impl MemberSnapshot {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Connection to the coordination service and factory for its recipes.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn connect(&self) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;

    /// Existence check, used as a liveness probe.
    async fn exists(&self, path: &str) -> Result<bool, Error>;

    /// Membership handle for `identity` in the group at `group_path`.
    fn membership(&self, group_path: &str, identity: &str) -> Arc<dyn Membership>;

    /// A fresh barrier party waiting for `parties` entrants at `gate_path`.
    fn barrier(&self, gate_path: &str, parties: usize) -> Box<dyn Barrier>;
}

/// Group membership of one node.
#[async_trait]
pub trait Membership: Send + Sync {
    async fn join(&self) -> Result<(), Error>;

    async fn leave(&self) -> Result<(), Error>;

    async fn members(&self) -> Result<MemberSnapshot, Error>;

    /// Change notifications. Every join, leave or expiry in the group sends
    /// one unit message; dropping the receiver unregisters it.
    fn subscribe(&self) -> broadcast::Receiver<()>;
}

/// One party of a counted rendezvous.
#[async_trait]
pub trait Barrier: Send {
    /// Occupy a slot and wait until the expected number of parties entered.
    ///
    /// The slot is held from the moment this is called, even if the future
    /// is dropped before it resolves.
    async fn enter(&mut self) -> Result<(), Error>;

    /// Release the slot. Safe to call repeatedly and after an incomplete
    /// `enter()`.
    async fn leave(&mut self) -> Result<(), Error>;
}
