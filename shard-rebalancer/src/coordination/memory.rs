//! In-process coordination hub.
//!
//! Every [`MemoryClient`] created from the same [`MemoryCoordinator`] sees
//! the same groups and gates, so a whole fleet can be simulated inside one
//! runtime. The hub also counts barrier slots taken and released, and can be
//! switched to "unreachable" to exercise readiness probes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use super::{Barrier, CoordinationClient, MemberSnapshot, Membership, CHANGE_CHANNEL_CAPACITY};
use crate::{Error, NodeId};

/// Barrier slot accounting across the whole hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierStats {
    /// Slots taken by `enter()`.
    pub entered: u64,
    /// Slots given back by `leave()`.
    pub released: u64,
}

impl BarrierStats {
    /// Slots currently occupied.
    pub fn held(&self) -> u64 {
        // Stats assembled by hand may still be inconsistent
        self.entered.saturating_sub(self.released)
    }
}

struct Group {
    generation: u64,
    members: Vec<NodeId>,
    changes: broadcast::Sender<()>,
}

impl Group {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            generation: 0,
            members: Vec::new(),
            changes,
        }
    }

    fn bump(&mut self) {
        self.generation += 1;
        let _ = self.changes.send(());
    }
}

struct Gate {
    parties: HashSet<u64>,
    ready: watch::Sender<bool>,
}

#[derive(Default)]
struct Hub {
    groups: Mutex<HashMap<String, Group>>,
    gates: Mutex<HashMap<String, Gate>>,
    unreachable: AtomicBool,
    next_party: AtomicU64,
    entered: AtomicU64,
    released: AtomicU64,
}

impl Hub {
    fn with_group<T>(&self, path: &str, f: impl FnOnce(&mut Group) -> T) -> T {
        let mut groups = self.groups.lock();
        let group = groups.entry(path.to_string()).or_insert_with(Group::new);
        f(group)
    }
}

/// Shared state standing in for the coordination service.
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    hub: Arc<Hub>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client connection to this hub.
    pub fn client(&self) -> Arc<MemoryClient> {
        Arc::new(MemoryClient {
            hub: self.hub.clone(),
            connected: AtomicBool::new(false),
        })
    }

    /// Current members of the group at `path`, in join order.
    pub fn members(&self, path: &str) -> Vec<NodeId> {
        self.hub.with_group(path, |group| group.members.clone())
    }

    pub fn generation(&self, path: &str) -> u64 {
        self.hub.with_group(path, |group| group.generation)
    }

    pub fn barrier_stats(&self) -> BarrierStats {
        // Released first: every release follows its entry
        let released = self.hub.released.load(Ordering::SeqCst);
        let entered = self.hub.entered.load(Ordering::SeqCst);
        BarrierStats { entered, released }
    }

    /// Gates that still have at least one party inside.
    pub fn open_gates(&self) -> Vec<String> {
        let mut gates: Vec<String> = self.hub.gates.lock().keys().cloned().collect();
        gates.sort();
        gates
    }

    /// While unreachable, existence checks never answer.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.hub.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

pub struct MemoryClient {
    hub: Arc<Hub>,
    connected: AtomicBool,
}

impl MemoryClient {
    fn ensure_connected(&self) -> Result<(), Error> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::connection("client is not connected"))
        }
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn connect(&self) -> Result<(), Error> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, Error> {
        self.ensure_connected()?;
        if self.hub.unreachable.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if path == "/" {
            return Ok(true);
        }
        let known_group = self.hub.groups.lock().contains_key(path);
        let known_gate = self.hub.gates.lock().contains_key(path);
        Ok(known_group || known_gate)
    }

    fn membership(&self, group_path: &str, identity: &str) -> Arc<dyn Membership> {
        Arc::new(MemoryMembership {
            hub: self.hub.clone(),
            group_path: group_path.to_string(),
            identity: identity.to_string(),
        })
    }

    fn barrier(&self, gate_path: &str, parties: usize) -> Box<dyn Barrier> {
        Box::new(MemoryBarrier {
            hub: self.hub.clone(),
            gate_path: gate_path.to_string(),
            parties,
            party_id: self.hub.next_party.fetch_add(1, Ordering::SeqCst),
            held: false,
        })
    }
}

pub struct MemoryMembership {
    hub: Arc<Hub>,
    group_path: String,
    identity: NodeId,
}

#[async_trait]
impl Membership for MemoryMembership {
    async fn join(&self) -> Result<(), Error> {
        self.hub.with_group(&self.group_path, |group| {
            if !group.members.contains(&self.identity) {
                group.members.push(self.identity.clone());
                group.bump();
            }
        });
        tracing::debug!(identity = %self.identity, path = %self.group_path, "Joined group");
        Ok(())
    }

    async fn leave(&self) -> Result<(), Error> {
        self.hub.with_group(&self.group_path, |group| {
            let before = group.members.len();
            group.members.retain(|member| member != &self.identity);
            if group.members.len() != before {
                group.bump();
            }
        });
        tracing::debug!(identity = %self.identity, path = %self.group_path, "Left group");
        Ok(())
    }

    async fn members(&self) -> Result<MemberSnapshot, Error> {
        Ok(self.hub.with_group(&self.group_path, |group| MemberSnapshot {
            generation: group.generation,
            members: group.members.clone(),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.hub
            .with_group(&self.group_path, |group| group.changes.subscribe())
    }
}

pub struct MemoryBarrier {
    hub: Arc<Hub>,
    gate_path: String,
    parties: usize,
    party_id: u64,
    held: bool,
}

#[async_trait]
impl Barrier for MemoryBarrier {
    async fn enter(&mut self) -> Result<(), Error> {
        let mut ready_rx = {
            let mut gates = self.hub.gates.lock();
            let gate = gates.entry(self.gate_path.clone()).or_insert_with(|| Gate {
                parties: HashSet::new(),
                ready: watch::channel(false).0,
            });
            if gate.parties.insert(self.party_id) {
                self.held = true;
                self.hub.entered.fetch_add(1, Ordering::SeqCst);
            }
            if gate.parties.len() >= self.parties {
                gate.ready.send_replace(true);
            }
            gate.ready.subscribe()
        };

        ready_rx
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| Error::barrier(format!("gate {} was torn down", self.gate_path)))?;
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), Error> {
        if !self.held {
            return Ok(());
        }
        let mut gates = self.hub.gates.lock();
        if let Some(gate) = gates.get_mut(&self.gate_path) {
            gate.parties.remove(&self.party_id);
            if gate.parties.is_empty() {
                gates.remove(&self.gate_path);
            }
        }
        self.held = false;
        self.hub.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
