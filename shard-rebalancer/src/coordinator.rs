use crate::coordination::{Barrier, CoordinationClient, Membership, RedisClient};
use crate::{allocate, ClusterConfig, Error, LifecycleEvents, NotReady, ShardAssignment};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The committed result of the last rebalance.
///
/// Empty (and `shard == None`) from the moment a rebalance starts until it
/// commits.
#[derive(Debug, Clone, Default, PartialEq)]
struct Allocation {
    shard: Option<u32>,
    assignment: ShardAssignment,
}

/// Handle to the background task running one rebalance.
struct Attempt {
    id: u64,
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

enum Outcome {
    Committed,
    Cancelled,
    TimedOut,
    Failed(Error),
}

enum Lifecycle {
    Idle,
    Running {
        membership: Arc<dyn Membership>,
        watcher: JoinHandle<()>,
    },
    Stopped,
}

struct Inner {
    node_id: String,
    config: ClusterConfig,
    client: Arc<dyn CoordinationClient>,
    events: LifecycleEvents,
    allocation: ArcSwap<Allocation>,
    committed: Notify,
    in_flight: Mutex<Option<Attempt>>,
    attempts: AtomicU64,
}

/// Agrees with the rest of the fleet on a shard index for every node.
///
/// On every membership change the coordinator cancels whatever rebalance is
/// in flight and starts a new one: wait out the debounce delay, clear the
/// current assignment, meet every member at a barrier, then commit the
/// sorted-identity assignment. Attempts that exceed the timeout are retried
/// until they commit or are superseded.
pub struct RebalanceCoordinator {
    inner: Arc<Inner>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl RebalanceCoordinator {
    pub fn new(
        config: ClusterConfig,
        client: Arc<dyn CoordinationClient>,
        events: LifecycleEvents,
    ) -> Self {
        let node_id = config.node_id();
        Self {
            inner: Arc::new(Inner {
                node_id,
                config,
                client,
                events,
                allocation: ArcSwap::from_pointee(Allocation::default()),
                committed: Notify::new(),
                in_flight: Mutex::new(None),
                attempts: AtomicU64::new(0),
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
        }
    }

    /// Coordinator backed by the Redis server at `config.coordination_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn with_redis(config: ClusterConfig, events: LifecycleEvents) -> Result<Self, Error> {
        let client = Arc::new(RedisClient::new(&config.coordination_url)?);
        Ok(Self::new(config, client, events))
    }

    /// Connect, register for membership changes and join the group.
    ///
    /// After this returns the node is a member; a shard is assigned only
    /// once the first rebalance commits (see [`Self::wait_for_assignment`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator was already started, or if
    /// connecting or joining fails.
    pub async fn start(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(Error::config("coordinator can only be started once"));
        }

        self.inner.config.validate()?;
        self.inner.client.connect().await?;

        let membership = self
            .inner
            .client
            .membership(&self.inner.config.party_path(), &self.inner.node_id);

        // Subscribe before joining so our own join triggers the first rebalance
        let watcher = Self::spawn_watcher_task(
            self.inner.clone(),
            membership.clone(),
            membership.subscribe(),
        );

        if let Err(e) = membership.join().await {
            watcher.abort();
            if let Err(close_err) = self.inner.client.close().await {
                tracing::warn!("Failed to close client after join failure: {}", close_err);
            }
            return Err(e);
        }

        tracing::info!(
            node_id = %self.inner.node_id,
            party = %self.inner.config.party_path(),
            "Joined cluster"
        );
        *lifecycle = Lifecycle::Running {
            membership,
            watcher,
        };
        Ok(())
    }

    /// Unregister, cancel any rebalance, leave the group and disconnect.
    ///
    /// Waits for a cancelled rebalance to release its barrier slot before the
    /// client is closed. Calling this before `start()` or more than once is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if leaving the group or closing the client fails.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        let (membership, watcher) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running {
                membership,
                watcher,
            } => (membership, watcher),
            other => {
                *lifecycle = other;
                return Ok(());
            }
        };

        // 1. Stop reacting to membership changes
        watcher.abort();
        let _ = watcher.await;

        // 2. Cancel the in-flight rebalance and wait for it to unwind
        self.inner.cancel_in_flight().await;

        // 3. Leave the group, then release the connection regardless
        let leave_result = membership.leave().await;
        let close_result = self.inner.client.close().await;

        tracing::info!(node_id = %self.inner.node_id, "Left cluster");
        leave_result?;
        close_result
    }

    fn spawn_watcher_task(
        inner: Arc<Inner>,
        membership: Arc<dyn Membership>,
        mut changes: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(()) => inner.trigger_rebalance(&membership),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Membership changes coalesced");
                        inner.trigger_rebalance(&membership);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Membership change channel closed");
                        break;
                    }
                }
            }
        })
    }

    /// Fails unless a shard is assigned and the coordination service answers
    /// within the probe timeout.
    pub async fn ready(&self) -> Result<(), NotReady> {
        if self.local_shard().is_none() {
            return Err(NotReady::Unassigned);
        }

        let probe = self.inner.client.exists("/");
        match tokio::time::timeout(self.inner.config.ready_probe_timeout, probe).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!("Readiness probe failed: {}", e);
                Err(NotReady::CoordinationUnreachable)
            }
            Err(_) => Err(NotReady::CoordinationUnreachable),
        }
    }

    /// Wait until a committed assignment includes this node; returns its shard.
    pub async fn wait_for_assignment(&self) -> u32 {
        loop {
            let notified = self.inner.committed.notified();
            if let Some(shard) = self.local_shard() {
                return shard;
            }
            notified.await;
        }
    }

    /// Shard of this node, `None` while unassigned or rebalancing.
    pub fn local_shard(&self) -> Option<u32> {
        self.inner.allocation.load().shard
    }

    /// The last committed assignment; empty while a rebalance is underway.
    pub fn assignment(&self) -> ShardAssignment {
        self.inner.allocation.load().assignment.clone()
    }

    /// Shard 0 acts as the leader.
    pub fn is_leader(&self) -> bool {
        self.local_shard() == Some(0)
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// True while a rebalance task is alive.
    pub fn is_rebalancing(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .as_ref()
            .map(|attempt| !attempt.handle.is_finished())
            .unwrap_or(false)
    }

    /// Number of rebalances started so far (superseded ones included).
    pub fn rebalances_started(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Drop for RebalanceCoordinator {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Lifecycle::Running { watcher, .. } = &*lifecycle {
                watcher.abort();
                if let Some(attempt) = self.inner.in_flight.lock().take() {
                    attempt.cancel_token.cancel();
                }
                tracing::debug!(
                    node_id = %self.inner.node_id,
                    "RebalanceCoordinator dropped (stop should be called explicitly)"
                );
            }
        }
    }
}

impl Inner {
    /// Supersede the in-flight attempt with a fresh one.
    ///
    /// The new attempt waits for the old one to finish unwinding, so only one
    /// attempt ever mutates the allocation or holds a barrier slot.
    fn trigger_rebalance(self: &Arc<Self>, membership: &Arc<dyn Membership>) {
        let mut slot = self.in_flight.lock();

        let previous = slot.take().map(|attempt| {
            attempt.cancel_token.cancel();
            tracing::debug!(attempt = attempt.id, "Superseding rebalance");
            attempt.handle
        });

        let id = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel_token = CancellationToken::new();

        let inner = self.clone();
        let membership = membership.clone();
        let token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    if e.is_panic() {
                        tracing::error!("Previous rebalance panicked: {}", e);
                    }
                }
            }
            inner.rebalance_loop(id, membership, token).await;
        });

        *slot = Some(Attempt {
            id,
            cancel_token,
            handle,
        });
    }

    async fn cancel_in_flight(&self) {
        let attempt = self.in_flight.lock().take();
        if let Some(attempt) = attempt {
            attempt.cancel_token.cancel();
            if let Err(e) = attempt.handle.await {
                if e.is_panic() {
                    tracing::error!(attempt = attempt.id, "Rebalance panicked: {}", e);
                }
            }
        }
    }

    async fn rebalance_loop(
        &self,
        id: u64,
        membership: Arc<dyn Membership>,
        cancel_token: CancellationToken,
    ) {
        // Debounce bursts of membership churn
        tokio::select! {
            _ = cancel_token.cancelled() => {
                tracing::debug!(attempt = id, "Rebalance superseded during debounce");
                return;
            }
            _ = tokio::time::sleep(self.config.rebalance_delay) => {}
        }

        let timeout = self.config.rebalance_timeout;
        loop {
            let mut gate: Option<Box<dyn Barrier>> = None;

            let outcome = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => Outcome::Cancelled,
                result = tokio::time::timeout(timeout, self.rebalance(id, membership.as_ref(), &mut gate)) => {
                    match result {
                        Ok(Ok(())) => Outcome::Committed,
                        Ok(Err(e)) => Outcome::Failed(e),
                        Err(_) => Outcome::TimedOut,
                    }
                }
            };

            // Whatever happened, give the barrier slot back
            if let Some(mut gate) = gate {
                self.release(id, &mut *gate).await;
            }

            match outcome {
                Outcome::Committed => return,
                Outcome::Cancelled => {
                    tracing::debug!(attempt = id, "Rebalance cancelled");
                    return;
                }
                Outcome::Failed(e) => {
                    tracing::error!(attempt = id, "Rebalance failed: {}", e);
                    return;
                }
                Outcome::TimedOut => {
                    tracing::error!(
                        attempt = id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Rebalance timeout, retrying"
                    );
                }
            }
        }
    }

    async fn rebalance(
        &self,
        id: u64,
        membership: &dyn Membership,
        gate: &mut Option<Box<dyn Barrier>>,
    ) -> Result<(), Error> {
        self.allocation.store(Arc::new(Allocation::default()));

        self.events.rebalance_started().await?;

        let snapshot = membership.members().await?;
        let gate_path = self.config.gate_path(snapshot.generation);
        tracing::debug!(
            attempt = id,
            generation = snapshot.generation,
            parties = snapshot.len(),
            gate = %gate_path,
            "Entering rebalance gate"
        );

        let barrier = gate.insert(self.client.barrier(&gate_path, snapshot.len()));
        barrier.enter().await?;
        let assignment = allocate(&snapshot.members);
        barrier.leave().await?;

        let shard = assignment.shard_of(&self.node_id);
        let allocation = Arc::new(Allocation { shard, assignment });
        self.allocation.store(allocation.clone());
        self.committed.notify_waiters();

        tracing::info!(
            attempt = id,
            generation = snapshot.generation,
            shard = ?shard,
            nodes = allocation.assignment.len(),
            "Rebalance committed"
        );

        self.events
            .rebalance_finished(shard, &allocation.assignment)
            .await?;
        Ok(())
    }

    async fn release(&self, id: u64, gate: &mut dyn Barrier) {
        match tokio::time::timeout(self.config.rebalance_timeout, gate.leave()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(attempt = id, "Failed to leave rebalance gate: {}", e),
            Err(_) => tracing::warn!(attempt = id, "Timed out leaving rebalance gate"),
        }
    }
}
