//! Membership-aware shard rebalancing.
//!
//! Every node of a fleet of stateless services joins a membership group in a
//! shared coordination service. Whenever the group changes, all members meet
//! at a barrier and independently compute the same assignment of contiguous
//! shard indices `0..N`, ordered by node identity.
//!
//! This crate provides:
//! - [`RebalanceCoordinator`]: reacts to membership changes, debounces them,
//!   drives the barrier protocol and commits the assignment
//! - [`LifecycleEvents`]: ordered handlers awaited before and after every
//!   rebalance (e.g. to pause traffic while shards move)
//! - Coordination backends: Redis ([`coordination::RedisClient`]) and an
//!   in-process hub ([`coordination::MemoryCoordinator`]) for tests and
//!   single-process fleets
//!
//! # Example
//!
//! ```rust,ignore
//! use shard_rebalancer::{ClusterConfig, LifecycleEvents, RebalanceCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::from_env()?;
//!
//!     let events = LifecycleEvents::builder()
//!         .on_start(|| async {
//!             // Stop accepting shard-bound work
//!             Ok(())
//!         })
//!         .on_end(|shard, assignment| async move {
//!             tracing::info!(?shard, nodes = assignment.len(), "Now serving");
//!             Ok(())
//!         })
//!         .build();
//!
//!     // Joins the group; the first rebalance runs in the background
//!     let coordinator = RebalanceCoordinator::with_redis(config, events)?;
//!     coordinator.start().await?;
//!     let shard = coordinator.wait_for_assignment().await;
//!
//!     if coordinator.is_leader() {
//!         // Shard 0 does the singleton work
//!     }
//!
//!     // Leaves the group; peers rebalance without us
//!     coordinator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Rebalance protocol
//!
//! 1. Wait the debounce delay (default 1s) to coalesce churn
//! 2. Clear the local assignment and run the "starting" handlers
//! 3. Read the member set and enter the gate for its generation, expecting
//!    every member
//! 4. Sort identities, enumerate, leave the gate
//! 5. Commit and run the "finished" handlers
//!
//! Attempts are bounded by a timeout (default 5s) and retried until they
//! commit. A newer membership change cancels the attempt in flight; the
//! barrier slot is always released.

pub mod coordination;
mod assignment;
mod config;
mod coordinator;
mod error;
mod events;

pub use assignment::{allocate, NodeId, ShardAssignment};
pub use config::{ClusterConfig, DEFAULT_REDIS_URL, DEFAULT_ROOT_PATH};
pub use coordinator::RebalanceCoordinator;
pub use error::{Error, NotReady};
pub use events::{LifecycleEvents, LifecycleEventsBuilder};
