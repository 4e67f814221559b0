use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;

use crate::ShardAssignment;

type StartHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type EndHandler =
    Arc<dyn Fn(Option<u32>, ShardAssignment) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handlers invoked around every rebalance.
///
/// The handler lists are frozen by [`LifecycleEventsBuilder::build`]. Dispatch
/// runs handlers one at a time in registration order and awaits each, so a
/// handler can hold the rebalance back (e.g. to pause traffic) until it
/// returns. A failing handler aborts the dispatch and the attempt.
#[derive(Clone)]
pub struct LifecycleEvents {
    on_start: Arc<[StartHandler]>,
    on_end: Arc<[EndHandler]>,
}

impl LifecycleEvents {
    pub fn builder() -> LifecycleEventsBuilder {
        LifecycleEventsBuilder::default()
    }

    /// No handlers at all.
    pub fn none() -> Self {
        Self::default()
    }

    pub(crate) async fn rebalance_started(&self) -> anyhow::Result<()> {
        for handler in self.on_start.iter() {
            handler().await?;
        }
        Ok(())
    }

    pub(crate) async fn rebalance_finished(
        &self,
        shard: Option<u32>,
        assignment: &ShardAssignment,
    ) -> anyhow::Result<()> {
        for handler in self.on_end.iter() {
            handler(shard, assignment.clone()).await?;
        }
        Ok(())
    }

    pub fn start_handlers(&self) -> usize {
        self.on_start.len()
    }

    pub fn end_handlers(&self) -> usize {
        self.on_end.len()
    }
}

impl Default for LifecycleEvents {
    fn default() -> Self {
        LifecycleEventsBuilder::default().build()
    }
}

impl std::fmt::Debug for LifecycleEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEvents")
            .field("on_start", &self.on_start.len())
            .field("on_end", &self.on_end.len())
            .finish()
    }
}

#[derive(Default)]
pub struct LifecycleEventsBuilder {
    on_start: Vec<StartHandler>,
    on_end: Vec<EndHandler>,
}

impl LifecycleEventsBuilder {
    /// Register a "rebalance starting" handler.
    pub fn on_start<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_start.push(Arc::new(move || handler().boxed()));
        self
    }

    /// Register a "rebalance finished" handler, called with the local shard
    /// and the committed table.
    pub fn on_end<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Option<u32>, ShardAssignment) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_end
            .push(Arc::new(move |shard, assignment| handler(shard, assignment).boxed()));
        self
    }

    pub fn build(self) -> LifecycleEvents {
        LifecycleEvents {
            on_start: self.on_start.into(),
            on_end: self.on_end.into(),
        }
    }
}
