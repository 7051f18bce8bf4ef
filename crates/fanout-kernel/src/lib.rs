//! Aggregator facade.
//!
//! Wires the source registry, request validation, and the runtime's stream
//! emitter behind one builder.

mod registry;
mod scripted;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fanout_protocol::{
    AggregatorError, AggregatorResult, EventSink, RequestId, SourceClient, SourceId,
    SourceRequest,
};
use fanout_runtime::{
    CancellationController, DEFAULT_MAX_SOURCES, RuntimeConfig, SessionPlan, SessionReport,
    StreamEmitter, WorkerPool,
};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

pub use registry::{SourceInfo, SourceRegistry};
pub use scripted::{ScriptedSource, demo_registry};

#[derive(Debug, Clone)]
pub struct AggregatorBuilder {
    config: RuntimeConfig,
    max_sources_per_request: usize,
    shared_pool: bool,
    registry: SourceRegistry,
}

impl Default for AggregatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregatorBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            max_sources_per_request: DEFAULT_MAX_SOURCES,
            shared_pool: false,
            registry: SourceRegistry::default(),
        }
    }

    pub fn runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config = self.config.pool_size(pool_size);
        self
    }

    pub fn source_timeout(mut self, source_timeout: Duration) -> Self {
        self.config = self.config.source_timeout(source_timeout);
        self
    }

    pub fn cancel_grace(mut self, cancel_grace: Duration) -> Self {
        self.config = self.config.cancel_grace(cancel_grace);
        self
    }

    pub fn max_sources_per_request(mut self, max_sources: usize) -> Self {
        self.max_sources_per_request = max_sources.max(1);
        self
    }

    /// Bounds invocations across all sessions by one pool instead of one
    /// pool per session.
    pub fn shared_pool(mut self, shared: bool) -> Self {
        self.shared_pool = shared;
        self
    }

    pub fn source(
        mut self,
        source_id: impl Into<SourceId>,
        description: impl Into<String>,
        client: Arc<dyn SourceClient>,
    ) -> Self {
        self.registry.register(source_id, description, client);
        self
    }

    pub fn registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> Aggregator {
        let pool = self
            .shared_pool
            .then(|| WorkerPool::new(self.config.pool_size));
        Aggregator {
            config: self.config,
            max_sources_per_request: self.max_sources_per_request,
            registry: Arc::new(self.registry),
            pool,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    config: RuntimeConfig,
    max_sources_per_request: usize,
    registry: Arc<SourceRegistry>,
    pool: Option<WorkerPool>,
}

impl Aggregator {
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn max_sources_per_request(&self) -> usize {
        self.max_sources_per_request
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.registry.describe()
    }

    /// Validates a request and resolves its sources.
    pub fn plan(&self, request: SourceRequest, source_ids: &[SourceId]) -> AggregatorResult<SessionPlan> {
        if request.prompt.trim().is_empty() {
            return Err(AggregatorError::InvalidRequest("prompt must not be empty".to_owned()));
        }
        if source_ids.is_empty() {
            return Err(AggregatorError::InvalidRequest(
                "at least one source is required".to_owned(),
            ));
        }
        if source_ids.len() > self.max_sources_per_request {
            return Err(AggregatorError::InvalidRequest(format!(
                "{} sources requested, at most {} allowed",
                source_ids.len(),
                self.max_sources_per_request
            )));
        }

        let mut seen = HashSet::with_capacity(source_ids.len());
        let mut plan = SessionPlan::new(request);
        for source_id in source_ids {
            if !seen.insert(source_id) {
                return Err(AggregatorError::InvalidRequest(format!(
                    "source {source_id} requested more than once"
                )));
            }
            plan = plan.source(source_id.clone(), self.registry.resolve(source_id)?);
        }
        Ok(plan)
    }

    /// Runs one request to completion on the current task.
    #[instrument(skip_all, fields(request_id = %request.request_id, sources = source_ids.len()))]
    pub async fn stream<S>(
        &self,
        request: SourceRequest,
        source_ids: &[SourceId],
        sink: &mut S,
        cancel: CancellationController,
    ) -> AggregatorResult<SessionReport>
    where
        S: EventSink + ?Sized,
    {
        let plan = self.plan(request, source_ids)?;
        self.emitter().run(plan, sink, cancel).await
    }

    /// Spawns the session and returns a handle for cancelling or awaiting it.
    ///
    /// Validation errors are returned before anything is spawned.
    pub fn start<S>(
        &self,
        request: SourceRequest,
        source_ids: &[SourceId],
        mut sink: S,
    ) -> AggregatorResult<StreamHandle>
    where
        S: EventSink + 'static,
    {
        let request_id = request.request_id.clone();
        let plan = self.plan(request, source_ids)?;
        let cancel = CancellationController::new();
        let emitter = self.emitter();
        let session_cancel = cancel.clone();
        let task = tokio::spawn(async move { emitter.run(plan, &mut sink, session_cancel).await });
        info!(request_id = %request_id, sources = source_ids.len(), "session started");
        Ok(StreamHandle {
            request_id,
            cancel,
            task,
        })
    }

    fn emitter(&self) -> StreamEmitter {
        let emitter = StreamEmitter::new(self.config.clone());
        match &self.pool {
            Some(pool) => emitter.with_pool(pool.clone()),
            None => emitter,
        }
    }
}

/// A running session spawned by [`Aggregator::start`].
#[derive(Debug)]
pub struct StreamHandle {
    request_id: RequestId,
    cancel: CancellationController,
    task: JoinHandle<AggregatorResult<SessionReport>>,
}

impl StreamHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Requests cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn canceller(&self) -> CancellationController {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> AggregatorResult<SessionReport> {
        match self.task.await {
            Ok(result) => result,
            Err(error) => {
                warn!(request_id = %self.request_id, %error, "session task did not complete");
                Err(AggregatorError::Aborted(error.to_string()))
            }
        }
    }
}
