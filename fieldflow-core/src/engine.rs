//! Computed Engine
//!
//! Wires the graph cache, plan compiler, executor and outbox together. The
//! write path calls [`ComputedEngine::enqueue`]; workers call
//! [`ComputedEngine::process`] for each claimed task.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{ConfigError, Result};
use crate::executor::{ComputedFieldUpdater, ExecutionReport};
use crate::graph::{DependencyGraph, GraphCache};
use crate::ids::{BaseId, TaskId};
use crate::outbox::OutboxStore;
use crate::plan::{ComputedSeed, ExecutionPlan, PlanCompiler, PlanTrace};
use crate::ports::{ChangeSink, EngineEvent, EngineEventHandler, Evaluator, RecordRepository};

pub struct ComputedEngine {
    config: EngineConfig,
    repository: Arc<dyn RecordRepository>,
    outbox: Arc<dyn OutboxStore>,
    graphs: GraphCache,
    updater: ComputedFieldUpdater,
    handlers: RwLock<Vec<Arc<dyn EngineEventHandler>>>,
}

impl ComputedEngine {
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn RecordRepository>,
        evaluator: Arc<dyn Evaluator>,
        outbox: Arc<dyn OutboxStore>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let updater = ComputedFieldUpdater::new(Arc::clone(&repository), evaluator)
            .with_write_chunk_size(config.write_chunk_size);

        Ok(Self {
            config,
            repository,
            outbox,
            graphs: GraphCache::new(),
            updater,
            handlers: RwLock::new(Vec::new()),
        })
    }

    /// Publish committed values to `sink`, unless `emit_changes` is off.
    pub fn with_change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        if self.config.emit_changes {
            self.updater = self.updater.with_change_sink(sink);
        }
        self
    }

    pub fn register_handler(&self, handler: Arc<dyn EngineEventHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn outbox(&self) -> &Arc<dyn OutboxStore> {
        &self.outbox
    }

    pub fn graphs(&self) -> &GraphCache {
        &self.graphs
    }

    /// Write path: queue the change. Returns as soon as the task is stored.
    pub async fn enqueue(&self, seed: &ComputedSeed) -> Result<TaskId> {
        Ok(self.outbox.enqueue(seed).await?)
    }

    /// Drop the cached dependency graph after a field or link schema change.
    pub fn invalidate_schema(&self, base_id: &BaseId) {
        self.graphs.invalidate(base_id);
    }

    /// Compile the plan for `seed` against the base's current graph.
    pub async fn compile(&self, seed: &ComputedSeed) -> Result<(Arc<DependencyGraph>, ExecutionPlan)> {
        let graph = self
            .graphs
            .get_or_load(&seed.base_id, self.repository.as_ref())
            .await?;
        let plan = PlanCompiler::new(&graph).compile(seed)?;
        Ok((graph, plan))
    }

    /// Compile and execute one seed, recomputing everything it reaches.
    ///
    /// A seed that cannot affect anything completes without loading the graph
    /// or touching the repository.
    pub async fn process(&self, seed: &ComputedSeed) -> Result<ExecutionReport> {
        if seed.is_noop() {
            let plan = ExecutionPlan::empty(seed);
            self.trace(&plan);
            debug!(table_id = %seed.table_id, "seed has no records; nothing to do");
            return Ok(ExecutionReport {
                plan,
                updated_cells: 0,
                cell_errors: 0,
            });
        }

        let (graph, plan) = self.compile(seed).await?;
        self.trace(&plan);
        Ok(self.updater.execute(&graph, seed, plan).await?)
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler.handle(&event);
        }
    }

    fn trace(&self, plan: &ExecutionPlan) {
        let trace = PlanTrace::from(plan);
        trace.log();
        self.emit(EngineEvent::PlanCompiled(trace));
    }
}
