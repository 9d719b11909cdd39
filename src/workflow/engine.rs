//! Workflow engine: the directed-graph executor.
//!
//! The engine owns the static edge table of the workflow graph and drives
//! one run to completion: read the current node, dispatch the stage handler
//! keyed by it, map the returned [`RoutingDecision`] over the edge table,
//! advance. Stages are tagged variants dispatched by a match on the node,
//! not a handler class hierarchy.
//!
//! Termination is guaranteed twice over: every cyclic stage carries its own
//! budget, and the engine enforces a hard transition cap independent of any
//! stage-level budget. A stage failure never propagates as an unhandled
//! fault; it is recorded and the run finishes at the terminal node with the
//! partial-failure flag set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::error::StageError;
use crate::llm::{DocumentExtractor, LanguageModel};
use crate::schema::{CosineSchemaIndex, HashEmbedder, SchemaIndex};
use crate::stages::{
    AnalyzerStage, DbUpdaterStage, ExtractorStage, GraphUpdaterStage, ReporterStage,
    StandardizerStage,
};
use crate::storage::{GraphStore, MemoryGraphStore, MemoryPropertyStore, PropertyStore};
use crate::units::{SiUnitConverter, UnitConverter};
use crate::workflow::config::{ConfigError, WorkflowConfig};
use crate::workflow::context::{
    Decision, EventKind, Node, RoutingDecision, RunReport, Transition, WorkflowContext,
};
use crate::workflow::router::Router;

/// Cooperative cancellation signal, checked at stage boundaries only.
///
/// Mid-stage cancellation could leave records half standardized or half
/// persisted, so the engine polls the token between stages; a cancelled run
/// finishes as a partial-failure result instead of disappearing.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation at the next stage boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The external collaborators a run consumes.
///
/// Everything the core calls out to lives behind one of these traits; the
/// engine itself contains no model, conversion, search, or persistence
/// logic.
pub struct Collaborators {
    /// Per-document structured extraction.
    pub extractor: Arc<dyn DocumentExtractor>,
    /// Numeric unit normalization.
    pub units: Arc<dyn UnitConverter>,
    /// Canonical-schema similarity search.
    pub schema: Arc<dyn SchemaIndex>,
    /// Idempotent row store.
    pub rows: Arc<dyn PropertyStore>,
    /// Idempotent knowledge-graph store.
    pub graph: Arc<dyn GraphStore>,
    /// Optional chat model for supervisor intent classification.
    pub model: Option<Arc<dyn LanguageModel>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("model", &self.model.is_some())
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Wires the default in-process collaborators around the given
    /// extractor: table-driven unit conversion, a cosine index over the
    /// configured canonical columns, and in-memory stores. Used by tests
    /// and local dry runs.
    pub fn in_memory(extractor: Arc<dyn DocumentExtractor>, config: &WorkflowConfig) -> Self {
        Self {
            extractor,
            units: Arc::new(SiUnitConverter::new()),
            schema: Arc::new(CosineSchemaIndex::new(
                Arc::new(HashEmbedder::default()),
                &config.canonical_columns,
            )),
            rows: Arc::new(MemoryPropertyStore::new()),
            graph: Arc::new(MemoryGraphStore::new()),
            model: None,
        }
    }
}

/// Outgoing edge set per node, as enumerated by the state machine.
///
/// The engine refuses to advance along any edge not listed here.
pub fn allowed_targets(node: Node) -> &'static [Node] {
    match node {
        Node::Start => &[Node::Supervisor],
        Node::Supervisor => &[Node::Extractor, Node::Analyzer, Node::End],
        Node::Extractor => &[Node::Extractor, Node::Standardizer],
        Node::Standardizer => &[Node::Reporter],
        Node::Reporter => &[Node::DbUpdater],
        Node::DbUpdater => &[Node::GraphUpdater],
        Node::GraphUpdater => &[Node::Supervisor],
        Node::Analyzer => &[Node::Supervisor],
        Node::End => &[],
    }
}

/// Default outgoing edge taken on `Decision::Done`.
fn default_target(node: Node) -> Option<Node> {
    match node {
        Node::Start => Some(Node::Supervisor),
        Node::Extractor => Some(Node::Standardizer),
        Node::Standardizer => Some(Node::Reporter),
        Node::Reporter => Some(Node::DbUpdater),
        Node::DbUpdater => Some(Node::GraphUpdater),
        Node::GraphUpdater => Some(Node::Supervisor),
        Node::Analyzer => Some(Node::Supervisor),
        // The supervisor always picks an explicit edge; End has none.
        Node::Supervisor | Node::End => None,
    }
}

/// Maps a stage's decision onto the edge table.
fn resolve_edge(node: Node, decision: &Decision) -> Result<Node, String> {
    let target = match decision {
        Decision::Continue => node,
        Decision::Done => {
            default_target(node).ok_or_else(|| format!("node {node} has no default edge"))?
        }
        Decision::Next(target) => *target,
    };

    if allowed_targets(node).contains(&target) {
        Ok(target)
    } else {
        Err(format!("no edge {node} -> {target} in the workflow graph"))
    }
}

/// The directed-graph executor for one workflow.
///
/// An engine is cheap to share: all collaborators are behind `Arc`s and a
/// run owns its own [`WorkflowContext`], so multiple independent runs may
/// execute concurrently on one engine.
pub struct WorkflowEngine {
    config: WorkflowConfig,
    router: Router,
    extractor: ExtractorStage,
    standardizer: StandardizerStage,
    reporter: ReporterStage,
    db_updater: DbUpdaterStage,
    graph_updater: GraphUpdaterStage,
    analyzer: AnalyzerStage,
}

impl WorkflowEngine {
    /// Builds an engine from a validated configuration and its
    /// collaborators.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the configuration is invalid. This is the
    /// only failure class that prevents a run from starting; everything
    /// later is handled inside the run loop.
    pub fn new(config: WorkflowConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut router = Router::new();
        if let Some(model) = &collaborators.model {
            router = router.with_model(model.clone(), config.model.clone());
        }

        Ok(Self {
            extractor: ExtractorStage::new(
                collaborators.extractor,
                config.canonical_columns.clone(),
                config.retry_budget,
                config.extract_concurrency,
            ),
            standardizer: StandardizerStage::new(
                collaborators.units,
                collaborators.schema,
                config.similarity_threshold,
            ),
            reporter: ReporterStage::new(),
            db_updater: DbUpdaterStage::new(collaborators.rows.clone(), config.require_approval),
            graph_updater: GraphUpdaterStage::new(
                collaborators.graph.clone(),
                config.require_approval,
            ),
            analyzer: AnalyzerStage::new(
                collaborators.rows,
                collaborators.graph,
                config.target_property.clone(),
            ),
            router,
            config,
        })
    }

    /// The engine's configuration.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Runs the workflow to its terminal node.
    pub async fn run(&self, ctx: WorkflowContext) -> RunReport {
        self.run_with_cancel(ctx, CancelToken::new()).await
    }

    /// Runs the workflow, polling `cancel` at every stage boundary.
    pub async fn run_with_cancel(
        &self,
        mut ctx: WorkflowContext,
        cancel: CancelToken,
    ) -> RunReport {
        let started = Instant::now();
        ctx.retries_remaining = self.config.retry_budget;
        info!(run_id = %ctx.run_id, queued = ctx.initial_queue_len, "workflow run started");

        while ctx.current_node != Node::End {
            if cancel.is_cancelled() {
                warn!(run_id = %ctx.run_id, node = %ctx.current_node, "run cancelled");
                ctx.record(
                    EventKind::Aborted,
                    ctx.current_node,
                    "run cancelled at stage boundary",
                );
                self.fault_transition(&mut ctx, "cancelled");
                break;
            }

            if ctx.transitions >= self.config.max_transitions {
                warn!(
                    run_id = %ctx.run_id,
                    transitions = ctx.transitions,
                    "transition guard fired"
                );
                ctx.record(
                    EventKind::TransitionLimit,
                    ctx.current_node,
                    format!(
                        "transition cap of {} reached; terminating run",
                        self.config.max_transitions
                    ),
                );
                self.fault_transition(&mut ctx, "transition cap reached");
                break;
            }

            let node = ctx.current_node;
            let decision = match self.dispatch(node, &mut ctx).await {
                Ok(decision) => decision,
                Err(err) => {
                    error!(run_id = %ctx.run_id, node = %node, error = %err, "stage failed");
                    ctx.record(EventKind::StageFailed, node, err.to_string());
                    self.fault_transition(&mut ctx, "stage failed");
                    break;
                }
            };

            match resolve_edge(node, &decision.decision) {
                Ok(next) => self.advance(&mut ctx, next, decision.reason),
                Err(message) => {
                    error!(run_id = %ctx.run_id, node = %node, %message, "illegal edge");
                    ctx.record(EventKind::StageFailed, node, message);
                    self.fault_transition(&mut ctx, "illegal edge");
                    break;
                }
            }
        }

        let report = RunReport::from_context(&ctx, started.elapsed());
        info!(
            run_id = %ctx.run_id,
            processed = report.processed,
            skipped = report.skipped,
            partial_failure = report.partial_failure,
            elapsed_ms = report.elapsed_ms,
            "workflow run finished"
        );
        report
    }

    async fn dispatch(
        &self,
        node: Node,
        ctx: &mut WorkflowContext,
    ) -> Result<RoutingDecision, StageError> {
        match node {
            Node::Start => Ok(RoutingDecision::done()),
            Node::Supervisor => Ok(self.router.decide(ctx).await),
            Node::Extractor => self.extractor.run(ctx).await,
            Node::Standardizer => self.standardizer.run(ctx).await,
            Node::Reporter => self.reporter.run(ctx).await,
            Node::DbUpdater => self.db_updater.run(ctx).await,
            Node::GraphUpdater => self.graph_updater.run(ctx).await,
            Node::Analyzer => self.analyzer.run(ctx).await,
            Node::End => Ok(RoutingDecision::done()),
        }
    }

    /// Takes one edge and emits its trace event.
    fn advance(&self, ctx: &mut WorkflowContext, next: Node, reason: Option<String>) {
        info!(
            run_id = %ctx.run_id,
            from = %ctx.current_node,
            to = %next,
            reason = reason.as_deref().unwrap_or(""),
            "transition"
        );
        ctx.trace.push(Transition {
            from: ctx.current_node,
            to: next,
            reason,
        });
        ctx.transitions += 1;
        ctx.current_node = next;
    }

    /// Jumps to the terminal node outside the edge table after a fault,
    /// marking the run as a partial failure.
    fn fault_transition(&self, ctx: &mut WorkflowContext, reason: &str) {
        ctx.partial_failure = true;
        ctx.trace.push(Transition {
            from: ctx.current_node,
            to: Node::End,
            reason: Some(reason.to_string()),
        });
        ctx.current_node = Node::End;
    }
}
