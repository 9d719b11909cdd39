//! Analysis stage: statistics over previously persisted data.
//!
//! Reached only through the supervisor, never from the extraction chain.
//! Computes a data summary, Pearson correlations against the target
//! property, and a graph-pattern ranking, then hands the rendered result
//! back for the supervisor to format as the final response. The analyzer
//! routes only toward the terminal side of the graph; it can never start
//! an extraction.

use std::sync::Arc;

use tracing::{info, warn};

use crate::analysis::{correlations, render_correlation_table, render_summary};
use crate::error::{AnalysisError, StageError};
use crate::storage::{GraphStore, PropertyStore};
use crate::workflow::context::{EventKind, Node, RoutingDecision, WorkflowContext};

/// Materials shown in the graph-pattern ranking.
const TOP_MATERIALS: usize = 10;

/// Stage handler for the `Analyzer` node.
pub struct AnalyzerStage {
    store: Arc<dyn PropertyStore>,
    graph: Arc<dyn GraphStore>,
    target_property: String,
}

impl AnalyzerStage {
    /// Creates the stage.
    pub fn new(
        store: Arc<dyn PropertyStore>,
        graph: Arc<dyn GraphStore>,
        target_property: impl Into<String>,
    ) -> Self {
        Self {
            store,
            graph,
            target_property: target_property.into(),
        }
    }

    /// Runs the analyses selected by the user request and stores the
    /// rendered result on the context.
    pub async fn run(&self, ctx: &mut WorkflowContext) -> Result<RoutingDecision, StageError> {
        let request = ctx.user_request.to_lowercase();
        let mut sections = Vec::new();

        let rows = match self.store.fetch_rows().await {
            Ok(rows) => rows,
            Err(err) => {
                // A read failure ends the analysis, not the run.
                ctx.record(
                    EventKind::PersistenceFailed,
                    Node::Analyzer,
                    format!("row store unavailable: {err}"),
                );
                ctx.analysis = Some("Persisted data is unavailable; analysis skipped.".to_string());
                return Ok(RoutingDecision::done().with_reason("row store unavailable"));
            }
        };

        let wants_correlation = request.contains("correlat");
        let wants_summary = request.contains("summary") || request.contains("statistic");
        let wants_patterns = request.contains("pattern");
        let run_all = !(wants_correlation || wants_summary || wants_patterns);

        if wants_summary || run_all {
            sections.push(render_summary(&rows));
        }

        if wants_correlation || run_all {
            match correlations(&rows, &self.target_property) {
                Ok(results) => {
                    sections.push(render_correlation_table(&self.target_property, &results));
                }
                Err(AnalysisError::NoData) => {
                    sections.push("No persisted data found. Run extraction first.".to_string());
                }
                Err(err) => sections.push(err.to_string()),
            }
        }

        if wants_patterns || run_all {
            sections.push(self.graph_patterns().await);
        }

        info!(sections = sections.len(), "analysis complete");
        ctx.analysis = Some(sections.join("\n\n---\n\n"));
        Ok(RoutingDecision::done().with_reason("analysis complete"))
    }

    async fn graph_patterns(&self) -> String {
        match self.graph.top_materials(&self.target_property, TOP_MATERIALS).await {
            Ok(rankings) if rankings.is_empty() => {
                format!("No materials found with property '{}'.", self.target_property)
            }
            Ok(rankings) => {
                let mut out = format!(
                    "Top {} materials by {}:\n\n| Material | Value |\n|----------|-------|\n",
                    rankings.len(),
                    self.target_property
                );
                for r in &rankings {
                    out.push_str(&format!("| {} | {} {} |\n", r.material, r.value, r.unit));
                }
                out
            }
            Err(err) => {
                warn!(error = %err, "graph pattern query failed");
                format!("Graph analysis skipped: {err}")
            }
        }
    }
}
