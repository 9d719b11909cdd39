//! Reporting stage: read-only approval projection.
//!
//! Summarizes accepted vs held-for-review records for the batch. The report
//! is derived entirely from the standardized records and never feeds back
//! into them.

use crate::error::StageError;
use crate::workflow::context::{
    ApprovalReport, Node, RoutingDecision, SchemaMapping, StandardizedRecord, WorkflowContext,
};

/// Number of records shown in the report preview.
const PREVIEW_ROWS: usize = 3;

/// Stage handler for the `Reporter` node.
#[derive(Debug, Default)]
pub struct ReporterStage;

impl ReporterStage {
    /// Creates the stage.
    pub fn new() -> Self {
        Self
    }

    /// Builds the approval report and stores it on the context.
    pub async fn run(&self, ctx: &mut WorkflowContext) -> Result<RoutingDecision, StageError> {
        let report = build_report(&ctx.standardized);
        tracing::info!(
            accepted = report.accepted,
            needs_review = report.needs_review,
            "approval report generated"
        );
        tracing::debug!(node = %Node::Reporter, "\n{}", report.render());
        ctx.report = Some(report);
        Ok(RoutingDecision::done())
    }
}

/// Projects a standardized batch into an [`ApprovalReport`].
pub fn build_report(records: &[StandardizedRecord]) -> ApprovalReport {
    let accepted = records.iter().filter(|r| r.is_resolved()).count();
    let needs_review = records.len() - accepted;

    let mut mappings: Vec<SchemaMapping> = Vec::new();
    for record in records.iter().filter(|r| r.is_resolved()) {
        if let Some(canonical) = &record.canonical_key {
            if !mappings.iter().any(|m| m.raw == record.property) {
                mappings.push(SchemaMapping {
                    raw: record.property.clone(),
                    canonical: canonical.clone(),
                    score: record.similarity,
                });
            }
        }
    }

    let mut unresolved_fields: Vec<String> = Vec::new();
    for record in records.iter().filter(|r| !r.is_resolved()) {
        if !unresolved_fields.contains(&record.property) {
            unresolved_fields.push(record.property.clone());
        }
    }

    let mut preview: Vec<String> = records
        .iter()
        .take(PREVIEW_ROWS)
        .map(|r| {
            format!(
                "[{}] {}: {} = {} {} ({})",
                r.document_id, r.material_id, r.property, r.value, r.unit, r.review
            )
        })
        .collect();
    if records.len() > PREVIEW_ROWS {
        preview.push(format!("... and {} more records", records.len() - PREVIEW_ROWS));
    }

    ApprovalReport {
        accepted,
        needs_review,
        mappings,
        unresolved_fields,
        preview,
    }
}
