//! Row-store persistence stage.
//!
//! Appends resolved records to the property store. Rows are keyed by
//! (document, material, property), so re-applying the same batch writes
//! nothing new. A failed write is recorded as an event and the run
//! continues; the final report marks the affected records as unpersisted.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::StageError;
use crate::storage::{PropertyRow, PropertyStore};
use crate::workflow::context::{EventKind, Node, RoutingDecision, WorkflowContext};

/// Stage handler for the `DBUpdater` node.
pub struct DbUpdaterStage {
    store: Arc<dyn PropertyStore>,
    require_approval: bool,
}

impl DbUpdaterStage {
    /// Creates the stage.
    pub fn new(store: Arc<dyn PropertyStore>, require_approval: bool) -> Self {
        Self {
            store,
            require_approval,
        }
    }

    /// Persists resolved records as property rows.
    pub async fn run(&self, ctx: &mut WorkflowContext) -> Result<RoutingDecision, StageError> {
        if self.require_approval && !ctx.approved {
            ctx.record(
                EventKind::Skipped,
                Node::DbUpdater,
                "batch not approved; rows not persisted",
            );
            return Ok(RoutingDecision::done().with_reason("approval pending"));
        }

        let rows: Vec<PropertyRow> = ctx
            .standardized
            .iter()
            .filter(|r| r.is_resolved())
            .filter_map(|r| {
                r.canonical_key.as_ref().map(|canonical| PropertyRow {
                    document_id: r.document_id.clone(),
                    material_id: r.material_id.clone(),
                    property: canonical.clone(),
                    value: r.value,
                    unit: r.unit.clone(),
                })
            })
            .collect();

        if rows.is_empty() {
            ctx.record(
                EventKind::Skipped,
                Node::DbUpdater,
                "no resolved records to persist",
            );
            return Ok(RoutingDecision::done().with_reason("no rows"));
        }

        let mut inserted = 0usize;
        let mut replayed = 0usize;
        let mut failed = 0usize;

        for row in &rows {
            match self.store.append_row(row).await {
                Ok(true) => inserted += 1,
                Ok(false) => replayed += 1,
                Err(err) => {
                    warn!(key = %row.key(), error = %err, "row write failed");
                    ctx.record(
                        EventKind::PersistenceFailed,
                        Node::DbUpdater,
                        format!("row '{}' not persisted: {err}", row.key()),
                    );
                    failed += 1;
                }
            }
        }

        ctx.rows_written += inserted;
        ctx.rows_unpersisted += failed;

        info!(inserted, replayed, failed, "row persistence complete");
        Ok(RoutingDecision::done()
            .with_reason(format!("{inserted} inserted, {replayed} replayed, {failed} failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::storage::{DatabaseError, MemoryPropertyStore};
    use crate::workflow::context::{ReviewStatus, StandardizedRecord, WorkflowContext};

    fn resolved(document: &str, property: &str, value: f64) -> StandardizedRecord {
        StandardizedRecord {
            document_id: document.to_string(),
            material_id: "Li6PS5Cl".to_string(),
            property: "raw_name".to_string(),
            canonical_key: Some(property.to_string()),
            value,
            unit: "mS/cm".to_string(),
            similarity: 0.95,
            review: ReviewStatus::Resolved,
        }
    }

    fn held(document: &str) -> StandardizedRecord {
        StandardizedRecord {
            document_id: document.to_string(),
            material_id: "Li6PS5Cl".to_string(),
            property: "mystery".to_string(),
            canonical_key: None,
            value: 1.0,
            unit: String::new(),
            similarity: 0.2,
            review: ReviewStatus::NeedsReview,
        }
    }

    #[tokio::test]
    async fn test_persists_only_resolved_records() {
        let store = Arc::new(MemoryPropertyStore::new());
        let stage = DbUpdaterStage::new(store.clone(), false);

        let mut ctx = WorkflowContext::for_request("extract");
        ctx.standardized
            .push(resolved("p1", "ionic_conductivity_ms_cm", 3.6));
        ctx.standardized.push(held("p1"));

        stage.run(&mut ctx).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(ctx.rows_written, 1);
        let rows = store.fetch_rows().await.unwrap();
        assert_eq!(rows[0].property, "ionic_conductivity_ms_cm");
    }

    #[tokio::test]
    async fn test_double_apply_is_idempotent() {
        let store = Arc::new(MemoryPropertyStore::new());
        let stage = DbUpdaterStage::new(store.clone(), false);

        let mut ctx = WorkflowContext::for_request("extract");
        ctx.standardized
            .push(resolved("p1", "ionic_conductivity_ms_cm", 3.6));
        ctx.standardized
            .push(resolved("p1", "activation_energy_ev", 0.3));

        stage.run(&mut ctx).await.unwrap();
        stage.run(&mut ctx).await.unwrap();

        assert_eq!(store.len().await, 2);
        // Second pass replayed, inserted nothing.
        assert_eq!(ctx.rows_written, 2);
        assert_eq!(ctx.rows_unpersisted, 0);
    }

    #[tokio::test]
    async fn test_approval_gate_blocks_persistence() {
        let store = Arc::new(MemoryPropertyStore::new());
        let stage = DbUpdaterStage::new(store.clone(), true);

        let mut ctx = WorkflowContext::for_request("extract");
        ctx.approved = false;
        ctx.standardized
            .push(resolved("p1", "ionic_conductivity_ms_cm", 3.6));

        let decision = stage.run(&mut ctx).await.unwrap();

        assert!(store.is_empty().await);
        assert_eq!(decision.reason.as_deref(), Some("approval pending"));
        assert!(ctx.events.iter().any(|e| e.kind == EventKind::Skipped));
    }

    /// Store that fails every write, for failure-isolation tests.
    struct FailingStore;

    #[async_trait]
    impl PropertyStore for FailingStore {
        async fn append_row(&self, _row: &PropertyRow) -> Result<bool, DatabaseError> {
            Err(DatabaseError::ConnectionFailed("store offline".to_string()))
        }

        async fn fetch_rows(&self) -> Result<Vec<PropertyRow>, DatabaseError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_isolated() {
        let stage = DbUpdaterStage::new(Arc::new(FailingStore), false);

        let mut ctx = WorkflowContext::for_request("extract");
        ctx.standardized
            .push(resolved("p1", "ionic_conductivity_ms_cm", 3.6));
        let records_before = ctx.standardized.clone();

        let decision = stage.run(&mut ctx).await.unwrap();

        // Run continues: the stage still reports Done, the failure is an
        // event, and the in-memory records are untouched.
        assert_eq!(decision.decision, crate::workflow::context::Decision::Done);
        assert_eq!(ctx.rows_unpersisted, 1);
        assert_eq!(ctx.standardized.len(), records_before.len());
        assert!(ctx
            .events
            .iter()
            .any(|e| e.kind == EventKind::PersistenceFailed));
    }
}
