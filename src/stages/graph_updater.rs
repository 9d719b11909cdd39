//! Knowledge-graph persistence stage.
//!
//! Builds a [`GraphDelta`] from the resolved records of the batch and merges
//! it into the graph store. Every node and edge carries a deterministic
//! identity key derived from its content (material formula, paper id,
//! property name), so rerunning the same batch converges to the same graph
//! instead of duplicating entries. A failed merge is recorded as an event
//! and the run continues.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::error::StageError;
use crate::storage::{identity_key, EdgeUpsert, GraphDelta, GraphStore, NodeUpsert};
use crate::workflow::context::{
    EventKind, ExtractionRecord, Node, RoutingDecision, StandardizedRecord, WorkflowContext,
};

/// Canonical keys persisted as Process nodes; everything else becomes a
/// Property node.
const PROCESS_KEYS: &[&str] = &["sintering_temp_c", "ball_milling_rpm"];

/// Stage handler for the `GraphUpdater` node.
pub struct GraphUpdaterStage {
    store: Arc<dyn GraphStore>,
    require_approval: bool,
}

impl GraphUpdaterStage {
    /// Creates the stage.
    pub fn new(store: Arc<dyn GraphStore>, require_approval: bool) -> Self {
        Self {
            store,
            require_approval,
        }
    }

    /// Merges the batch's resolved records into the knowledge graph.
    pub async fn run(&self, ctx: &mut WorkflowContext) -> Result<RoutingDecision, StageError> {
        if self.require_approval && !ctx.approved {
            ctx.record(
                EventKind::Skipped,
                Node::GraphUpdater,
                "batch not approved; graph not updated",
            );
            return Ok(RoutingDecision::done().with_reason("approval pending"));
        }

        let delta = build_delta(&ctx.standardized, &ctx.extracted);
        if delta.is_empty() {
            ctx.record(
                EventKind::Skipped,
                Node::GraphUpdater,
                "no resolved records to merge",
            );
            return Ok(RoutingDecision::done().with_reason("empty delta"));
        }

        ctx.graph_entries = delta.len();
        match self.store.merge(&delta).await {
            Ok(()) => {
                info!(
                    nodes = delta.nodes.len(),
                    edges = delta.edges.len(),
                    "graph merge complete"
                );
                Ok(RoutingDecision::done().with_reason(format!(
                    "{} nodes, {} edges merged",
                    delta.nodes.len(),
                    delta.edges.len()
                )))
            }
            Err(err) => {
                warn!(error = %err, "graph merge failed");
                ctx.record(
                    EventKind::PersistenceFailed,
                    Node::GraphUpdater,
                    format!("graph delta of {} entries not merged: {err}", delta.len()),
                );
                Ok(RoutingDecision::done().with_reason("graph merge failed"))
            }
        }
    }
}

/// Builds the graph delta for one batch.
///
/// Only records with `Resolved` review status contribute; a held-for-review
/// record never reaches the graph. The DOI on the Paper node comes from the
/// extraction record of the same document, when one exists.
pub fn build_delta(
    standardized: &[StandardizedRecord],
    extracted: &[ExtractionRecord],
) -> GraphDelta {
    let mut delta = GraphDelta::new();

    for record in standardized.iter().filter(|r| r.is_resolved()) {
        let Some(canonical) = record.canonical_key.as_deref() else {
            continue;
        };
        if record.material_id.is_empty() {
            continue;
        }

        let doi = extracted
            .iter()
            .find(|e| e.document_id == record.document_id)
            .map(|e| e.doi.clone())
            .unwrap_or_default();

        let material_key = identity_key(&["material", &record.material_id]);
        delta.push_node(NodeUpsert {
            key: material_key.clone(),
            label: "Material".to_string(),
            properties: BTreeMap::from([
                ("formula".to_string(), json!(record.material_id)),
            ]),
        });

        let paper_key = identity_key(&["paper", &record.document_id]);
        delta.push_node(NodeUpsert {
            key: paper_key.clone(),
            label: "Paper".to_string(),
            properties: BTreeMap::from([
                ("source_file".to_string(), json!(record.document_id)),
                ("doi".to_string(), json!(doi)),
            ]),
        });
        delta.push_edge(EdgeUpsert {
            key: identity_key(&["studied_in", &material_key, &paper_key]),
            relation: "STUDIED_IN".to_string(),
            from_key: material_key.clone(),
            to_key: paper_key,
        });

        let is_process = PROCESS_KEYS.contains(&canonical);
        let (label, relation, prefix) = if is_process {
            ("Process", "PROCESSED_BY", "process")
        } else {
            ("Property", "HAS_PROPERTY", "property")
        };

        let value_key = identity_key(&[prefix, &record.material_id, canonical]);
        delta.push_node(NodeUpsert {
            key: value_key.clone(),
            label: label.to_string(),
            properties: BTreeMap::from([
                ("type".to_string(), json!(canonical)),
                ("value".to_string(), json!(record.value)),
                ("unit".to_string(), json!(record.unit)),
            ]),
        });
        delta.push_edge(EdgeUpsert {
            key: identity_key(&[relation, &material_key, &value_key]),
            relation: relation.to_string(),
            from_key: material_key,
            to_key: value_key,
        });
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::storage::{GraphError, MaterialRanking, MemoryGraphStore};
    use crate::workflow::context::ReviewStatus;

    fn standardized(
        document: &str,
        material: &str,
        canonical: Option<&str>,
        value: f64,
        review: ReviewStatus,
    ) -> StandardizedRecord {
        StandardizedRecord {
            document_id: document.to_string(),
            material_id: material.to_string(),
            property: "raw".to_string(),
            canonical_key: canonical.map(|s| s.to_string()),
            value,
            unit: "mS/cm".to_string(),
            similarity: 0.9,
            review,
        }
    }

    #[test]
    fn test_delta_excludes_needs_review_records() {
        let records = vec![
            standardized(
                "p1",
                "Li6PS5Cl",
                Some("ionic_conductivity_ms_cm"),
                3.6,
                ReviewStatus::Resolved,
            ),
            standardized("p1", "Li6PS5Cl", None, 1.0, ReviewStatus::NeedsReview),
        ];

        let delta = build_delta(&records, &[]);

        // Material + Paper + one Property node, never anything from the
        // held record.
        assert_eq!(delta.nodes.len(), 3);
        assert_eq!(delta.edges.len(), 2);
        for node in &delta.nodes {
            if node.label == "Property" {
                assert_eq!(node.properties["type"], json!("ionic_conductivity_ms_cm"));
            }
        }
    }

    #[test]
    fn test_delta_splits_properties_and_processes() {
        let records = vec![
            standardized(
                "p1",
                "Li6PS5Cl",
                Some("ionic_conductivity_ms_cm"),
                3.6,
                ReviewStatus::Resolved,
            ),
            standardized(
                "p1",
                "Li6PS5Cl",
                Some("sintering_temp_c"),
                550.0,
                ReviewStatus::Resolved,
            ),
        ];

        let delta = build_delta(&records, &[]);

        let labels: Vec<&str> = delta.nodes.iter().map(|n| n.label.as_str()).collect();
        assert!(labels.contains(&"Property"));
        assert!(labels.contains(&"Process"));

        let relations: Vec<&str> = delta.edges.iter().map(|e| e.relation.as_str()).collect();
        assert!(relations.contains(&"HAS_PROPERTY"));
        assert!(relations.contains(&"PROCESSED_BY"));
    }

    #[test]
    fn test_delta_is_deterministic_across_builds() {
        let records = vec![standardized(
            "p1",
            "Li6PS5Cl",
            Some("ionic_conductivity_ms_cm"),
            3.6,
            ReviewStatus::Resolved,
        )];

        let first = build_delta(&records, &[]);
        let second = build_delta(&records, &[]);
        assert_eq!(first.nodes, second.nodes);
        assert_eq!(first.edges, second.edges);
    }

    #[test]
    fn test_delta_skips_records_without_material() {
        let records = vec![standardized(
            "p1",
            "",
            Some("ionic_conductivity_ms_cm"),
            3.6,
            ReviewStatus::Resolved,
        )];
        assert!(build_delta(&records, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_double_run_converges() {
        let store = Arc::new(MemoryGraphStore::new());
        let stage = GraphUpdaterStage::new(store.clone(), false);

        let mut ctx = WorkflowContext::for_request("extract");
        ctx.standardized.push(standardized(
            "p1",
            "Li6PS5Cl",
            Some("ionic_conductivity_ms_cm"),
            3.6,
            ReviewStatus::Resolved,
        ));

        stage.run(&mut ctx).await.unwrap();
        let nodes_after_first = store.node_count().await;
        stage.run(&mut ctx).await.unwrap();

        assert_eq!(store.node_count().await, nodes_after_first);
        assert_eq!(store.edge_count().await, 2);
    }

    /// Store that rejects every merge, for failure-isolation tests.
    struct OfflineStore;

    #[async_trait]
    impl GraphStore for OfflineStore {
        async fn merge(&self, _delta: &GraphDelta) -> Result<(), GraphError> {
            Err(GraphError::ConnectionFailed("graph offline".to_string()))
        }

        async fn top_materials(
            &self,
            _property: &str,
            _limit: usize,
        ) -> Result<Vec<MaterialRanking>, GraphError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_merge_failure_is_isolated() {
        let stage = GraphUpdaterStage::new(Arc::new(OfflineStore), false);

        let mut ctx = WorkflowContext::for_request("extract");
        ctx.standardized.push(standardized(
            "p1",
            "Li6PS5Cl",
            Some("ionic_conductivity_ms_cm"),
            3.6,
            ReviewStatus::Resolved,
        ));

        let decision = stage.run(&mut ctx).await.unwrap();

        assert_eq!(decision.decision, crate::workflow::context::Decision::Done);
        assert!(ctx
            .events
            .iter()
            .any(|e| e.kind == EventKind::PersistenceFailed));
        // Records stay intact for the final report.
        assert_eq!(ctx.standardized.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_merge() {
        let store = Arc::new(MemoryGraphStore::new());
        let stage = GraphUpdaterStage::new(store.clone(), false);
        let mut ctx = WorkflowContext::for_request("extract");

        stage.run(&mut ctx).await.unwrap();

        assert_eq!(store.node_count().await, 0);
        assert!(ctx.events.iter().any(|e| e.kind == EventKind::Skipped));
    }
}
