//! Standardization stage: unit conversion plus schema mapping.
//!
//! Two sequential transforms over the extracted batch: values are first
//! normalized to canonical units, then each raw field name is resolved
//! against the canonical-schema index. Fields whose best match scores below
//! the similarity threshold are kept with a `NeedsReview` status, held for
//! approval; they are never dropped and never passed to the persistence
//! sinks.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::StageError;
use crate::schema::SchemaIndex;
use crate::units::UnitConverter;
use crate::workflow::context::{
    EventKind, Node, ReviewStatus, RoutingDecision, StandardizedRecord, WorkflowContext,
};

/// Stage handler for the `Standardizer` node.
pub struct StandardizerStage {
    units: Arc<dyn UnitConverter>,
    schema: Arc<dyn SchemaIndex>,
    similarity_threshold: f64,
}

impl StandardizerStage {
    /// Creates the stage.
    pub fn new(
        units: Arc<dyn UnitConverter>,
        schema: Arc<dyn SchemaIndex>,
        similarity_threshold: f64,
    ) -> Self {
        Self {
            units,
            schema,
            similarity_threshold,
        }
    }

    /// Standardizes the extracted batch into `ctx.standardized`.
    ///
    /// Pure with respect to the extraction records: they are read, never
    /// mutated.
    pub async fn run(&self, ctx: &mut WorkflowContext) -> Result<RoutingDecision, StageError> {
        let records = ctx.extracted.clone();
        if records.iter().all(|r| !r.is_succeeded()) {
            ctx.record(
                EventKind::Skipped,
                Node::Standardizer,
                "no successful extractions to standardize",
            );
            return Ok(RoutingDecision::done().with_reason("nothing to standardize"));
        }

        let mut standardized = Vec::new();
        let mut events = Vec::new();

        for record in records.iter().filter(|r| r.is_succeeded()) {
            for (field, raw_value) in &record.fields {
                let (value, unit) = match self.units.convert(raw_value.value, &raw_value.unit) {
                    Some(converted) => converted,
                    None => {
                        events.push(format!(
                            "unrecognized unit '{}' on '{}' from '{}'; value kept as-is",
                            raw_value.unit, field, record.document_id
                        ));
                        (raw_value.value, raw_value.unit.clone())
                    }
                };

                let (canonical_key, similarity, review) = match self.schema.best_match(field) {
                    Some((key, score)) if score >= self.similarity_threshold => {
                        debug!(field = %field, canonical = %key, score, "schema mapping accepted");
                        (Some(key), score, ReviewStatus::Resolved)
                    }
                    Some((key, score)) => {
                        debug!(field = %field, candidate = %key, score, "schema mapping below threshold");
                        (None, score, ReviewStatus::NeedsReview)
                    }
                    None => (None, 0.0, ReviewStatus::NeedsReview),
                };

                standardized.push(StandardizedRecord {
                    document_id: record.document_id.clone(),
                    material_id: record.material_id.clone(),
                    property: field.clone(),
                    canonical_key,
                    value,
                    unit,
                    similarity,
                    review,
                });
            }
        }

        let held: usize = standardized.iter().filter(|r| !r.is_resolved()).count();
        let resolved = standardized.len() - held;

        for message in events {
            ctx.record(EventKind::Info, Node::Standardizer, message);
        }
        if held > 0 {
            ctx.record(
                EventKind::NeedsReview,
                Node::Standardizer,
                format!("{held} records held for manual review"),
            );
        }

        info!(resolved, held, "standardization complete");
        ctx.standardized = standardized;

        Ok(RoutingDecision::done().with_reason(format!("{resolved} resolved, {held} held")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::units::SiUnitConverter;
    use crate::workflow::context::{ExtractedValue, ExtractionRecord, ExtractionStatus};

    /// Index with fixed scores per field, for deterministic threshold tests.
    struct FixedIndex {
        scores: BTreeMap<String, (String, f64)>,
    }

    impl FixedIndex {
        fn new(entries: &[(&str, &str, f64)]) -> Self {
            let scores = entries
                .iter()
                .map(|(raw, canonical, score)| {
                    ((*raw).to_string(), ((*canonical).to_string(), *score))
                })
                .collect();
            Self { scores }
        }
    }

    impl SchemaIndex for FixedIndex {
        fn matches(&self, field: &str, _k: usize) -> Vec<(String, f64)> {
            self.scores.get(field).cloned().into_iter().collect()
        }

        fn canonical_keys(&self) -> Vec<String> {
            self.scores.values().map(|(key, _)| key.clone()).collect()
        }
    }

    fn record(document: &str, fields: &[(&str, f64, &str)]) -> ExtractionRecord {
        ExtractionRecord {
            document_id: document.to_string(),
            doi: String::new(),
            material_id: "Li6PS5Cl".to_string(),
            fields: fields
                .iter()
                .map(|(name, value, unit)| {
                    ((*name).to_string(), ExtractedValue::new(*value, *unit))
                })
                .collect(),
            conditions: BTreeMap::new(),
            confidence: 0.9,
            status: ExtractionStatus::Succeeded,
            attempts: 1,
        }
    }

    fn stage_with(index: FixedIndex, threshold: f64) -> StandardizerStage {
        StandardizerStage::new(Arc::new(SiUnitConverter::new()), Arc::new(index), threshold)
    }

    #[tokio::test]
    async fn test_units_and_mapping_resolved() {
        let index = FixedIndex::new(&[("ionic_cond", "ionic_conductivity_ms_cm", 0.95)]);
        let stage = stage_with(index, 0.85);

        let mut ctx = crate::workflow::context::WorkflowContext::for_request("extract");
        ctx.extracted
            .push(record("paper-1", &[("ionic_cond", 3.6e-3, "S/cm")]));

        stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.standardized.len(), 1);
        let r = &ctx.standardized[0];
        assert_eq!(r.canonical_key.as_deref(), Some("ionic_conductivity_ms_cm"));
        assert!((r.value - 3.6).abs() < 1e-9);
        assert_eq!(r.unit, "mS/cm");
        assert_eq!(r.review, ReviewStatus::Resolved);
    }

    #[tokio::test]
    async fn test_below_threshold_is_held_for_review() {
        let index = FixedIndex::new(&[("mystery", "ionic_conductivity_ms_cm", 0.4)]);
        let stage = stage_with(index, 0.85);

        let mut ctx = crate::workflow::context::WorkflowContext::for_request("extract");
        ctx.extracted.push(record("paper-1", &[("mystery", 1.0, "")]));

        stage.run(&mut ctx).await.unwrap();

        let r = &ctx.standardized[0];
        assert_eq!(r.review, ReviewStatus::NeedsReview);
        assert!(r.canonical_key.is_none());
        assert!((r.similarity - 0.4).abs() < 1e-9);
        // Held, not dropped.
        assert_eq!(ctx.standardized.len(), 1);
        assert!(ctx
            .events
            .iter()
            .any(|e| e.kind == EventKind::NeedsReview));
    }

    #[tokio::test]
    async fn test_unknown_unit_kept_with_event() {
        let index = FixedIndex::new(&[("odd_field", "grain_size_um", 0.9)]);
        let stage = stage_with(index, 0.85);

        let mut ctx = crate::workflow::context::WorkflowContext::for_request("extract");
        ctx.extracted
            .push(record("paper-1", &[("odd_field", 7.0, "cubits")]));

        stage.run(&mut ctx).await.unwrap();

        let r = &ctx.standardized[0];
        assert!((r.value - 7.0).abs() < 1e-9);
        assert_eq!(r.unit, "cubits");
        assert!(ctx.events.iter().any(|e| e.message.contains("cubits")));
    }

    #[tokio::test]
    async fn test_extraction_records_not_mutated() {
        let index = FixedIndex::new(&[("ionic_cond", "ionic_conductivity_ms_cm", 0.95)]);
        let stage = stage_with(index, 0.85);

        let mut ctx = crate::workflow::context::WorkflowContext::for_request("extract");
        ctx.extracted
            .push(record("paper-1", &[("ionic_cond", 3.6e-3, "S/cm")]));
        let before = ctx.extracted.clone();

        stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.extracted.len(), before.len());
        assert_eq!(
            ctx.extracted[0].fields["ionic_cond"],
            before[0].fields["ionic_cond"]
        );
    }

    #[tokio::test]
    async fn test_empty_batch_skips() {
        let index = FixedIndex::new(&[]);
        let stage = stage_with(index, 0.85);
        let mut ctx = crate::workflow::context::WorkflowContext::for_request("extract");

        let decision = stage.run(&mut ctx).await.unwrap();
        assert_eq!(decision.decision, crate::workflow::context::Decision::Done);
        assert!(ctx.standardized.is_empty());
        assert!(ctx.events.iter().any(|e| e.kind == EventKind::Skipped));
    }
}
