//! Extraction loop controller.
//!
//! Consumes the document queue one item at a time, invoking the extraction
//! collaborator per document and appending the result as an
//! `ExtractionRecord`. Failures are retried from a per-batch permit pool; a
//! document whose retries are exhausted is marked and skipped, never
//! aborting the batch. With a worker pool configured, per-document calls run
//! concurrently but results are appended in original queue order.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::error::{ExtractionError, StageError};
use crate::llm::{DocumentExtractor, RawExtraction};
use crate::workflow::context::{
    Document, EventKind, ExtractionRecord, ExtractionStatus, Node, RoutingDecision,
    WorkflowContext,
};

/// Stage handler for the `Extractor` node.
pub struct ExtractorStage {
    extractor: Arc<dyn DocumentExtractor>,
    schema_hint: Vec<String>,
    retry_budget: u32,
    concurrency: usize,
}

impl ExtractorStage {
    /// Creates the stage.
    ///
    /// `retry_budget` is both the per-document retry cap and the size of the
    /// per-batch retry pool; `concurrency` is the worker-pool width (1 means
    /// strictly sequential).
    pub fn new(
        extractor: Arc<dyn DocumentExtractor>,
        schema_hint: Vec<String>,
        retry_budget: u32,
        concurrency: usize,
    ) -> Self {
        Self {
            extractor,
            schema_hint,
            retry_budget,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs one pass of the loop controller.
    ///
    /// Sequential mode handles one document per pass and self-loops via
    /// `Continue`; pooled mode drains the whole queue in a single pass.
    pub async fn run(&self, ctx: &mut WorkflowContext) -> Result<RoutingDecision, StageError> {
        if ctx.queue.is_empty() {
            return Ok(RoutingDecision::done().with_reason("document queue empty"));
        }

        if self.concurrency > 1 {
            self.run_pooled(ctx).await
        } else {
            self.run_sequential(ctx).await
        }
    }

    async fn run_sequential(
        &self,
        ctx: &mut WorkflowContext,
    ) -> Result<RoutingDecision, StageError> {
        let Some(document) = ctx.queue.pop_front() else {
            return Ok(RoutingDecision::done().with_reason("document queue empty"));
        };

        let retry_pool = AtomicI64::new(i64::from(ctx.retries_remaining));
        let calls = AtomicU32::new(0);

        let record = self.attempt_document(&document, &retry_pool, &calls).await;

        ctx.extraction_calls += calls.into_inner();
        ctx.retries_remaining = retry_pool.into_inner().max(0) as u32;
        log_outcome(ctx, &record);
        ctx.extracted.push(record);

        if ctx.queue.is_empty() {
            Ok(RoutingDecision::done().with_reason("queue drained"))
        } else {
            Ok(RoutingDecision::continue_()
                .with_reason(format!("{} documents remaining", ctx.queue.len())))
        }
    }

    async fn run_pooled(&self, ctx: &mut WorkflowContext) -> Result<RoutingDecision, StageError> {
        let documents: Vec<Document> = ctx.queue.drain(..).collect();
        let retry_pool = AtomicI64::new(i64::from(ctx.retries_remaining));
        let calls = AtomicU32::new(0);

        let pool_ref = &retry_pool;
        let calls_ref = &calls;

        // `buffered` polls up to `concurrency` futures at once but yields
        // results in input order, so the record list matches a sequential
        // execution exactly.
        let records: Vec<ExtractionRecord> = stream::iter(documents)
            .map(|document| async move {
                self.attempt_document(&document, pool_ref, calls_ref).await
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        ctx.extraction_calls += calls.into_inner();
        ctx.retries_remaining = retry_pool.into_inner().max(0) as u32;
        for record in records {
            log_outcome(ctx, &record);
            ctx.extracted.push(record);
        }

        Ok(RoutingDecision::done().with_reason("queue drained"))
    }

    /// Extracts one document, spending retry permits on failures.
    async fn attempt_document(
        &self,
        document: &Document,
        retry_pool: &AtomicI64,
        calls: &AtomicU32,
    ) -> ExtractionRecord {
        if document.text.trim().is_empty() {
            // Nothing to send to the model; fail without consuming budget.
            return ExtractionRecord::unsuccessful(&document.id, ExtractionStatus::Failed, 0);
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            calls.fetch_add(1, Ordering::SeqCst);

            match self.extractor.extract(document, &self.schema_hint).await {
                Ok(raw) => {
                    debug!(document = %document.id, attempts, "extraction succeeded");
                    return record_from_raw(&document.id, raw, attempts);
                }
                Err(ExtractionError::EmptyDocument(_)) => {
                    return ExtractionRecord::unsuccessful(
                        &document.id,
                        ExtractionStatus::Failed,
                        attempts,
                    );
                }
                Err(err) => {
                    warn!(
                        document = %document.id,
                        attempt = attempts,
                        error = %err,
                        "extraction attempt failed"
                    );
                    let per_document_cap_hit = attempts > self.retry_budget;
                    if per_document_cap_hit || !acquire_retry(retry_pool) {
                        return ExtractionRecord::unsuccessful(
                            &document.id,
                            ExtractionStatus::RetryExhausted,
                            attempts,
                        );
                    }
                }
            }
        }
    }
}

/// Takes one permit from the retry pool, if any remain.
fn acquire_retry(retry_pool: &AtomicI64) -> bool {
    retry_pool
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |permits| {
            if permits > 0 {
                Some(permits - 1)
            } else {
                None
            }
        })
        .is_ok()
}

fn record_from_raw(document_id: &str, raw: RawExtraction, attempts: u32) -> ExtractionRecord {
    ExtractionRecord {
        document_id: document_id.to_string(),
        doi: raw.doi,
        material_id: raw.material_id,
        fields: raw.fields,
        conditions: raw.conditions,
        confidence: raw.confidence,
        status: ExtractionStatus::Succeeded,
        attempts,
    }
}

fn log_outcome(ctx: &mut WorkflowContext, record: &ExtractionRecord) {
    match record.status {
        ExtractionStatus::Succeeded => {}
        ExtractionStatus::Failed => ctx.record(
            EventKind::ExtractionFailed,
            Node::Extractor,
            format!("document '{}' unreadable; marked failed", record.document_id),
        ),
        ExtractionStatus::RetryExhausted => ctx.record(
            EventKind::ExtractionFailed,
            Node::Extractor,
            format!(
                "document '{}' skipped after {} attempts",
                record.document_id, record.attempts
            ),
        ),
    }
}
