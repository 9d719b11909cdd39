//! Shared workflow state and the record data model.
//!
//! A [`WorkflowContext`] is created per run request, threaded mutably through
//! every stage the engine dispatches, and converted into a [`RunReport`] when
//! the run reaches the terminal node. Stages never talk to each other
//! directly; everything flows through the context.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Nodes of the workflow graph.
///
/// `current_node` is always a member of this set; the engine refuses to
/// advance along any edge not in the static edge table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    /// Entry node; unconditionally hands off to the supervisor.
    Start,
    /// Routing node: interprets the user request and picks a branch.
    Supervisor,
    /// Self-looping extraction stage over the document queue.
    Extractor,
    /// Unit conversion and schema mapping.
    Standardizer,
    /// Read-only approval report projection.
    Reporter,
    /// Idempotent row-store sink.
    DbUpdater,
    /// Idempotent knowledge-graph sink.
    GraphUpdater,
    /// Correlation/statistics branch.
    Analyzer,
    /// Terminal node.
    End,
}

impl Node {
    /// Stable display name, matching the node labels used in traces.
    pub fn as_str(&self) -> &'static str {
        match self {
            Node::Start => "Start",
            Node::Supervisor => "Supervisor",
            Node::Extractor => "Extractor",
            Node::Standardizer => "Standardizer",
            Node::Reporter => "Reporter",
            Node::DbUpdater => "DBUpdater",
            Node::GraphUpdater => "GraphUpdater",
            Node::Analyzer => "Analyzer",
            Node::End => "End",
        }
    }

    /// All nodes in the graph.
    pub fn all() -> &'static [Node] {
        &[
            Node::Start,
            Node::Supervisor,
            Node::Extractor,
            Node::Standardizer,
            Node::Reporter,
            Node::DbUpdater,
            Node::GraphUpdater,
            Node::Analyzer,
            Node::End,
        ]
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The control value a stage hands back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Stay on the current node (self-loop edge).
    Continue,
    /// Follow the node's default outgoing edge.
    Done,
    /// Take the explicit edge to the named node.
    Next(Node),
}

/// A stage's routing verdict plus an optional human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    /// The control verdict.
    pub decision: Decision,
    /// Optional reason, surfaced in the transition trace.
    pub reason: Option<String>,
}

impl RoutingDecision {
    /// Stay on the current node.
    pub fn continue_() -> Self {
        Self {
            decision: Decision::Continue,
            reason: None,
        }
    }

    /// Follow the default outgoing edge.
    pub fn done() -> Self {
        Self {
            decision: Decision::Done,
            reason: None,
        }
    }

    /// Take the explicit edge to `node`.
    pub fn next(node: Node) -> Self {
        Self {
            decision: Decision::Next(node),
            reason: None,
        }
    }

    /// Attaches a reason string.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// An input document queued for extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier (file stem or DOI).
    pub id: String,
    /// Full text to extract from.
    pub text: String,
    /// Source path, when the document came from disk.
    pub source: Option<PathBuf>,
}

impl Document {
    /// Creates a document from an id and its text.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source: None,
        }
    }

    /// Sets the source path.
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A raw numeric value with its as-reported unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedValue {
    /// Numeric value as reported by the paper.
    pub value: f64,
    /// Unit string as reported ("S/cm", "K", ...). May be empty.
    pub unit: String,
}

impl ExtractedValue {
    /// Creates a value with a unit.
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
        }
    }
}

/// Terminal status of one document's extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// Structured data was extracted.
    Succeeded,
    /// The document could not be processed at all (unreadable/empty).
    Failed,
    /// Every attempt within the retry budget failed; document skipped.
    RetryExhausted,
}

impl std::fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionStatus::Succeeded => write!(f, "succeeded"),
            ExtractionStatus::Failed => write!(f, "failed"),
            ExtractionStatus::RetryExhausted => write!(f, "retry_exhausted"),
        }
    }
}

/// Result of extracting one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRecord {
    /// Identifier of the source document.
    pub document_id: String,
    /// Paper DOI, when one was extracted.
    pub doi: String,
    /// Material composition (e.g. "Li6PS5Cl"). May be empty on failure.
    pub material_id: String,
    /// Raw field name -> value-with-unit, as named by the extraction model.
    pub fields: BTreeMap<String, ExtractedValue>,
    /// Experimental conditions reported alongside the values.
    pub conditions: BTreeMap<String, String>,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    /// Terminal status for this document.
    pub status: ExtractionStatus,
    /// Extraction calls spent on this document.
    pub attempts: u32,
}

impl ExtractionRecord {
    /// Creates a record for a document that yielded no data.
    pub fn unsuccessful(
        document_id: impl Into<String>,
        status: ExtractionStatus,
        attempts: u32,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            doi: String::new(),
            material_id: String::new(),
            fields: BTreeMap::new(),
            conditions: BTreeMap::new(),
            confidence: 0.0,
            status,
            attempts,
        }
    }

    /// Returns true when extraction produced data.
    pub fn is_succeeded(&self) -> bool {
        self.status == ExtractionStatus::Succeeded
    }
}

/// Review state of a standardized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Schema mapping met the similarity threshold; eligible for persistence.
    Resolved,
    /// Held for manual review; excluded from every persistence sink.
    NeedsReview,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewStatus::Resolved => write!(f, "resolved"),
            ReviewStatus::NeedsReview => write!(f, "needs_review"),
        }
    }
}

/// One unit-normalized, schema-mapped property value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardizedRecord {
    /// Identifier of the source document.
    pub document_id: String,
    /// Material composition the value belongs to.
    pub material_id: String,
    /// Raw field name as extracted.
    pub property: String,
    /// Canonical schema key; present only when resolved.
    pub canonical_key: Option<String>,
    /// Unit-normalized value.
    pub value: f64,
    /// Canonical unit after conversion.
    pub unit: String,
    /// Cosine similarity to the best canonical candidate.
    pub similarity: f64,
    /// Whether the record may be persisted.
    pub review: ReviewStatus,
}

impl StandardizedRecord {
    /// Returns true when the record is cleared for persistence.
    pub fn is_resolved(&self) -> bool {
        self.review == ReviewStatus::Resolved
    }
}

/// A raw-to-canonical schema mapping with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMapping {
    /// Field name as extracted.
    pub raw: String,
    /// Canonical key the field resolved to.
    pub canonical: String,
    /// Cosine similarity of the mapping.
    pub score: f64,
}

/// Read-only projection over a standardized batch for human review.
///
/// Carries no state of its own; it is derived entirely from the
/// standardized records and never feeds back into them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalReport {
    /// Records cleared for persistence.
    pub accepted: usize,
    /// Records held for manual review.
    pub needs_review: usize,
    /// Distinct resolved mappings in the batch.
    pub mappings: Vec<SchemaMapping>,
    /// Distinct raw fields with no accepted mapping.
    pub unresolved_fields: Vec<String>,
    /// Preview lines for the first few records.
    pub preview: Vec<String>,
}

impl ApprovalReport {
    /// Renders the report as a human-readable block.
    pub fn render(&self) -> String {
        let rule = "=".repeat(60);
        let mut out = format!("{rule}\n           BATCH REVIEW SUMMARY\n{rule}\n\n");

        out.push_str("1. RESOLVED MAPPINGS:\n");
        if self.mappings.is_empty() {
            out.push_str("   (none)\n");
        }
        for m in &self.mappings {
            out.push_str(&format!(
                "   - '{}' -> '{}' (score: {:.3})\n",
                m.raw, m.canonical, m.score
            ));
        }

        out.push_str("\n2. HELD FOR REVIEW:\n");
        if self.unresolved_fields.is_empty() {
            out.push_str("   (none)\n");
        }
        for field in &self.unresolved_fields {
            out.push_str(&format!("   - '{field}'\n"));
        }

        out.push_str("\n3. DATA PREVIEW:\n");
        if self.preview.is_empty() {
            out.push_str("   (no data)\n");
        }
        for line in &self.preview {
            out.push_str(&format!("   {line}\n"));
        }

        out.push_str(&format!(
            "\n4. SUMMARY: {} accepted, {} held for review\n{rule}\n",
            self.accepted, self.needs_review
        ));
        out
    }
}

/// Category of a workflow event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A per-document extraction attempt failed.
    ExtractionFailed,
    /// A record was held for manual review.
    NeedsReview,
    /// A persistence write failed; the run continued.
    PersistenceFailed,
    /// A stage failed non-recoverably; the run ended with partial failure.
    StageFailed,
    /// The run was cancelled between stages.
    Aborted,
    /// The engine transition guard fired.
    TransitionLimit,
    /// A stage skipped its work (nothing to do, approval pending, ...).
    Skipped,
    /// Informational.
    Info,
}

/// An entry in the run's error/event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Event category.
    pub kind: EventKind,
    /// Node that produced the event.
    pub node: Node,
    /// Human-readable description.
    pub message: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

/// One edge taken by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Node the engine left.
    pub from: Node,
    /// Node the engine entered.
    pub to: Node,
    /// Reason carried by the routing decision, if any.
    pub reason: Option<String>,
}

/// A message in the run's conversation log. The log is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "user" or "assistant".
    pub role: String,
    /// Message text.
    pub content: String,
    /// When the message was appended.
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Mutable state threaded through every stage of one run.
///
/// Exactly one workflow owns a context for the duration of a run; the engine
/// hands `&mut` access to one stage at a time, so no two stages ever hold
/// conflicting write access.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    /// Unique id for this run.
    pub run_id: Uuid,
    /// Node the engine will dispatch next.
    pub current_node: Node,
    /// Free-form request that started the run.
    pub user_request: String,
    /// Documents waiting for extraction, in input order.
    pub queue: VecDeque<Document>,
    /// Queue length at run start, for loop-bound accounting.
    pub initial_queue_len: usize,
    /// Accumulated extraction results, in input order.
    pub extracted: Vec<ExtractionRecord>,
    /// Unit-normalized, schema-mapped records.
    pub standardized: Vec<StandardizedRecord>,
    /// Approval report, once the reporter has run.
    pub report: Option<ApprovalReport>,
    /// Rendered analysis result, once the analyzer has run.
    pub analysis: Option<String>,
    /// Final response text for the caller.
    pub response: Option<String>,
    /// Error/event log.
    pub events: Vec<WorkflowEvent>,
    /// Every edge the engine has taken.
    pub trace: Vec<Transition>,
    /// Engine transition counter (cycle guard input).
    pub transitions: u32,
    /// Total extraction calls spent by the loop controller.
    pub extraction_calls: u32,
    /// Retry permits remaining in the batch pool.
    pub retries_remaining: u32,
    /// Rows successfully written by the row sink.
    pub rows_written: usize,
    /// Rows that failed to persist.
    pub rows_unpersisted: usize,
    /// Graph entries included in the last merged delta.
    pub graph_entries: usize,
    /// Whether any non-recoverable fault or abort occurred.
    pub partial_failure: bool,
    /// Whether the batch is approved for persistence.
    pub approved: bool,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
}

impl WorkflowContext {
    fn new(user_request: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            current_node: Node::Start,
            user_request: user_request.into(),
            queue: VecDeque::new(),
            initial_queue_len: 0,
            extracted: Vec::new(),
            standardized: Vec::new(),
            report: None,
            analysis: None,
            response: None,
            events: Vec::new(),
            trace: Vec::new(),
            transitions: 0,
            extraction_calls: 0,
            retries_remaining: 0,
            rows_written: 0,
            rows_unpersisted: 0,
            graph_entries: 0,
            partial_failure: false,
            approved: true,
            started_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    /// Creates a context for an extraction batch.
    pub fn for_documents(
        user_request: impl Into<String>,
        documents: impl IntoIterator<Item = Document>,
    ) -> Self {
        let mut ctx = Self::new(user_request);
        ctx.queue = documents.into_iter().collect();
        ctx.initial_queue_len = ctx.queue.len();
        ctx
    }

    /// Creates a context for an analysis or free-form request with no
    /// document queue.
    pub fn for_request(user_request: impl Into<String>) -> Self {
        Self::new(user_request)
    }

    /// Appends a user message to the conversation log.
    pub fn push_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::new("user", content));
    }

    /// Appends an assistant message to the conversation log.
    pub fn push_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::new("assistant", content));
    }

    /// The conversation log, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Records an event in the error/event log.
    pub fn record(&mut self, kind: EventKind, node: Node, message: impl Into<String>) {
        self.events.push(WorkflowEvent {
            kind,
            node,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    /// Number of documents that extracted successfully.
    pub fn processed_count(&self) -> usize {
        self.extracted.iter().filter(|r| r.is_succeeded()).count()
    }

    /// Number of documents that failed without consuming retries.
    pub fn failed_count(&self) -> usize {
        self.extracted
            .iter()
            .filter(|r| r.status == ExtractionStatus::Failed)
            .count()
    }

    /// Number of documents skipped after retry exhaustion.
    pub fn skipped_count(&self) -> usize {
        self.extracted
            .iter()
            .filter(|r| r.status == ExtractionStatus::RetryExhausted)
            .count()
    }

    /// Standardized records currently held for review.
    pub fn needs_review(&self) -> Vec<StandardizedRecord> {
        self.standardized
            .iter()
            .filter(|r| !r.is_resolved())
            .cloned()
            .collect()
    }
}

/// Final result of a run, derived from the terminal context.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run id this report belongs to.
    pub run_id: Uuid,
    /// Documents extracted successfully.
    pub processed: usize,
    /// Documents that failed outright.
    pub failed: usize,
    /// Documents skipped after retry exhaustion.
    pub skipped: usize,
    /// Standardized records cleared for persistence.
    pub resolved: usize,
    /// Records held for manual review.
    pub needs_review: Vec<StandardizedRecord>,
    /// Rows written by the row sink.
    pub rows_written: usize,
    /// Rows that failed to persist.
    pub rows_unpersisted: usize,
    /// Total extraction calls spent.
    pub extraction_calls: u32,
    /// Edges taken by the engine.
    pub transitions: u32,
    /// Final response text.
    pub response: String,
    /// Whether the run ended with a partial failure.
    pub partial_failure: bool,
    /// Error/event log accumulated during the run.
    pub events: Vec<WorkflowEvent>,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
}

impl RunReport {
    /// Builds the report from a terminal context.
    pub fn from_context(ctx: &WorkflowContext, elapsed: Duration) -> Self {
        Self {
            run_id: ctx.run_id,
            processed: ctx.processed_count(),
            failed: ctx.failed_count(),
            skipped: ctx.skipped_count(),
            resolved: ctx.standardized.iter().filter(|r| r.is_resolved()).count(),
            needs_review: ctx.needs_review(),
            rows_written: ctx.rows_written,
            rows_unpersisted: ctx.rows_unpersisted,
            extraction_calls: ctx.extraction_calls,
            transitions: ctx.transitions,
            response: ctx.response.clone().unwrap_or_default(),
            partial_failure: ctx.partial_failure,
            events: ctx.events.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Renders a terminal-friendly summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.response.is_empty() {
            out.push_str(&self.response);
            out.push_str("\n\n");
        }
        out.push_str(&format!(
            "processed={} failed={} skipped={} resolved={} held_for_review={}\n",
            self.processed,
            self.failed,
            self.skipped,
            self.resolved,
            self.needs_review.len()
        ));
        out.push_str(&format!(
            "rows_written={} rows_unpersisted={} extraction_calls={} transitions={} elapsed={}ms\n",
            self.rows_written,
            self.rows_unpersisted,
            self.extraction_calls,
            self.transitions,
            self.elapsed_ms
        ));
        if self.partial_failure {
            out.push_str("run finished with partial failure; see events\n");
        }
        for event in &self.events {
            out.push_str(&format!(
                "  [{}] {}: {}\n",
                event.node,
                match event.kind {
                    EventKind::ExtractionFailed => "extraction_failed",
                    EventKind::NeedsReview => "needs_review",
                    EventKind::PersistenceFailed => "persistence_failed",
                    EventKind::StageFailed => "stage_failed",
                    EventKind::Aborted => "aborted",
                    EventKind::TransitionLimit => "transition_limit",
                    EventKind::Skipped => "skipped",
                    EventKind::Info => "info",
                },
                event.message
            ));
        }
        out
    }
}
