//! Supervisor: intent classification and response formatting.
//!
//! The supervisor is the only component allowed to interpret free-form user
//! input; every other stage consumes structured context fields. It maps a
//! recognized intent to an edge (extract, analyze) and routes everything
//! ambiguous to a clarification response, so an unrecognized request can
//! never start the extraction chain or the analyzer by accident.
//!
//! When the context comes back from a completed pipeline or analysis pass,
//! the supervisor formats the summary response and routes to the terminal
//! node instead of classifying again.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::{GenerationRequest, LanguageModel, Message};
use crate::workflow::context::{Node, RoutingDecision, WorkflowContext};

/// A recognized user intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Process the document queue through the extraction chain.
    Extract,
    /// Run correlation/statistics over persisted data.
    Analyze,
    /// Answer directly without running a pipeline.
    Respond,
    /// End the session.
    Done,
}

impl Intent {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "extract" => Some(Intent::Extract),
            "analyze" => Some(Intent::Analyze),
            "respond" => Some(Intent::Respond),
            "done" => Some(Intent::Done),
            _ => None,
        }
    }
}

const SUPERVISOR_SYSTEM_PROMPT: &str = r#"You are a research supervisor agent for solid electrolyte ionic conductivity analysis.

Based on the user's request, decide what action to take:
- "extract": the user wants to process papers and extract features
- "analyze": the user wants to analyze existing data (correlations, patterns, statistics)
- "respond": you can answer directly without running a pipeline
- "done": the user wants to end the session

Your response format must be:
ACTION: [extract/analyze/respond/done]
RESPONSE: [Your message to the user]"#;

/// Number of trailing conversation messages forwarded to the model.
const HISTORY_WINDOW: usize = 10;

/// Parses a supervisor completion into its action and message parts.
///
/// Unknown or missing actions degrade to [`Intent::Respond`], so a malformed
/// completion can never route into the extraction chain.
pub fn parse_action_response(content: &str) -> (Intent, String) {
    let mut intent = Intent::Respond;
    let mut message = content.trim().to_string();

    for line in content.lines() {
        if let Some(action) = line.strip_prefix("ACTION:") {
            intent = Intent::parse(action.trim().to_lowercase().as_str()).unwrap_or(Intent::Respond);
        }
    }

    if let Some((_, rest)) = content.split_once("RESPONSE:") {
        message = rest.trim().to_string();
    }

    (intent, message)
}

/// Deterministic keyword classifier, used when no model is configured and as
/// the fallback when a model call fails.
fn classify_keywords(request: &str) -> (Intent, String) {
    let lowered = request.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| lowered.contains(n));

    if contains_any(&["extract", "process the papers", "process papers", "ingest", "mine"]) {
        return (Intent::Extract, "Starting the extraction pipeline.".to_string());
    }
    if contains_any(&["analyz", "correlat", "statistic", "summary", "summarize", "pattern"]) {
        return (Intent::Analyze, "Running analysis over the persisted data.".to_string());
    }
    if contains_any(&["quit", "exit", "goodbye", "bye"]) {
        return (Intent::Done, "Session ended.".to_string());
    }

    (
        Intent::Respond,
        "I couldn't map that request to a pipeline. Ask me to extract papers or to analyze the existing data.".to_string(),
    )
}

/// The routing component for the `Supervisor` node.
///
/// With no model configured the router classifies intent with deterministic
/// keyword matching; with a model it asks for an `ACTION:`/`RESPONSE:`
/// completion and validates the action against the recognized set.
pub struct Router {
    model: Option<Arc<dyn LanguageModel>>,
    model_name: String,
}

impl Router {
    /// Creates a router using the deterministic keyword classifier.
    pub fn new() -> Self {
        Self {
            model: None,
            model_name: String::new(),
        }
    }

    /// Adds a model-backed intent classifier.
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>, model_name: impl Into<String>) -> Self {
        self.model = Some(model);
        self.model_name = model_name.into();
        self
    }

    /// Decides the next edge for the supervisor node.
    ///
    /// Re-entry from a completed branch takes priority: a fresh analysis
    /// result or a finished extraction batch is summarized and routed to the
    /// terminal node. Only a fresh request is classified.
    pub async fn decide(&self, ctx: &mut WorkflowContext) -> RoutingDecision {
        if let Some(analysis) = ctx.analysis.take() {
            let response = format!("Analysis complete.\n\n{analysis}");
            ctx.push_assistant_message(&response);
            ctx.response = Some(response);
            return RoutingDecision::next(Node::End).with_reason("analysis complete");
        }

        let from_pipeline = ctx
            .trace
            .last()
            .map(|t| t.from == Node::GraphUpdater)
            .unwrap_or(false);
        if from_pipeline || !ctx.extracted.is_empty() {
            let response = format!(
                "Extraction complete: {} processed, {} failed, {} skipped; {} records resolved, {} held for review.",
                ctx.processed_count(),
                ctx.failed_count(),
                ctx.skipped_count(),
                ctx.standardized.iter().filter(|r| r.is_resolved()).count(),
                ctx.needs_review().len(),
            );
            ctx.push_assistant_message(&response);
            ctx.response = Some(response);
            return RoutingDecision::next(Node::End).with_reason("pipeline complete");
        }

        let request = ctx.user_request.clone();
        ctx.push_user_message(&request);

        let (intent, message) = match &self.model {
            Some(model) => self.classify_with_model(model.as_ref(), ctx, &request).await,
            None => classify_keywords(&request),
        };
        debug!(?intent, "supervisor decision");

        match intent {
            Intent::Extract => {
                ctx.push_assistant_message(&message);
                RoutingDecision::next(Node::Extractor).with_reason(message)
            }
            Intent::Analyze => {
                ctx.push_assistant_message(&message);
                RoutingDecision::next(Node::Analyzer).with_reason(message)
            }
            Intent::Respond | Intent::Done => {
                ctx.push_assistant_message(&message);
                ctx.response = Some(message.clone());
                RoutingDecision::next(Node::End).with_reason(message)
            }
        }
    }

    async fn classify_with_model(
        &self,
        model: &dyn LanguageModel,
        ctx: &WorkflowContext,
        request: &str,
    ) -> (Intent, String) {
        let mut messages = vec![Message::system(SUPERVISOR_SYSTEM_PROMPT)];
        let history = ctx.messages();
        let skip = history.len().saturating_sub(HISTORY_WINDOW);
        for msg in &history[skip..] {
            messages.push(Message {
                role: msg.role.clone(),
                content: msg.content.clone(),
            });
        }
        messages.push(Message::user(request));

        let generation = GenerationRequest::new(self.model_name.clone(), messages)
            .with_temperature(0.1);

        match model.generate(generation).await {
            Ok(response) => match response.first_content() {
                Some(content) => parse_action_response(content),
                None => classify_keywords(request),
            },
            Err(err) => {
                warn!(error = %err, "supervisor model call failed; falling back to keyword classifier");
                classify_keywords(request)
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::workflow::context::Decision;

    async fn decide(request: &str) -> RoutingDecision {
        let mut ctx = WorkflowContext::for_request(request);
        Router::new().decide(&mut ctx).await
    }

    #[tokio::test]
    async fn test_extract_intent_routes_to_extractor() {
        let decision = decide("please extract the queued papers").await;
        assert_eq!(decision.decision, Decision::Next(Node::Extractor));
    }

    #[tokio::test]
    async fn test_analyze_intent_routes_to_analyzer() {
        let decision = decide("run a correlation analysis").await;
        assert_eq!(decision.decision, Decision::Next(Node::Analyzer));
    }

    #[tokio::test]
    async fn test_unrecognized_intent_routes_to_end() {
        let decision = decide("what is the weather like").await;
        assert_eq!(decision.decision, Decision::Next(Node::End));
        assert!(decision.reason.is_some());
    }

    #[tokio::test]
    async fn test_unrecognized_never_reaches_pipelines() {
        for request in ["", "hello", "thanks", "42"] {
            let decision = decide(request).await;
            assert_ne!(decision.decision, Decision::Next(Node::Extractor), "{request}");
            assert_ne!(decision.decision, Decision::Next(Node::Analyzer), "{request}");
        }
    }

    #[tokio::test]
    async fn test_clarification_sets_response() {
        let mut ctx = WorkflowContext::for_request("gibberish request");
        Router::new().decide(&mut ctx).await;
        assert!(ctx.response.is_some());
        assert_eq!(ctx.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_analysis_reentry_formats_summary_and_ends() {
        let mut ctx = WorkflowContext::for_request("analyze");
        ctx.analysis = Some("| Feature | Correlation |".to_string());

        let decision = Router::new().decide(&mut ctx).await;

        assert_eq!(decision.decision, Decision::Next(Node::End));
        let response = ctx.response.unwrap();
        assert!(response.contains("Analysis complete"));
        assert!(response.contains("| Feature | Correlation |"));
        // Consumed so the next round classifies afresh.
        assert!(ctx.analysis.is_none());
    }

    #[tokio::test]
    async fn test_extraction_reentry_summarizes_counts() {
        use crate::workflow::context::{ExtractionRecord, ExtractionStatus};

        let mut ctx = WorkflowContext::for_request("extract");
        ctx.extracted.push(ExtractionRecord::unsuccessful(
            "docC",
            ExtractionStatus::RetryExhausted,
            3,
        ));

        let decision = Router::new().decide(&mut ctx).await;

        assert_eq!(decision.decision, Decision::Next(Node::End));
        assert!(ctx.response.unwrap().contains("1 skipped"));
    }

    #[test]
    fn test_parse_action_response_variants() {
        let (intent, message) =
            parse_action_response("ACTION: extract\nRESPONSE: Starting the pipeline.");
        assert_eq!(intent, Intent::Extract);
        assert_eq!(message, "Starting the pipeline.");

        let (intent, _) = parse_action_response("ACTION: analyze\nRESPONSE: ok");
        assert_eq!(intent, Intent::Analyze);

        // Unknown action degrades to respond.
        let (intent, _) = parse_action_response("ACTION: launch_rockets\nRESPONSE: no");
        assert_eq!(intent, Intent::Respond);

        // Missing ACTION line degrades to respond with the raw content.
        let (intent, message) = parse_action_response("just some text");
        assert_eq!(intent, Intent::Respond);
        assert_eq!(message, "just some text");
    }

    #[test]
    fn test_parse_action_response_multiline_message() {
        let (intent, message) =
            parse_action_response("ACTION: respond\nRESPONSE: line one\nline two");
        assert_eq!(intent, Intent::Respond);
        assert!(message.contains("line one"));
        assert!(message.contains("line two"));
    }
}
