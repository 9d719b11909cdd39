//! The orchestration core: context, configuration, routing, and the engine.
//!
//! A run is a walk over a fixed directed graph of stages. The
//! [`WorkflowEngine`](engine::WorkflowEngine) executes the walk, the
//! [`Router`](router::Router) interprets the user request at the supervisor
//! node, and all state flows through one
//! [`WorkflowContext`](context::WorkflowContext) per run.

pub mod config;
pub mod context;
pub mod engine;
pub mod router;

pub use config::{ConfigError, WorkflowConfig};
pub use context::{
    ApprovalReport, Decision, Document, EventKind, ExtractionRecord, ExtractionStatus, Node,
    ReviewStatus, RoutingDecision, RunReport, StandardizedRecord, WorkflowContext, WorkflowEvent,
};
pub use engine::{allowed_targets, CancelToken, Collaborators, WorkflowEngine};
pub use router::{parse_action_response, Intent, Router};
