//! CLI command definitions for matforge.
//!
//! Each command builds a [`WorkflowConfig`] from the environment, applies
//! CLI overrides, wires the collaborators, and hands one run request to the
//! workflow engine. Missing required collaborator connections are the only
//! errors reported before a run starts; everything else surfaces in the run
//! report.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::llm::{ChatClient, DocumentExtractor, LanguageModel, LlmExtractor};
use crate::storage::{
    GraphStore, MemoryPropertyStore, Neo4jHttpStore, PgPropertyStore, PropertyStore,
    UnconfiguredGraphStore,
};
use crate::workflow::{
    Collaborators, ConfigError, Document, WorkflowConfig, WorkflowContext, WorkflowEngine,
};

/// Document extensions picked up by directory discovery.
const DOCUMENT_EXTENSIONS: &[&str] = &["md", "txt"];

/// Materials-literature mining pipeline.
#[derive(Parser)]
#[command(name = "matforge")]
#[command(about = "Extract, standardize and persist ionic-conductivity data from papers")]
#[command(version)]
#[command(
    long_about = "matforge runs a stateful extraction workflow over markdown papers:\n\
                  extraction -> standardization -> review report -> database -> knowledge graph,\n\
                  plus a correlation-analysis branch over previously persisted data.\n\n\
                  Example usage:\n  matforge extract --input ./papers\n  matforge analyze --target ionic_conductivity_ms_cm"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the extraction pipeline over a directory or file of papers.
    #[command(alias = "ext")]
    Extract(ExtractArgs),

    /// Analyze previously persisted data (summary, correlations, patterns).
    Analyze(AnalyzeArgs),

    /// Route a free-form request through the supervisor.
    Ask(AskArgs),

    /// Show the effective configuration and persisted-data counts.
    Status,
}

/// Arguments for `matforge extract`.
#[derive(Parser, Debug)]
pub struct ExtractArgs {
    /// Directory or file containing paper text (.md / .txt).
    #[arg(short, long)]
    pub input: String,

    /// Retry permits per batch (also the per-document retry cap).
    #[arg(long)]
    pub retry_budget: Option<u32>,

    /// Extraction worker-pool width.
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Schema-mapping similarity threshold in [0, 1].
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Model identifier for extraction and intent classification.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Hold the batch for approval instead of persisting immediately.
    #[arg(long)]
    pub require_approval: bool,

    /// Output the run report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `matforge analyze`.
#[derive(Parser, Debug)]
pub struct AnalyzeArgs {
    /// Target property for correlation analysis.
    #[arg(short, long)]
    pub target: Option<String>,

    /// Analysis request; keywords select sections (summary, correlation,
    /// pattern). Defaults to running every section.
    #[arg(default_value = "analyze the persisted data")]
    pub request: String,

    /// Output the run report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `matforge ask`.
#[derive(Parser, Debug)]
pub struct AskArgs {
    /// Free-form request, routed by the supervisor.
    #[arg(required = true)]
    pub request: Vec<String>,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the CLI.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the CLI with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Extract(args) => run_extract(args).await,
        Commands::Analyze(args) => run_analyze(args).await,
        Commands::Ask(args) => run_ask(args).await,
        Commands::Status => run_status().await,
    }
}

async fn run_extract(args: ExtractArgs) -> anyhow::Result<()> {
    let mut config = WorkflowConfig::from_env()?;
    if let Some(retry_budget) = args.retry_budget {
        config.retry_budget = retry_budget;
    }
    if let Some(concurrency) = args.concurrency {
        config.extract_concurrency = concurrency;
    }
    if let Some(threshold) = args.threshold {
        config.similarity_threshold = threshold;
    }
    if let Some(model) = args.model {
        config.model = model;
    }
    config.require_approval = args.require_approval;
    config.validate()?;

    let documents = discover_documents(&args.input)?;
    if documents.is_empty() {
        bail!("no .md or .txt documents found under '{}'", args.input);
    }
    info!(count = documents.len(), input = %args.input, "documents queued");

    let collaborators = build_collaborators(&config, true).await?;
    let engine = WorkflowEngine::new(config, collaborators)?;

    let mut ctx = WorkflowContext::for_documents("extract the queued documents", documents);
    ctx.approved = !args.require_approval;
    let report = engine.run(ctx).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render());
    }
    Ok(())
}

async fn run_analyze(args: AnalyzeArgs) -> anyhow::Result<()> {
    let mut config = WorkflowConfig::from_env()?;
    if let Some(target) = args.target {
        config.target_property = target;
    }
    config.validate()?;

    let collaborators = build_collaborators(&config, false).await?;
    let engine = WorkflowEngine::new(config, collaborators)?;

    let report = engine
        .run(WorkflowContext::for_request(args.request))
        .await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render());
    }
    Ok(())
}

async fn run_ask(args: AskArgs) -> anyhow::Result<()> {
    let config = WorkflowConfig::from_env()?;
    let request = args.request.join(" ");

    let collaborators = build_collaborators(&config, false).await?;
    let engine = WorkflowEngine::new(config, collaborators)?;

    let report = engine.run(WorkflowContext::for_request(request)).await;
    println!("{}", report.render());
    Ok(())
}

async fn run_status() -> anyhow::Result<()> {
    let config = WorkflowConfig::from_env()?;

    println!("matforge configuration:");
    println!("  model:                {}", config.model);
    println!(
        "  api base:             {}",
        config.api_base.as_deref().unwrap_or("(not configured)")
    );
    println!("  retry budget:         {}", config.retry_budget);
    println!("  extract concurrency:  {}", config.extract_concurrency);
    println!("  max transitions:      {}", config.max_transitions);
    println!("  similarity threshold: {}", config.similarity_threshold);
    println!("  target property:      {}", config.target_property);
    println!(
        "  graph store:          {}",
        config.graph_uri.as_deref().unwrap_or("(not configured)")
    );

    match &config.database_url {
        Some(url) => {
            let store = PgPropertyStore::connect(url).await?;
            store.run_migrations().await?;
            let rows = store.fetch_rows().await?;
            println!("  database:             connected ({} rows persisted)", rows.len());
        }
        None => println!("  database:             (not configured)"),
    }
    Ok(())
}

/// Collects documents from a file or directory, in path order.
fn discover_documents(input: &str) -> anyhow::Result<Vec<Document>> {
    let root = Path::new(input);
    if !root.exists() {
        bail!("input path '{input}' does not exist");
    }

    let mut paths = Vec::new();
    if root.is_file() {
        paths.push(root.to_path_buf());
    } else {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking '{input}'"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| DOCUMENT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if matches {
                paths.push(entry.into_path());
            }
        }
    }

    let mut documents = Vec::new();
    for path in paths {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string();
        // An unreadable file still enters the queue with empty text so the
        // extractor records it as failed instead of silently dropping it.
        let text = fs::read_to_string(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "could not read document");
            String::new()
        });
        documents.push(Document::new(id, text).with_source(path));
    }
    Ok(documents)
}

/// Wires the collaborators from the configuration.
///
/// `need_model` marks commands whose primary path requires the chat model
/// (extraction); for those, a missing API base is a fatal configuration
/// error rather than a degraded run.
async fn build_collaborators(
    config: &WorkflowConfig,
    need_model: bool,
) -> anyhow::Result<Collaborators> {
    let model: Option<Arc<dyn LanguageModel>> = match &config.api_base {
        Some(api_base) => Some(Arc::new(ChatClient::new(
            api_base.clone(),
            config.api_key.clone(),
        ))),
        None if need_model => {
            return Err(ConfigError::MissingCollaborator(
                "extraction model (set MATFORGE_API_BASE)".to_string(),
            )
            .into());
        }
        None => None,
    };

    let extractor: Arc<dyn DocumentExtractor> = match &model {
        Some(model) => Arc::new(LlmExtractor::new(model.clone(), config.model.clone())),
        None => Arc::new(UnconfiguredExtractor),
    };

    let rows: Arc<dyn PropertyStore> = match &config.database_url {
        Some(url) => {
            let store = PgPropertyStore::connect(url).await?;
            store.run_migrations().await?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; rows are kept in memory for this run only");
            Arc::new(MemoryPropertyStore::new())
        }
    };

    let graph: Arc<dyn GraphStore> = match &config.graph_uri {
        Some(uri) => Arc::new(Neo4jHttpStore::new(
            uri.clone(),
            config.graph_user.clone().unwrap_or_else(|| "neo4j".to_string()),
            config.graph_password.clone().unwrap_or_default(),
        )),
        None => Arc::new(UnconfiguredGraphStore),
    };

    let mut collaborators = Collaborators::in_memory(extractor, config);
    collaborators.rows = rows;
    collaborators.graph = graph;
    collaborators.model = model;
    Ok(collaborators)
}

/// Extractor used when no model endpoint is configured.
///
/// Commands that never reach the extraction chain (analyze, status) still
/// need a collaborator in place; if routing does reach it, every document
/// fails with a recorded event instead of aborting the run.
struct UnconfiguredExtractor;

#[async_trait::async_trait]
impl DocumentExtractor for UnconfiguredExtractor {
    async fn extract(
        &self,
        _document: &Document,
        _schema_hint: &[String],
    ) -> Result<crate::llm::RawExtraction, crate::error::ExtractionError> {
        Err(crate::error::ExtractionError::Model(
            crate::error::LlmError::MissingApiBase,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn test_discover_documents_filters_and_orders() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b_paper.md"), "text b").unwrap();
        fs::write(dir.path().join("a_paper.md"), "text a").unwrap();
        fs::write(dir.path().join("notes.json"), "{}").unwrap();

        let documents = discover_documents(dir.path().to_str().unwrap()).unwrap();

        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].id, "a_paper");
        assert_eq!(documents[1].id, "b_paper");
        assert_eq!(documents[0].text, "text a");
    }

    #[test]
    fn test_discover_documents_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paper.md");
        fs::write(&path, "contents").unwrap();

        let documents = discover_documents(path.to_str().unwrap()).unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].id, "paper");
        assert!(documents[0].source.is_some());
    }

    #[test]
    fn test_discover_documents_missing_path() {
        assert!(discover_documents("/no/such/path").is_err());
    }

    #[tokio::test]
    async fn test_missing_model_is_fatal_only_when_required() {
        let config = WorkflowConfig::default();
        assert!(config.api_base.is_none());

        let err = build_collaborators(&config, true).await.unwrap_err();
        assert!(err.to_string().contains("MATFORGE_API_BASE"));

        assert!(build_collaborators(&config, false).await.is_ok());
    }
}
