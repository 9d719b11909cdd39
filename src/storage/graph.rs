//! Knowledge-graph store.
//!
//! The graph updater turns a standardized batch into a [`GraphDelta`] whose
//! entries carry deterministic identity keys, then hands the delta to a
//! [`GraphStore`]. Because keys are derived from content (material formula,
//! property name), merging the same delta twice converges to the same graph
//! instead of duplicating nodes and edges.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors that can occur during graph store operations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The store has no connection configured.
    #[error("Graph store is not configured: {0}")]
    NotConfigured(String),

    /// The HTTP transport failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The server rejected a statement.
    #[error("Query failed: {0}")]
    QueryFailed(String),
}

/// Derives a deterministic identity key from the given parts.
///
/// The key is a hex-encoded SHA-256 over the parts joined with a separator,
/// so the same logical entity always maps to the same graph element.
pub fn identity_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// A node upsert keyed by deterministic identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpsert {
    /// Deterministic identity key.
    pub key: String,
    /// Node label ("Material", "Paper", "Property", "Process").
    pub label: String,
    /// Properties to set on the node.
    pub properties: BTreeMap<String, Value>,
}

/// An edge upsert keyed by deterministic identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeUpsert {
    /// Deterministic identity key.
    pub key: String,
    /// Relationship type ("STUDIED_IN", "HAS_PROPERTY", "PROCESSED_BY").
    pub relation: String,
    /// Key of the source node.
    pub from_key: String,
    /// Key of the target node.
    pub to_key: String,
}

/// The set of node/edge upserts to apply for one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDelta {
    /// Node upserts, deduplicated by key.
    pub nodes: Vec<NodeUpsert>,
    /// Edge upserts, deduplicated by key.
    pub edges: Vec<EdgeUpsert>,
}

impl GraphDelta {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node unless its key is already present.
    pub fn push_node(&mut self, node: NodeUpsert) {
        if !self.nodes.iter().any(|n| n.key == node.key) {
            self.nodes.push(node);
        }
    }

    /// Adds an edge unless its key is already present.
    pub fn push_edge(&mut self, edge: EdgeUpsert) {
        if !self.edges.iter().any(|e| e.key == edge.key) {
            self.edges.push(edge);
        }
    }

    /// Total entries in the delta.
    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    /// Returns true when the delta contains nothing.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// A material ranked by a property value, from a graph pattern query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialRanking {
    /// Material formula.
    pub material: String,
    /// Property value.
    pub value: f64,
    /// Property unit.
    pub unit: String,
}

/// Idempotent knowledge-graph sink and pattern-query source.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Merges the delta into the graph. Repeated identical deltas must
    /// converge to the same graph state.
    async fn merge(&self, delta: &GraphDelta) -> Result<(), GraphError>;

    /// Returns up to `limit` materials ranked by `property`, best first.
    async fn top_materials(
        &self,
        property: &str,
        limit: usize,
    ) -> Result<Vec<MaterialRanking>, GraphError>;
}

/// Neo4j-backed graph store speaking the HTTP transaction API.
pub struct Neo4jHttpStore {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
}

impl Neo4jHttpStore {
    /// Creates a store for the server at `uri` (e.g. "http://localhost:7474").
    pub fn new(uri: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        let base = uri.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{base}/db/neo4j/tx/commit"),
            user: user.into(),
            password: password.into(),
        }
    }

    async fn commit(&self, statements: Vec<Value>) -> Result<Value, GraphError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({ "statements": statements }))
            .send()
            .await
            .map_err(|e| GraphError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| GraphError::QueryFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(GraphError::QueryFailed(format!("HTTP {status}: {body}")));
        }

        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                return Err(GraphError::QueryFailed(first.to_string()));
            }
        }

        Ok(body)
    }
}

#[async_trait]
impl GraphStore for Neo4jHttpStore {
    async fn merge(&self, delta: &GraphDelta) -> Result<(), GraphError> {
        if delta.is_empty() {
            return Ok(());
        }

        let mut statements = Vec::with_capacity(delta.len());
        for node in &delta.nodes {
            // Labels come from a fixed internal set; only values are
            // parameterized.
            statements.push(json!({
                "statement": format!(
                    "MERGE (n:{} {{key: $key}}) SET n += $props",
                    node.label
                ),
                "parameters": { "key": node.key, "props": node.properties }
            }));
        }
        for edge in &delta.edges {
            statements.push(json!({
                "statement": format!(
                    "MATCH (a {{key: $from}}), (b {{key: $to}}) MERGE (a)-[r:{} {{key: $key}}]->(b)",
                    edge.relation
                ),
                "parameters": { "from": edge.from_key, "to": edge.to_key, "key": edge.key }
            }));
        }

        self.commit(statements).await?;
        Ok(())
    }

    async fn top_materials(
        &self,
        property: &str,
        limit: usize,
    ) -> Result<Vec<MaterialRanking>, GraphError> {
        let statements = vec![json!({
            "statement": "MATCH (m:Material)-[:HAS_PROPERTY]->(p:Property {type: $prop}) \
                          RETURN m.formula AS material, p.value AS value, p.unit AS unit \
                          ORDER BY p.value DESC LIMIT $limit",
            "parameters": { "prop": property, "limit": limit as i64 }
        })];

        let body = self.commit(statements).await?;
        let mut rankings = Vec::new();
        if let Some(rows) = body
            .pointer("/results/0/data")
            .and_then(Value::as_array)
        {
            for entry in rows {
                if let Some(row) = entry.get("row").and_then(Value::as_array) {
                    let material = row
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let value = row.get(1).and_then(Value::as_f64).unwrap_or(f64::NAN);
                    let unit = row
                        .get(2)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    rankings.push(MaterialRanking {
                        material,
                        value,
                        unit,
                    });
                }
            }
        }
        Ok(rankings)
    }
}

/// A graph store with no configured backend.
///
/// Every operation fails with `GraphError::NotConfigured`, which the graph
/// updater records as a persistence event while the run continues, the same
/// behavior as a connection outage.
#[derive(Debug, Default)]
pub struct UnconfiguredGraphStore;

#[async_trait]
impl GraphStore for UnconfiguredGraphStore {
    async fn merge(&self, _delta: &GraphDelta) -> Result<(), GraphError> {
        Err(GraphError::NotConfigured(
            "set MATFORGE_GRAPH_URI to enable graph persistence".to_string(),
        ))
    }

    async fn top_materials(
        &self,
        _property: &str,
        _limit: usize,
    ) -> Result<Vec<MaterialRanking>, GraphError> {
        Err(GraphError::NotConfigured(
            "set MATFORGE_GRAPH_URI to enable graph queries".to_string(),
        ))
    }
}

/// In-memory graph store for tests and local dry runs.
#[derive(Default)]
pub struct MemoryGraphStore {
    nodes: RwLock<BTreeMap<String, NodeUpsert>>,
    edges: RwLock<BTreeMap<String, EdgeUpsert>>,
}

impl MemoryGraphStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nodes.
    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Number of stored edges.
    pub async fn edge_count(&self) -> usize {
        self.edges.read().await.len()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn merge(&self, delta: &GraphDelta) -> Result<(), GraphError> {
        let mut nodes = self.nodes.write().await;
        for node in &delta.nodes {
            // MERGE + SET semantics: properties of the latest write win.
            nodes
                .entry(node.key.clone())
                .and_modify(|existing| existing.properties.extend(node.properties.clone()))
                .or_insert_with(|| node.clone());
        }
        drop(nodes);

        let mut edges = self.edges.write().await;
        for edge in &delta.edges {
            edges.entry(edge.key.clone()).or_insert_with(|| edge.clone());
        }
        Ok(())
    }

    async fn top_materials(
        &self,
        property: &str,
        limit: usize,
    ) -> Result<Vec<MaterialRanking>, GraphError> {
        let nodes = self.nodes.read().await;
        let edges = self.edges.read().await;

        let mut rankings = Vec::new();
        for node in nodes.values() {
            if node.label != "Property" {
                continue;
            }
            let matches_type = node
                .properties
                .get("type")
                .and_then(Value::as_str)
                .map(|t| t == property)
                .unwrap_or(false);
            if !matches_type {
                continue;
            }

            let value = node
                .properties
                .get("value")
                .and_then(Value::as_f64)
                .unwrap_or(f64::NAN);
            let unit = node
                .properties
                .get("unit")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            // Walk HAS_PROPERTY edges back to the owning material.
            let material = edges
                .values()
                .find(|e| e.relation == "HAS_PROPERTY" && e.to_key == node.key)
                .and_then(|e| nodes.get(&e.from_key))
                .and_then(|m| m.properties.get("formula"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            rankings.push(MaterialRanking {
                material,
                value,
                unit,
            });
        }

        rankings.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(std::cmp::Ordering::Equal));
        rankings.truncate(limit);
        Ok(rankings)
    }
}
