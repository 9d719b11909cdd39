//! Property row store.
//!
//! The row sink for standardized records. Writes are keyed by
//! (document_id, material_id, property); re-applying a batch is a no-op, so
//! the pipeline can be rerun safely after transient failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::RwLock;

use super::schema;

/// Errors that can occur during row store operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),
}

/// One persisted property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRow {
    /// Source document identifier.
    pub document_id: String,
    /// Material composition the value belongs to.
    pub material_id: String,
    /// Canonical property name.
    pub property: String,
    /// Unit-normalized value.
    pub value: f64,
    /// Canonical unit.
    pub unit: String,
}

impl PropertyRow {
    /// The row's unique key.
    pub fn key(&self) -> String {
        format!(
            "{}::{}::{}",
            self.document_id, self.material_id, self.property
        )
    }
}

/// Idempotent sink and source for property rows.
///
/// `append_row` must be a no-op on key collision; concurrent runs writing
/// the same deterministic keys must converge to the same stored state.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Appends a row. Returns `true` when the row was inserted, `false`
    /// when an existing row already occupied the key (no-op).
    async fn append_row(&self, row: &PropertyRow) -> Result<bool, DatabaseError>;

    /// Fetches all persisted rows.
    async fn fetch_rows(&self) -> Result<Vec<PropertyRow>, DatabaseError>;
}

/// PostgreSQL-backed property store.
pub struct PgPropertyStore {
    pool: PgPool,
}

impl PgPropertyStore {
    /// Connects to the database and returns a new store.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::ConnectionFailed` when the pool cannot be
    /// established.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema. Safe to call on every startup.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        for statement in schema::all_schema_statements() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PropertyStore for PgPropertyStore {
    async fn append_row(&self, row: &PropertyRow) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO property_rows (document_id, material_id, property, value, unit)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (document_id, material_id, property) DO NOTHING
            "#,
        )
        .bind(&row.document_id)
        .bind(&row.material_id)
        .bind(&row.property)
        .bind(row.value)
        .bind(&row.unit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fetch_rows(&self) -> Result<Vec<PropertyRow>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, material_id, property, value, unit
            FROM property_rows
            ORDER BY document_id, material_id, property
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PropertyRow {
                    document_id: row.try_get("document_id")?,
                    material_id: row.try_get("material_id")?,
                    property: row.try_get("property")?,
                    value: row.try_get("value")?,
                    unit: row.try_get("unit")?,
                })
            })
            .collect()
    }
}

/// In-memory property store for tests and local dry runs.
#[derive(Default)]
pub struct MemoryPropertyStore {
    rows: RwLock<BTreeMap<String, PropertyRow>>,
}

impl MemoryPropertyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Returns true when no rows are stored.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl PropertyStore for MemoryPropertyStore {
    async fn append_row(&self, row: &PropertyRow) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&row.key()) {
            // Key collision: first writer wins, replay is a no-op.
            return Ok(false);
        }
        rows.insert(row.key(), row.clone());
        Ok(true)
    }

    async fn fetch_rows(&self) -> Result<Vec<PropertyRow>, DatabaseError> {
        Ok(self.rows.read().await.values().cloned().collect())
    }
}
