//! Persistent storage for standardized property data.
//!
//! Two sinks, both idempotent:
//! - **Database**: a PostgreSQL row store keyed by (document, material,
//!   property); repeated application of the same batch writes nothing new.
//! - **Graph**: a knowledge-graph store whose upserts carry deterministic
//!   identity keys, so reruns converge instead of duplicating nodes/edges.
//!
//! In-memory implementations of both traits back the test suite and small
//! local runs.

pub mod database;
pub mod graph;
pub mod schema;

pub use database::{DatabaseError, MemoryPropertyStore, PgPropertyStore, PropertyRow, PropertyStore};
pub use graph::{
    identity_key, EdgeUpsert, GraphDelta, GraphError, GraphStore, MaterialRanking,
    MemoryGraphStore, Neo4jHttpStore, NodeUpsert, UnconfiguredGraphStore,
};
