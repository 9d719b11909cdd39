//! SQL schema for the property row store.
//!
//! All statements are idempotent (`IF NOT EXISTS`) so applying them on every
//! startup is safe.

/// DDL for the property rows table.
///
/// The composite primary key (document_id, material_id, property) is what
/// makes `append_row` an idempotent upsert: `ON CONFLICT DO NOTHING` against
/// this key turns a replayed batch into a no-op.
pub const CREATE_PROPERTY_ROWS: &str = r#"
CREATE TABLE IF NOT EXISTS property_rows (
    document_id  TEXT NOT NULL,
    material_id  TEXT NOT NULL,
    property     TEXT NOT NULL,
    value        DOUBLE PRECISION NOT NULL,
    unit         TEXT NOT NULL DEFAULT '',
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (document_id, material_id, property)
)
"#;

/// Index supporting per-property scans used by the analyzer.
pub const CREATE_PROPERTY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_property_rows_property
    ON property_rows (property)
"#;

/// All schema statements, in application order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_PROPERTY_ROWS, CREATE_PROPERTY_INDEX]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        for statement in all_schema_statements() {
            assert!(statement.contains("IF NOT EXISTS"));
        }
    }

    #[test]
    fn test_rows_table_has_composite_key() {
        assert!(CREATE_PROPERTY_ROWS.contains("PRIMARY KEY (document_id, material_id, property)"));
    }
}
