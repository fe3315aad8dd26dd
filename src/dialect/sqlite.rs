//! A reference `sqlite`-flavored [`Dialect`]. Rendering knobs only — no driver is shipped; a
//! caller pairs this descriptor with its own `SqlConnection` implementation (or the in-memory
//! reference surface in `memory.rs` for tests).

use std::error::Error;
use std::sync::Arc;

use super::Dialect;
use crate::error::DomainError;

pub struct SqliteDialect;

impl SqliteDialect {
    pub fn new() -> Arc<dyn Dialect> {
        Arc::new(Self)
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn placeholder(&self, _n: u32) -> String {
        "?".to_owned()
    }

    fn field_quote(&self) -> char {
        '"'
    }

    fn no_offset_without_limit(&self) -> bool {
        // sqlite accepts `LIMIT -1 OFFSET n`, so this isn't strictly required, but the reference
        // dialect sticks to the conservative rule so `Page` rewrites stay portable.
        true
    }

    fn no_schema_changes_in_tx(&self) -> bool {
        false
    }

    fn error_map(&self, raw: Box<dyn Error + Send + Sync>) -> DomainError {
        let message = raw.to_string();
        if message.contains("UNIQUE constraint failed") && message.contains("quads") {
            DomainError::QuadExists
        } else if message.contains("table") && message.contains("already exists") {
            DomainError::DatabaseExists
        } else if message.contains("database is locked") || message.contains("SQLITE_BUSY") {
            DomainError::retryable(StringError(message))
        } else {
            DomainError::sql(StringError(message))
        }
    }

    fn retryable(&self, raw: &(dyn Error + 'static)) -> bool {
        let message = raw.to_string();
        message.contains("database is locked") || message.contains("SQLITE_BUSY")
    }

    fn nodes_table_ddl(&self) -> Vec<String> {
        vec![
            "CREATE TABLE nodes (\
                hash BLOB PRIMARY KEY, \
                value_string TEXT, \
                datatype TEXT, \
                language TEXT, \
                iri BOOLEAN, \
                bnode BOOLEAN, \
                value_int INTEGER, \
                value_bool BOOLEAN, \
                value_float REAL, \
                value_time TEXT\
            )"
            .to_owned(),
        ]
    }

    fn quads_table_ddl(&self) -> Vec<String> {
        vec![
            "CREATE TABLE quads (\
                horizon INTEGER PRIMARY KEY AUTOINCREMENT, \
                subject_hash BLOB NOT NULL, \
                predicate_hash BLOB NOT NULL, \
                object_hash BLOB NOT NULL, \
                label_hash BLOB, \
                id TEXT, \
                ts INTEGER\
            )"
            .to_owned(),
        ]
    }

    fn indexes(&self, _db_fill_factor: Option<u32>) -> Vec<String> {
        vec![
            "CREATE INDEX quads_subject_idx ON quads (subject_hash)".to_owned(),
            "CREATE INDEX quads_predicate_idx ON quads (predicate_hash)".to_owned(),
            "CREATE INDEX quads_object_idx ON quads (object_hash)".to_owned(),
            "CREATE UNIQUE INDEX quads_spol_idx ON quads (subject_hash, predicate_hash, \
             object_hash, label_hash) WHERE label_hash IS NOT NULL"
                .to_owned(),
            "CREATE UNIQUE INDEX quads_spo_no_label_idx ON quads (subject_hash, predicate_hash, \
             object_hash) WHERE label_hash IS NULL"
                .to_owned(),
        ]
    }

    fn estimated_count_query(&self, table: &str) -> Option<String> {
        // sqlite has no cheap row-count estimate comparable to Postgres's `reltuples`; callers
        // asking for `use_estimates` against this dialect fall back to `COUNT(*)`.
        let _ = table;
        None
    }
}

#[derive(Debug)]
struct StringError(String);

impl std::fmt::Display for StringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for StringError {}
