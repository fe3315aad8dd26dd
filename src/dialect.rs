//! The dialect descriptor: per-SQL-flavor knobs the optimizer, builder, and mutation engine
//! consult instead of hard-coding a single database's syntax.
//!
//! Unlike the teacher's compile-time `rocksdb`-vs-`fallback` backend split (one closed set of
//! two, selected by a cargo feature), SQL dialects are an open-ended, runtime-selected set (the
//! `flavor` store option), so dialects are registered at runtime behind `Arc<dyn Dialect>`
//! rather than `cfg`-gated modules.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{DomainError, Result};
use crate::select::CmpOp;

/// A comparison operator a dialect is willing to translate into a regexp predicate.
///
/// Re-exported here (rather than only from `select`) because a `Dialect` describes *whether*
/// it supports such an operator without needing to depend on the builder's internals.
pub type RegexpOp = CmpOp;

/// Per-dialect SQL rendering and error-classification knobs.
///
/// A `Dialect` is looked up by its `flavor` string from the [`DialectRegistry`] when a store is
/// opened; the returned `Arc<dyn Dialect>` is shared by every component of that store (builder,
/// optimizer, mutation engine).
pub trait Dialect: Send + Sync {
    /// This dialect's registry key, e.g. `"postgres"`, `"sqlite"`, `"mysql"`.
    fn name(&self) -> &str;

    /// Renders the `n`th (1-based) positional placeholder.
    fn placeholder(&self, n: u32) -> String;

    /// The character used to quote identifiers.
    fn field_quote(&self) -> char;

    /// `Some(op)` if this dialect has a native regexp operator usable for `Regexp`/`Wildcard`
    /// filters; `None` disables pushdown of those filters into SQL (the optimizer leaves them
    /// as a residual `Filter` evaluated at the iterator layer instead).
    fn regexp_op(&self) -> Option<RegexpOp> {
        None
    }

    /// Renders a regexp comparison `<field> <op> <placeholder>`; only called when
    /// [`Dialect::regexp_op`] is `Some`.
    fn render_regexp(&self, field_sql: &str, placeholder_sql: &str) -> String {
        format!("{field_sql} ~ {placeholder_sql}")
    }

    /// If set, a `Select` with a non-zero `Offset` and a zero `Limit` cannot be rendered as-is;
    /// the optimizer's `Page` rewrite (rule 8) bails rather than emitting an unsupported query.
    fn no_offset_without_limit(&self) -> bool {
        false
    }

    /// If set, `init` issues its DDL statements sequentially outside a transaction rather than
    /// wrapping them in one.
    fn no_schema_changes_in_tx(&self) -> bool {
        false
    }

    /// Maps a dialect-specific raw error into the public taxonomy. Called on every error the
    /// execution surface returns before it crosses the core's API boundary.
    fn error_map(&self, raw: Box<dyn std::error::Error + Send + Sync>) -> DomainError;

    /// Whether a raw error is eligible for the mutation engine's savepoint-retry wrapper.
    fn retryable(&self, _raw: &(dyn std::error::Error + 'static)) -> bool {
        false
    }

    /// DDL statements creating the `nodes` table.
    fn nodes_table_ddl(&self) -> Vec<String>;

    /// DDL statements creating the `quads` table.
    fn quads_table_ddl(&self) -> Vec<String>;

    /// DDL statements creating the required indexes (see SPEC_FULL.md §3), parameterized by
    /// `db_fill_factor` where the dialect supports it.
    fn indexes(&self, db_fill_factor: Option<u32>) -> Vec<String>;

    /// An approximate row-count query for `table`, used when `use_estimates` is set; `None` if
    /// this dialect has no cheaper alternative to `COUNT(*)`.
    fn estimated_count_query(&self, _table: &str) -> Option<String> {
        None
    }

    /// The upsert clause appended to an `INSERT INTO nodes(...)` statement so that re-inserting
    /// an already-interned node is a no-op.
    fn nodes_upsert_clause(&self) -> &str {
        "ON CONFLICT (hash) DO NOTHING"
    }

    /// The upsert clause appended to an `INSERT INTO quads(...)` statement when `ignore_dup` is
    /// set.
    fn quads_ignore_dup_clause(&self) -> &str {
        "ON CONFLICT DO NOTHING"
    }
}

/// Process-global, write-once-then-read-only table of `flavor` -> [`Dialect`].
///
/// Populated by a [`DialectRegistryBuilder`] at process start; `open`/`init` look the `flavor`
/// option up here.
pub struct DialectRegistry {
    dialects: RwLock<HashMap<String, Arc<dyn Dialect>>>,
}

impl DialectRegistry {
    pub fn global() -> &'static Self {
        static REGISTRY: OnceLock<DialectRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| Self {
            dialects: RwLock::new(HashMap::new()),
        })
    }

    pub fn register(&self, dialect: Arc<dyn Dialect>) {
        self.dialects
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(dialect.name().to_owned(), dialect);
    }

    pub fn get(&self, flavor: &str) -> Result<Arc<dyn Dialect>> {
        self.dialects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(flavor)
            .cloned()
            .ok_or_else(|| DomainError::DialectUnsupported(flavor.to_owned()))
    }
}

/// Builder for populating a [`DialectRegistry`]; intended to be used once, before the first
/// store in the process is opened.
#[derive(Default)]
pub struct DialectRegistryBuilder {
    dialects: Vec<Arc<dyn Dialect>>,
}

impl DialectRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialects.push(dialect);
        self
    }

    pub fn build_and_register(self) {
        let registry = DialectRegistry::global();
        for dialect in self.dialects {
            registry.register(dialect);
        }
    }
}

pub mod sqlite;
