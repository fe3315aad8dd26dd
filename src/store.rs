//! Store lifecycle, the public query API, and the public mutation API — the facade the rest of
//! the crate's components sit behind.
//!
//! Grounded on the teacher's `Storage`/`StorageReader`/`StorageWriter` split: one struct owning
//! shared state (`Storage`), handing out cheap per-call handles rather than exposing
//! `nodes`/`quads` access directly. Here there is only one handle (`Store`) since, unlike RocksDB
//! snapshots, a SQL connection pool already serializes and isolates concurrent readers on its
//! own (SPEC_FULL.md §5).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::backend::{CancellationToken, SqlConnection};
use crate::dialect::Dialect;
use crate::error::{DomainError, InfrastructureError, Result};
use crate::iterator::Iterator;
use crate::mutation::{self, Delta, IgnoreOpts, Quad};
use crate::select::Param;
use crate::shape::Shape;
use crate::value::{NodeHash, QuadHashes, Value};

/// Recognized store options (SPEC_FULL.md §6). Construct directly, or via [`StoreOptions::from_env`]
/// for the `QUADSTORE_*` environment-variable convenience.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub flavor: String,
    pub local_optimize: bool,
    pub use_estimates: bool,
    pub db_fill_factor: Option<u32>,
}

impl StoreOptions {
    pub fn new(flavor: impl Into<String>) -> Self {
        Self {
            flavor: flavor.into(),
            local_optimize: false,
            use_estimates: false,
            db_fill_factor: None,
        }
    }

    /// Reads `QUADSTORE_FLAVOR` (required), `QUADSTORE_LOCAL_OPTIMIZE`, `QUADSTORE_USE_ESTIMATES`
    /// (both `"true"`/`"1"`), and `QUADSTORE_DB_FILL_FACTOR` (an integer) from the process
    /// environment. No file-based configuration format is parsed here — that belongs to the
    /// excluded CLI/server layer.
    pub fn from_env() -> Result<Self> {
        let flavor = std::env::var("QUADSTORE_FLAVOR").map_err(|_| {
            DomainError::InvalidShape("QUADSTORE_FLAVOR is not set".to_owned())
        })?;
        let bool_flag = |name: &str| -> bool {
            std::env::var(name)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
        };
        let db_fill_factor = std::env::var("QUADSTORE_DB_FILL_FACTOR")
            .ok()
            .and_then(|v| v.parse().ok());
        Ok(Self {
            flavor,
            local_optimize: bool_flag("QUADSTORE_LOCAL_OPTIMIZE"),
            use_estimates: bool_flag("QUADSTORE_USE_ESTIMATES"),
            db_fill_factor,
        })
    }
}

const NAME_CACHE_CAPACITY: usize = 4096;

/// The store handle: one per open database connection. Cheaply cloneable (everything it owns is
/// behind `Arc`/`Mutex`), matching the teacher's `Storage` handle.
#[derive(Clone)]
pub struct Store {
    conn: Arc<dyn SqlConnection>,
    dialect: Arc<dyn Dialect>,
    opts: StoreOptions,
    size_cache: Arc<AtomicI64>,
    name_cache: Arc<Mutex<LruCache<[u8; 20], Value>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("opts", &self.opts).finish_non_exhaustive()
    }
}

impl Store {
    /// Creates the `nodes`/`quads` tables and their indexes against a freshly provisioned
    /// connection. Fails with `DatabaseExists` if they already exist (mapped by the dialect's
    /// `error_map` from the underlying duplicate-table error).
    pub fn init(conn: Arc<dyn SqlConnection>, dialect: Arc<dyn Dialect>, opts: StoreOptions) -> Result<Self> {
        let mut statements = dialect.nodes_table_ddl();
        statements.extend(dialect.quads_table_ddl());
        statements.extend(dialect.indexes(opts.db_fill_factor));
        tracing::info!(flavor = dialect.name(), "initializing store schema");
        conn.init_schema(&statements, !dialect.no_schema_changes_in_tx())?;
        Ok(Self::new(conn, dialect, opts))
    }

    /// Opens a connection to an already-initialized store.
    pub fn open(conn: Arc<dyn SqlConnection>, dialect: Arc<dyn Dialect>, opts: StoreOptions) -> Result<Self> {
        let cancel = CancellationToken::new();
        conn.query("SELECT 1", &[], &cancel)?;
        Ok(Self::new(conn, dialect, opts))
    }

    fn new(conn: Arc<dyn SqlConnection>, dialect: Arc<dyn Dialect>, opts: StoreOptions) -> Self {
        Self {
            conn,
            dialect,
            opts,
            size_cache: Arc::new(AtomicI64::new(-1)),
            name_cache: Arc::new(Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(NAME_CACHE_CAPACITY).unwrap(),
            ))),
        }
    }

    pub fn close(&self) -> Result<()> {
        self.conn.close()
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn options(&self) -> &StoreOptions {
        &self.opts
    }

    /// Runs the rule-based rewrite pipeline (`optimizer.rs`) over `shape`.
    pub fn optimize_shape(&self, shape: Shape) -> (Shape, bool) {
        crate::optimizer::optimize_shape(self.dialect.as_ref(), shape)
    }

    /// Optimizes `shape` and constructs a streaming iterator over it. Errors with `InvalidShape`
    /// if the shape did not reduce to a single `Select`.
    pub fn iterator(&self, shape: Shape) -> Result<Iterator> {
        let (optimized, ok) = self.optimize_shape(shape);
        if !ok {
            return Err(DomainError::InvalidShape(
                "shape did not reduce to a single select".to_owned(),
            ));
        }
        let select = crate::optimizer::as_select(&optimized)
            .cloned()
            .ok_or_else(|| DomainError::InvalidShape("optimizer returned no select".to_owned()))?;
        Ok(Iterator::new(self.dialect.clone(), self.conn.clone(), select))
    }

    /// Four `name_of` lookups, assembling a fully decoded [`Quad`].
    pub fn quad(&self, hashes: QuadHashes) -> Result<Quad> {
        Ok(Quad {
            subject: self.name_of(hashes.subject)?,
            predicate: self.name_of(hashes.predicate)?,
            object: self.name_of(hashes.object)?,
            label: if hashes.label.is_nil() {
                None
            } else {
                Some(self.name_of(hashes.label)?)
            },
        })
    }

    pub fn value_of(&self, value: &Value) -> NodeHash {
        NodeHash::of(value)
    }

    /// Decodes `hash` back into its [`Value`], consulting the per-store LRU first and otherwise
    /// issuing a single-row `SELECT` against `nodes`.
    pub fn name_of(&self, hash: NodeHash) -> Result<Value> {
        if hash.is_nil() {
            return Err(DomainError::InvalidShape(
                "name_of called on the nil hash".to_owned(),
            ));
        }
        if let Some(value) = self
            .name_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(hash.as_bytes())
        {
            return Ok(value.clone());
        }

        let sql = format!(
            "SELECT value_string, datatype, language, iri, bnode, value_int, value_bool, value_float, value_time \
             FROM nodes WHERE hash = {}",
            self.dialect.placeholder(1)
        );
        let cancel = CancellationToken::new();
        let mut cursor = self.conn.query(&sql, &[Param::Hash(hash)], &cancel)?;
        let row = cursor
            .next(&cancel)?
            .ok_or_else(|| InfrastructureError::Corruption(format!("no node row for hash {hash:?}")))?;
        let value = decode_node_row(&row)?;

        self.name_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .put(*hash.as_bytes(), value.clone());
        Ok(value)
    }

    /// The exact row count of `nodes`, cached until the next mutation.
    pub fn size(&self) -> Result<i64> {
        let cached = self.size_cache.load(Ordering::Acquire);
        if cached >= 0 {
            return Ok(cached);
        }
        let count = self.count_table("nodes")?;
        self.size_cache.store(count, Ordering::Release);
        Ok(count)
    }

    /// The highest `quads.horizon` currently assigned, or `0` if the table is empty.
    pub fn horizon(&self) -> Result<i64> {
        let cancel = CancellationToken::new();
        let sql = "SELECT value_int FROM (SELECT MAX(horizon) AS value_int FROM quads) AS t";
        let mut cursor = self.conn.query(sql, &[], &cancel)?;
        match cursor.next(&cancel)? {
            Some(row) => Ok(row
                .first()
                .and_then(|c| c.as_ref())
                .and_then(|c| c.as_int())
                .unwrap_or(0)),
            None => Ok(0),
        }
    }

    fn count_table(&self, table: &str) -> Result<i64> {
        let cancel = CancellationToken::new();
        if self.opts.use_estimates {
            if let Some(estimate_sql) = self.dialect.estimated_count_query(table) {
                let mut cursor = self.conn.query(&estimate_sql, &[], &cancel)?;
                if let Some(row) = cursor.next(&cancel)? {
                    if let Some(count) = row.first().and_then(|c| c.as_ref()).and_then(|c| c.as_int()) {
                        return Ok(count);
                    }
                }
            }
        }
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let mut cursor = self.conn.query(&sql, &[], &cancel)?;
        let row = cursor.next(&cancel)?.unwrap_or_default();
        Ok(row
            .first()
            .and_then(|c| c.as_ref())
            .and_then(|c| c.as_int())
            .unwrap_or(0))
    }

    /// Applies a batch of deltas inside one transaction, invalidating the cached `size` on
    /// success.
    pub fn apply_deltas(&self, deltas: &[Delta], opts: IgnoreOpts) -> Result<()> {
        mutation::apply_deltas(self.conn.as_ref(), self.dialect.as_ref(), deltas, opts)?;
        self.size_cache.store(-1, Ordering::Release);
        Ok(())
    }

    /// An iterator over every distinct node hash, for bulk-scan callers that don't need the full
    /// shape algebra (SPEC_FULL.md §4.H).
    pub fn all_nodes(&self) -> Result<Iterator> {
        self.iterator(Shape::AllNodes)
    }

    /// An iterator over every quad, unfiltered.
    pub fn all_quads(&self) -> Result<Iterator> {
        self.iterator(Shape::quads(vec![]))
    }
}

/// Reconstructs a [`Value`] from a `nodes` row's typed columns, per the exclusive value-class
/// layout in SPEC_FULL.md §3 — mirrors `optimizer::push_value_predicate`'s write-side mapping.
fn decode_node_row(row: &crate::backend::Row) -> Result<Value> {
    let column = |index: usize| row.get(index).and_then(|c| c.as_ref());
    let text = |index: usize| column(index).and_then(|c| c.as_text()).map(str::to_owned);
    let is_true = |index: usize| column(index).and_then(|c| c.as_bool()).unwrap_or(false);

    let value_string = text(0);
    let datatype = text(1);
    let language = text(2);
    let iri = is_true(3);
    let bnode = is_true(4);
    let value_int = column(5).and_then(|c| c.as_int());
    let value_bool = column(6).and_then(|c| c.as_bool());
    let value_float = column(7).and_then(|c| c.as_float());
    let value_time = text(8);

    if let Some(v) = value_int {
        return Ok(Value::Int(v));
    }
    if let Some(v) = value_bool {
        return Ok(Value::Bool(v));
    }
    if let Some(v) = value_float {
        return Ok(Value::Float(v));
    }
    if let Some(lexical) = value_time {
        return crate::value::parse_typed(&lexical, crate::value::datatype::DATE_TIME);
    }
    let value_string = value_string.ok_or_else(|| {
        InfrastructureError::Corruption("node row has no populated value column".to_owned())
    })?;
    if iri {
        return Ok(Value::Iri(value_string));
    }
    if bnode {
        return Ok(Value::BNode(value_string));
    }
    if let Some(lang) = language {
        return Ok(Value::LangString {
            value: value_string,
            lang,
        });
    }
    if let Some(datatype) = datatype {
        return Ok(Value::TypedString {
            value: value_string,
            datatype,
        });
    }
    Ok(Value::String(value_string))
}
