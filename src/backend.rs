//! The abstract SQL execution surface: the boundary the core talks across instead of a concrete
//! database driver.
//!
//! Grounded on the teacher's `storage::backend` split (a `Db`/`Reader`/`Transaction` trio behind
//! a `cfg`-selected `rocksdb`-or-`fallback` module) — here the trio is `SqlConnection`/
//! `SqlTransaction`/`RowCursor`, and the choice of implementation is a runtime value (any
//! `Arc<dyn SqlConnection>`), not a compile-time feature, for the same reason `Dialect` is
//! runtime-registered (see `dialect.rs`).

use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DomainError, InfrastructureError, Result};
use crate::select::Param;

/// A cooperative cancellation signal threaded through every blocking database call.
///
/// Cloning shares the same underlying flag — `cancel()` on any clone is visible to all of them,
/// matching the teacher's `Cow`/`Arc`-shared-state idiom for cheaply cloneable handles.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `Err(DomainError::Infrastructure(Cancelled))` if this token has been cancelled;
    /// intended to be called at the top of every blocking operation in `SqlConnection`/
    /// `SqlTransaction`/`RowCursor` implementations before doing any real work.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(InfrastructureError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

/// One returned column value. A `Select` built from `builder.rs` only ever yields `Hash`
/// columns (every output column of an optimized shape is a hash); `Column::Text`/`Int`/`Float`/
/// `Bool` appear only in the mutation engine's and `Store::name_of`'s hand-written queries
/// against the `nodes` table's typed value-class columns.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    Hash([u8; 20]),
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Column {
    pub fn as_hash(&self) -> Option<[u8; 20]> {
        match self {
            Self::Hash(bytes) => Some(*bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// A single output row: one column per selected field, `None` standing for SQL `NULL` (e.g. an
/// unlabelled quad's `label_hash`).
pub type Row = Vec<Option<Column>>;

/// Reads `row[index]` as a hash column, failing with `InvalidShape` if it is absent or of the
/// wrong kind — a mismatch here means the optimizer/builder produced a non-hash `Select` output
/// column, which should never happen.
pub fn expect_hash(row: &Row, index: usize) -> Result<Option<[u8; 20]>> {
    match row.get(index) {
        None => Err(DomainError::InvalidShape(format!("row has no column {index}"))),
        Some(None) => Ok(None),
        Some(Some(column)) => column.as_hash().map(Some).ok_or_else(|| {
            DomainError::InvalidShape(format!("column {index} is not a hash"))
        }),
    }
}

/// A live, forward-only cursor over a query's result rows.
///
/// Mirrors the teacher's `Iter` (a `Reader`/`Transaction`-scoped cursor that eagerly collects its
/// matching rows into an owned buffer up front, then replays them via `next`) — an implementation
/// owns whatever rows it has already fetched rather than borrowing from the connection/
/// transaction that produced it, so a cursor can outlive the call that opened it.
pub trait RowCursor: Send {
    /// Advances the cursor and returns the next row, or `None` once exhausted.
    fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Row>>;
}

/// A read/write transaction against one connection.
///
/// Mirrors the teacher's `Transaction` (a `WriteBatchWithIndex`-backed handle scoped to one
/// `Storage::transaction` closure invocation): every mutation in `mutation.rs` runs inside one
/// `SqlTransaction`, committed or rolled back as a unit.
pub trait SqlTransaction {
    /// Runs `sql` with `args` bound positionally, returning a cursor over its result rows.
    /// Used for both `SELECT` (query results) and any statement with a `RETURNING` clause.
    fn query(&mut self, sql: &str, args: &[Param], cancel: &CancellationToken) -> Result<Box<dyn RowCursor>>;

    /// Runs `sql` with `args` bound positionally, returning the number of affected rows.
    fn execute(&mut self, sql: &str, args: &[Param], cancel: &CancellationToken) -> Result<u64>;

    /// Establishes a named savepoint the retryable-transaction wrapper (`mutation.rs`) can roll
    /// back to without aborting the whole transaction.
    fn savepoint(&mut self, name: &str) -> Result<()>;

    /// Rolls back to a previously established savepoint, leaving the transaction otherwise open.
    fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    /// Releases a savepoint once its retry attempt has succeeded.
    fn release_savepoint(&mut self, name: &str) -> Result<()>;

    /// Commits the transaction. A failure here whose dialect classifies it as ambiguous (e.g. a
    /// network error after the commit was sent but before the acknowledgment arrived) must be
    /// surfaced as `DomainError::AmbiguousCommit`, not a plain retryable error — see
    /// `error_map`/`Dialect::retryable` in `dialect.rs`.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Aborts the transaction, discarding all its effects.
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// A pooled connection to the database, the entry point for both reads and the mutation engine.
///
/// Mirrors the teacher's `Db` (the RocksDB/fallback handle `Storage` wraps): one long-lived
/// handle per store, cheaply cloneable, from which both one-shot queries and transactions are
/// opened.
pub trait SqlConnection: Send + Sync {
    /// Runs `sql` with `args` bound positionally outside any explicit transaction (an implicit
    /// autocommit transaction at the database level), returning a cursor over its result rows.
    /// Used by the query path (`iterator.rs`), which never needs transactional isolation beyond
    /// what a single statement gets for free.
    fn query(&self, sql: &str, args: &[Param], cancel: &CancellationToken) -> Result<Box<dyn RowCursor>>;

    /// Runs `sql` with no bound arguments outside any explicit transaction; used for DDL
    /// (`init`) when the dialect's `no_schema_changes_in_tx` flag rules out wrapping it.
    fn execute_ddl(&self, sql: &str) -> Result<()>;

    /// Opens a new transaction for the mutation engine.
    fn begin(&self, cancel: &CancellationToken) -> Result<Box<dyn SqlTransaction + '_>>;

    /// Issues the DDL statements from `dialect.nodes_table_ddl()`/`quads_table_ddl()`/`indexes()`,
    /// wrapping them in one transaction unless the dialect forbids schema changes inside one.
    fn init_schema(&self, statements: &[String], wrap_in_transaction: bool) -> Result<()> {
        if wrap_in_transaction {
            let cancel = CancellationToken::new();
            let mut tx = self.begin(&cancel)?;
            for statement in statements {
                tx.execute(statement, &[], &cancel)?;
            }
            tx.commit()
        } else {
            for statement in statements {
                self.execute_ddl(statement)?;
            }
            Ok(())
        }
    }

    /// Closes the underlying connection pool; subsequent calls on this handle (or clones of it)
    /// are expected to fail.
    fn close(&self) -> Result<()>;
}

/// Wraps a raw driver error (`Box<dyn Error + Send + Sync>`) through a dialect's `error_map`,
/// the single chokepoint every `SqlConnection`/`SqlTransaction` implementation should funnel its
/// raw errors through before returning them across the core's API boundary.
pub fn map_driver_error(
    dialect: &dyn crate::dialect::Dialect,
    raw: impl Into<Box<dyn StdError + Send + Sync>>,
) -> DomainError {
    dialect.error_map(raw.into())
}
