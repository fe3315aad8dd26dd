//! The mutation engine: applies a batch of add/delete deltas to the `nodes`/`quads` tables
//! inside a single transaction.
//!
//! Grounded on `StorageWriter`'s `insert`/`remove` family (one struct owning a transaction
//! handle, exposing one method per delta kind) generalized from direct key/value writes to
//! parameterized SQL, plus a save-point retry wrapper the teacher's single-process storage has
//! no equivalent for (RocksDB transactions don't need serialization retries the way a shared SQL
//! server's do).

use std::collections::HashSet;

use crate::backend::{CancellationToken, SqlConnection, SqlTransaction};
use crate::dialect::Dialect;
use crate::error::{DomainError, Result};
use crate::select::Param;
use crate::value::{NodeHash, Value};

/// A quad of typed values (not yet hashed), the unit of work for both `Add` and `Delete`.
#[derive(Clone, Debug, PartialEq)]
pub struct Quad {
    pub subject: Value,
    pub predicate: Value,
    pub object: Value,
    pub label: Option<Value>,
}

impl Quad {
    fn label_hash(&self) -> Option<NodeHash> {
        self.label.as_ref().map(NodeHash::of)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaAction {
    Add,
    Delete,
}

/// One unit of a mutation batch.
#[derive(Clone, Debug, PartialEq)]
pub struct Delta {
    pub action: DeltaAction,
    pub quad: Quad,
    pub id: Option<String>,
    pub ts: Option<i64>,
}

/// Duplicate/missing-quad tolerance for a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IgnoreOpts {
    pub ignore_dup: bool,
    pub ignore_missing: bool,
}

/// Applies `deltas` to `conn` inside one transaction, retrying on the dialect's retryable error
/// class via a save-point wrapper (SPEC_FULL.md §4.G).
pub fn apply_deltas(
    conn: &dyn SqlConnection,
    dialect: &dyn Dialect,
    deltas: &[Delta],
    opts: IgnoreOpts,
) -> Result<()> {
    let adds = deltas.iter().filter(|d| d.action == DeltaAction::Add).count();
    let deletes = deltas.len() - adds;
    tracing::info!(adds, deletes, "applying mutation batch");

    let cancel = CancellationToken::new();
    let mut tx = conn.begin(&cancel)?;
    match run_with_retry(tx.as_mut(), &cancel, |tx, cancel| {
        let mut interned: HashSet<[u8; 20]> = HashSet::new();
        for delta in deltas {
            match delta.action {
                DeltaAction::Add => apply_add(tx, cancel, dialect, delta, opts, &mut interned)?,
                DeltaAction::Delete => apply_delete(tx, cancel, dialect, delta, opts)?,
            }
        }
        Ok(())
    }) {
        Ok(()) => commit_or_mark_ambiguous(tx),
        Err(error) => {
            let _ = tx.rollback();
            Err(error)
        }
    }
}

const SAVEPOINT: &str = "quadstore_mutation";
const MAX_ATTEMPTS: u32 = 5;

fn run_with_retry(
    tx: &mut dyn SqlTransaction,
    cancel: &CancellationToken,
    body: impl Fn(&mut dyn SqlTransaction, &CancellationToken) -> Result<()>,
) -> Result<()> {
    for attempt in 1..=MAX_ATTEMPTS {
        tx.savepoint(SAVEPOINT)?;
        match body(tx, cancel) {
            Ok(()) => match tx.release_savepoint(SAVEPOINT) {
                Ok(()) => return Ok(()),
                Err(error) if is_retryable(&error) => {
                    return Err(DomainError::ambiguous_commit(StringError(error.to_string())));
                }
                Err(error) => return Err(error),
            },
            Err(error) if is_retryable(&error) && attempt < MAX_ATTEMPTS => {
                tracing::warn!(attempt, "mutation retrying after rollback to savepoint");
                tx.rollback_to_savepoint(SAVEPOINT)?;
            }
            Err(error) => return Err(error),
        }
    }
    Err(DomainError::retryable(StringError(
        "exhausted retry attempts".to_owned(),
    )))
}

fn commit_or_mark_ambiguous(tx: Box<dyn SqlTransaction + '_>) -> Result<()> {
    match tx.commit() {
        Ok(()) => Ok(()),
        Err(error) if is_retryable(&error) => {
            Err(DomainError::ambiguous_commit(StringError(error.to_string())))
        }
        Err(error) => Err(error),
    }
}

fn is_retryable(error: &DomainError) -> bool {
    matches!(error, DomainError::Retryable(_))
}

fn apply_add(
    tx: &mut dyn SqlTransaction,
    cancel: &CancellationToken,
    dialect: &dyn Dialect,
    delta: &Delta,
    opts: IgnoreOpts,
    interned: &mut HashSet<[u8; 20]>,
) -> Result<()> {
    for value in [
        Some(&delta.quad.subject),
        Some(&delta.quad.predicate),
        Some(&delta.quad.object),
        delta.quad.label.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        intern_node(tx, cancel, dialect, value, interned)?;
    }

    let subject_hash = NodeHash::of(&delta.quad.subject);
    let predicate_hash = NodeHash::of(&delta.quad.predicate);
    let object_hash = NodeHash::of(&delta.quad.object);
    let label_hash = delta.quad.label_hash();

    let mut columns = vec!["subject_hash", "predicate_hash", "object_hash", "label_hash"];
    let mut params = vec![
        Param::Hash(subject_hash),
        Param::Hash(predicate_hash),
        Param::Hash(object_hash),
    ];
    match label_hash {
        Some(hash) => params.push(Param::Hash(hash)),
        None => params.push(Param::Null),
    }
    if let Some(id) = &delta.id {
        columns.push("id");
        params.push(Param::Value(Value::String(id.clone())));
    }
    if let Some(ts) = delta.ts {
        columns.push("ts");
        params.push(Param::Value(Value::Int(ts)));
    }

    let placeholders: Vec<String> = (1..=params.len() as u32).map(|n| dialect.placeholder(n)).collect();
    let upsert = if opts.ignore_dup {
        format!(" {}", dialect.quads_ignore_dup_clause())
    } else {
        String::new()
    };
    let sql = format!(
        "INSERT INTO quads ({}) VALUES ({}){}",
        columns.join(", "),
        placeholders.join(", "),
        upsert,
    );
    match tx.execute(&sql, &params, cancel) {
        Ok(_) => Ok(()),
        Err(error) if matches!(error, DomainError::QuadExists) && opts.ignore_dup => Ok(()),
        Err(error) => Err(error),
    }
}

/// Interns `value`'s node row if not already interned in this transaction's dedup set.
fn intern_node(
    tx: &mut dyn SqlTransaction,
    cancel: &CancellationToken,
    dialect: &dyn Dialect,
    value: &Value,
    interned: &mut HashSet<[u8; 20]>,
) -> Result<()> {
    let hash = NodeHash::of(value);
    if !interned.insert(*hash.as_bytes()) {
        return Ok(());
    }
    let (columns, values) = node_columns(value);
    let mut all_columns = vec!["hash"];
    all_columns.extend(columns);
    let mut params = vec![Param::Hash(hash)];
    params.extend(values);

    let placeholders: Vec<String> = (1..=params.len() as u32).map(|n| dialect.placeholder(n)).collect();
    let sql = format!(
        "INSERT INTO nodes ({}) VALUES ({}) {}",
        all_columns.join(", "),
        placeholders.join(", "),
        dialect.nodes_upsert_clause(),
    );
    tx.execute(&sql, &params, cancel)?;
    Ok(())
}

/// The `nodes` column/value pairs for `value`'s variant, following the exclusive value-class
/// layout in SPEC_FULL.md §3 (the same layout `optimizer::push_value_predicate` reads back).
fn node_columns(value: &Value) -> (Vec<&'static str>, Vec<Param>) {
    match value {
        Value::Iri(v) => (
            vec!["value_string", "iri"],
            vec![Param::Value(Value::String(v.clone())), Param::Value(Value::Bool(true))],
        ),
        Value::BNode(v) => (
            vec!["value_string", "bnode"],
            vec![Param::Value(Value::String(v.clone())), Param::Value(Value::Bool(true))],
        ),
        Value::String(v) => (
            vec!["value_string"],
            vec![Param::Value(Value::String(v.clone()))],
        ),
        Value::LangString { value, lang } => (
            vec!["value_string", "language"],
            vec![
                Param::Value(Value::String(value.clone())),
                Param::Value(Value::String(lang.clone())),
            ],
        ),
        Value::TypedString { value, datatype } => (
            vec!["value_string", "datatype"],
            vec![
                Param::Value(Value::String(value.clone())),
                Param::Value(Value::String(datatype.clone())),
            ],
        ),
        Value::Int(_) => (vec!["value_int"], vec![Param::Value(value.clone())]),
        Value::Float(_) => (vec!["value_float"], vec![Param::Value(value.clone())]),
        Value::Bool(_) => (vec!["value_bool"], vec![Param::Value(value.clone())]),
        Value::Time(_) => (vec!["value_time"], vec![Param::Value(value.clone())]),
    }
}

fn apply_delete(
    tx: &mut dyn SqlTransaction,
    cancel: &CancellationToken,
    dialect: &dyn Dialect,
    delta: &Delta,
    opts: IgnoreOpts,
) -> Result<()> {
    let subject_hash = NodeHash::of(&delta.quad.subject);
    let predicate_hash = NodeHash::of(&delta.quad.predicate);
    let object_hash = NodeHash::of(&delta.quad.object);

    let mut params = vec![
        Param::Hash(subject_hash),
        Param::Hash(predicate_hash),
        Param::Hash(object_hash),
    ];
    let label_clause = match &delta.quad.label {
        None => "label_hash IS NULL".to_owned(),
        Some(label) => {
            params.push(Param::Hash(NodeHash::of(label)));
            format!("label_hash = {}", dialect.placeholder(params.len() as u32))
        }
    };
    let sql = format!(
        "DELETE FROM quads WHERE subject_hash = {} AND predicate_hash = {} AND object_hash = {} AND {}",
        dialect.placeholder(1),
        dialect.placeholder(2),
        dialect.placeholder(3),
        label_clause,
    );
    let affected = tx.execute(&sql, &params, cancel)?;
    if affected != 1 && !opts.ignore_missing {
        return Err(DomainError::QuadNotExist);
    }
    Ok(())
}

#[derive(Debug)]
struct StringError(String);

impl std::fmt::Display for StringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StringError {}
