//! The query iterator runtime: executes a built [`Select`] and exposes `Next`/`Contains`/
//! `NextPath` over the resulting rows.
//!
//! Grounded on the teacher's `DecodingQuadIterator`/`DecodingGraphIterator` (a thin
//! `std::iter::Iterator` wrapper decoding raw storage rows into typed terms) generalized to a
//! three-operation protocol and a sticky-error state machine, since a SQL cursor (unlike an
//! in-process B-tree scan) can fail mid-stream from a dropped connection or a cancelled query.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{self, CancellationToken, RowCursor, SqlConnection};
use crate::builder;
use crate::dialect::Dialect;
use crate::error::{DomainError, Result};
use crate::select::{Field, Select};
use crate::value::{Direction, NodeHash, QuadHashes};

/// The primary result of one row: either a single node hash (`__node`-shaped selects) or all
/// four quad-direction hashes (`Quads`-shaped selects).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimaryResult {
    Node(NodeHash),
    Quad(QuadHashes),
}

impl PrimaryResult {
    /// The hash used to detect "same primary key as the previous row" for `NextPath` grouping.
    fn group_key(&self) -> [u8; 20] {
        match self {
            Self::Node(hash) => *hash.as_bytes(),
            Self::Quad(quad) => {
                // Quads carry no single grouping hash of their own; NextPath only applies to
                // node-shaped selects (`Select.next_path` is only set on those), so this arm is
                // unreachable in practice but kept total rather than partial.
                *quad.subject.as_bytes()
            }
        }
    }
}

/// One decoded row: the primary result plus any user-tag columns, each itself a node hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub result: PrimaryResult,
    pub tags: BTreeMap<String, NodeHash>,
}

/// What a single output column of the built `Select` represents, derived from its alias.
enum ColumnKind {
    Direction(Direction),
    Tag(String),
}

fn column_kind(field: &Field) -> ColumnKind {
    for direction in [
        Direction::Any,
        Direction::Subject,
        Direction::Predicate,
        Direction::Object,
        Direction::Label,
    ] {
        if field.alias == direction.internal_tag() {
            return ColumnKind::Direction(direction);
        }
    }
    ColumnKind::Tag(field.alias.clone())
}

/// The iterator's lifecycle. Mirrors SPEC_FULL.md §4.F/§5: once `Errored`, every subsequent
/// operation short-circuits without touching the database again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Fresh,
    Opened,
    Streaming,
    Exhausted,
    Closed,
    Errored,
}

/// A streaming query cursor over a built [`Select`].
///
/// Not `Sync`: a single `Iterator` is meant to be driven by one thread at a time, matching
/// SPEC_FULL.md §5 ("iterators are not themselves thread-safe").
pub struct Iterator {
    dialect: Arc<dyn Dialect>,
    conn: Arc<dyn SqlConnection>,
    select: Select,
    cancel: CancellationToken,
    state: State,
    cursor: Option<Box<dyn RowCursor>>,
    /// The error message of the first failure, exposed by `err()`. A message rather than a
    /// cloned `DomainError`, since `DomainError`'s boxed sources aren't `Clone`.
    sticky_error: Option<String>,
    /// A row already fetched while looking for the end of a `NextPath` run, not yet consumed by
    /// the caller's next `Next`/`NextPath` call.
    buffered: Option<Binding>,
    /// The group key of the most recently yielded primary result, for `NextPath` grouping.
    last_group: Option<[u8; 20]>,
}

impl Iterator {
    pub fn new(dialect: Arc<dyn Dialect>, conn: Arc<dyn SqlConnection>, select: Select) -> Self {
        Self {
            dialect,
            conn,
            select,
            cancel: CancellationToken::new(),
            state: State::Fresh,
            cursor: None,
            sticky_error: None,
            buffered: None,
            last_group: None,
        }
    }

    /// The stored cause of the first error this iterator encountered, if any.
    pub fn err(&self) -> Option<&str> {
        self.sticky_error.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Releases the underlying cursor. Idempotent; always succeeds.
    pub fn close(&mut self) {
        self.cursor = None;
        self.state = State::Closed;
    }

    fn fail(&mut self, error: DomainError) -> DomainError {
        self.sticky_error = Some(error.to_string());
        self.state = State::Errored;
        self.cursor = None;
        error
    }

    fn ensure_opened(&mut self) -> Result<()> {
        if matches!(self.state, State::Errored) {
            return Err(DomainError::sql(StickyError(
                self.sticky_error.clone().unwrap_or_default(),
            )));
        }
        if matches!(self.state, State::Closed) {
            return Err(DomainError::InvalidShape(
                "iterator used after close()".to_owned(),
            ));
        }
        if self.cursor.is_some() {
            return Ok(());
        }
        let (sql, args) = builder::build(self.dialect.as_ref(), &self.select);
        tracing::debug!(sql = %sql, "executing select");
        match self.conn.query(&sql, &args, &self.cancel) {
            Ok(cursor) => {
                self.cursor = Some(cursor);
                self.state = State::Opened;
                Ok(())
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    fn decode_row(&self, row: &backend::Row) -> Result<Binding> {
        let mut subject = None;
        let mut predicate = None;
        let mut object = None;
        let mut label = None;
        let mut node = None;
        let mut tags = BTreeMap::new();

        for (index, field) in self.select.fields.iter().enumerate() {
            let hash = backend::expect_hash(row, index)?
                .map(NodeHash::from_bytes)
                .unwrap_or(NodeHash::NIL);
            match column_kind(field) {
                ColumnKind::Direction(Direction::Any) => node = Some(hash),
                ColumnKind::Direction(Direction::Subject) => subject = Some(hash),
                ColumnKind::Direction(Direction::Predicate) => predicate = Some(hash),
                ColumnKind::Direction(Direction::Object) => object = Some(hash),
                ColumnKind::Direction(Direction::Label) => label = Some(hash),
                ColumnKind::Tag(name) => {
                    tags.insert(name, hash);
                }
            }
        }

        let result = match (subject, predicate, object) {
            (Some(subject), Some(predicate), Some(object)) => PrimaryResult::Quad(QuadHashes {
                subject,
                predicate,
                object,
                label: label.unwrap_or(NodeHash::NIL),
            }),
            _ => PrimaryResult::Node(node.ok_or_else(|| {
                DomainError::InvalidShape("select produced no primary result column".to_owned())
            })?),
        };

        Ok(Binding { result, tags })
    }

    fn fetch_one(&mut self) -> Result<Option<Binding>> {
        self.ensure_opened()?;
        let cancel = self.cancel.clone();
        let row = {
            let cursor = self.cursor.as_mut().expect("ensure_opened populates cursor");
            match cursor.next(&cancel) {
                Ok(row) => row,
                Err(error) => return Err(self.fail(error)),
            }
        };
        match row {
            Some(row) => {
                let binding = self.decode_row(&row)?;
                self.state = State::Streaming;
                Ok(Some(binding))
            }
            None => {
                self.state = State::Exhausted;
                Ok(None)
            }
        }
    }

    /// Advances to the next primary result, binding `result` and `tags`.
    pub fn next(&mut self) -> Result<Option<Binding>> {
        if let Some(binding) = self.buffered.take() {
            self.last_group = Some(binding.result.group_key());
            self.state = State::Streaming;
            return Ok(Some(binding));
        }
        match self.fetch_one()? {
            Some(binding) => {
                self.last_group = Some(binding.result.group_key());
                Ok(Some(binding))
            }
            None => Ok(None),
        }
    }

    /// Only meaningful when the underlying select has `next_path` set: yields successive rows
    /// sharing the same primary key as the previous `Next`/`NextPath` result, buffering the first
    /// row of the next group for the following `Next`.
    pub fn next_path(&mut self) -> Result<Option<Binding>> {
        if !self.select.next_path {
            return Err(DomainError::InvalidShape(
                "next_path() called on a select without next_path set".to_owned(),
            ));
        }
        let Some(last_group) = self.last_group else {
            return Ok(None);
        };
        match self.fetch_one()? {
            Some(binding) if binding.result.group_key() == last_group => Ok(Some(binding)),
            Some(binding) => {
                self.buffered = Some(binding);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Rebuilds the select with additional `WHERE` clauses fixing each result column to `v`'s
    /// components, and returns whether any row matches.
    pub fn contains(&mut self, v: &PrimaryResult) -> Result<bool> {
        if matches!(self.state, State::Errored) {
            return Err(DomainError::sql(StickyError(
                self.sticky_error.clone().unwrap_or_default(),
            )));
        }
        let mut probe = self.select.clone();
        probe.limit = 1;
        probe.offset = 0;
        match v {
            PrimaryResult::Node(hash) => {
                let idx = probe.push_hash_param(*hash);
                let (table, column) = probe
                    .node_field()
                    .map(|f| (f.table.clone(), f.name.clone()))
                    .ok_or_else(|| {
                        DomainError::InvalidShape("select has no __node column to probe".to_owned())
                    })?;
                probe
                    .where_
                    .push(crate::select::WhereClause::eq_param(table, column, idx));
            }
            PrimaryResult::Quad(quad) => {
                for direction in [
                    Direction::Subject,
                    Direction::Predicate,
                    Direction::Object,
                    Direction::Label,
                ] {
                    let hash = quad.get(direction);
                    let Some(field) = probe
                        .fields
                        .iter()
                        .find(|f| f.alias == direction.internal_tag())
                        .map(|f| (f.table.clone(), f.name.clone()))
                    else {
                        continue;
                    };
                    let idx = probe.push_hash_param(hash);
                    probe
                        .where_
                        .push(crate::select::WhereClause::eq_param(field.0, field.1, idx));
                }
            }
        }
        let (sql, args) = builder::build(self.dialect.as_ref(), &probe);
        tracing::debug!(sql = %sql, "executing contains probe");
        let mut cursor = match self.conn.query(&sql, &args, &self.cancel) {
            Ok(cursor) => cursor,
            Err(error) => return Err(self.fail(error)),
        };
        match cursor.next(&self.cancel) {
            Ok(row) => Ok(row.is_some()),
            Err(error) => Err(self.fail(error)),
        }
    }
}

#[derive(Debug)]
struct StickyError(String);

impl std::fmt::Display for StickyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StickyError {}
