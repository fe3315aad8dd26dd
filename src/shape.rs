//! The shape algebra: an immutable tree of logical query operators.
//!
//! Combinators compose by nesting; smart constructors fold trivial cases the same way the
//! teacher's `sparopt` algebra folds constant expressions at construction time (see
//! `Expression::or_all`/`and_all` in the reference pack) rather than deferring every
//! simplification to the optimizer pass.

use std::collections::BTreeMap;

use crate::select::{CmpOp, Select};
use crate::value::{Direction, Value};

/// A per-direction constraint inside a [`Shape::Quads`].
#[derive(Clone, Debug, PartialEq)]
pub enum QuadFilter {
    /// The direction must equal one of a fixed set of values.
    Fixed { direction: Direction, values: Vec<Value> },
    /// The direction's hash must join against a sub-shape's node output.
    Linked { direction: Direction, from: Box<Shape> },
}

impl QuadFilter {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Fixed { direction, .. } | Self::Linked { direction, .. } => *direction,
        }
    }
}

/// A predicate applied to node rows by [`Shape::Filter`].
#[derive(Clone, Debug, PartialEq)]
pub enum ValueFilter {
    Comparison { op: CmpOp, value: Value },
    Regexp { pattern: String, refs: bool },
    Wildcard { pattern: String },
}

/// The immutable tree of logical query operators.
///
/// Each variant's doc comment states its primary result column(s); `Quads` is the only variant
/// producing more than one (the four `__subject/__predicate/__object/__label` directions).
#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    /// Every distinct node hash. Result column: `__node`.
    AllNodes,
    /// The nodes exactly equal to one of the given values, compared either by their SQL-typed
    /// `WHERE` expansion (`ByValue`) or directly by content hash (`ByHash`). Result column:
    /// `__node`.
    Lookup(LookupKind),
    /// Quads matching zero-or-more per-direction filters. Result columns: `__subject`,
    /// `__predicate`, `__object`, `__label`.
    Quads(Vec<QuadFilter>),
    /// Projects a `Quads` shape onto one direction's node hash. Result column: `__node`.
    NodesFrom { direction: Direction, quads: Box<Shape> },
    /// A one-step convenience combining `Quads` + `NodesFrom` plus named captures. Result
    /// column: `__node`, plus one column per entry in `save`.
    QuadsAction {
        result: Direction,
        save: BTreeMap<Direction, Vec<String>>,
        filter: BTreeMap<Direction, Value>,
    },
    /// Applies value predicates to node rows produced by `from`.
    Filter { from: Box<Shape>, filters: Vec<ValueFilter> },
    /// Aliases the primary result column under additional tag names.
    Save { from: Box<Shape>, tags: Vec<String> },
    /// Pagination. `limit == 0` means unbounded; `skip == 0` means no offset.
    Page { from: Box<Shape>, skip: u64, limit: u64 },
    /// Set intersection of node-producing shapes on the primary result column.
    Intersect(Vec<Shape>),
    /// An already-lowered `Select`, produced by the optimizer. Never constructed directly by
    /// callers building a shape tree; a residual wrapper shape embeds one of these for the
    /// subtree it did manage to push down.
    Lowered(Select),
}

impl Shape {
    pub fn lookup_by_value(values: Vec<Value>) -> Self {
        Self::Lookup(LookupKind::ByValue(values))
    }

    pub fn lookup_by_hash(values: Vec<Value>) -> Self {
        Self::Lookup(LookupKind::ByHash(values))
    }

    pub fn quads(filters: Vec<QuadFilter>) -> Self {
        Self::Quads(filters)
    }

    pub fn nodes_from(direction: Direction, quads: Shape) -> Self {
        Self::NodesFrom {
            direction,
            quads: Box::new(quads),
        }
    }

    pub fn filter(self, filters: Vec<ValueFilter>) -> Self {
        if filters.is_empty() {
            return self;
        }
        Self::Filter {
            from: Box::new(self),
            filters,
        }
    }

    pub fn save(self, tags: Vec<String>) -> Self {
        if tags.is_empty() {
            return self;
        }
        Self::Save {
            from: Box::new(self),
            tags,
        }
    }

    /// Composes pagination with any existing `Page` ancestor the same way the optimizer's
    /// `Page` rewrite (rule 8) composes nested offsets/limits, so building
    /// `shape.page(a, b).page(c, d)` and optimizing it agrees with optimizing a single
    /// pre-composed `Page`.
    pub fn page(self, skip: u64, limit: u64) -> Self {
        if skip == 0 && limit == 0 {
            return self;
        }
        Self::Page {
            from: Box::new(self),
            skip,
            limit,
        }
    }

    pub fn intersect(shapes: Vec<Shape>) -> Self {
        let mut flattened = Vec::with_capacity(shapes.len());
        for shape in shapes {
            match shape {
                Self::Intersect(inner) => flattened.extend(inner),
                other => flattened.push(other),
            }
        }
        if flattened.len() == 1 {
            return flattened.into_iter().next().unwrap();
        }
        Self::Intersect(flattened)
    }
}

/// Distinguishes a `Lookup` compared by its SQL-typed `WHERE` expansion from one compared
/// directly by content hash (SPEC_FULL.md §4.D rule 2).
#[derive(Clone, Debug, PartialEq)]
pub enum LookupKind {
    ByValue(Vec<Value>),
    ByHash(Vec<Value>),
}

impl LookupKind {
    pub fn values(&self) -> &[Value] {
        match self {
            Self::ByValue(v) | Self::ByHash(v) => v,
        }
    }
}
