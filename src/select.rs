//! The lowered SQL-shape: the intermediate representation the optimizer produces and the
//! builder renders to text. Unlike `shape.rs`, which is a tree of logical operators, `Select`
//! already has the relational shape of a single `SELECT` statement (possibly with nested
//! `FromItem::Subquery` children).

use crate::value::{Direction, NodeHash, Value};

/// A bound SQL parameter. Hash-column comparisons (`subject_hash = ?`, `hash = ?`) bind a raw
/// [`NodeHash`]; value-column comparisons (`value_string > ?`) bind a typed [`Value`] the
/// execution surface encodes per its native column type. `Null` is only ever produced by the
/// mutation engine's hand-written INSERT/DELETE statements (e.g. an unlabelled quad's
/// `label_hash`), never by the optimizer/builder, which express "no value" via a `WhereOp`
/// variant (`IsNull`/`IsNotNull`/`IsTrue`) instead of a bound parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Hash(NodeHash),
    Value(Value),
    Null,
}

/// A comparison operator usable in a `Comparison` value filter or, when a dialect supports it,
/// as a regexp operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A projected output column: `<table>.<name> AS <alias>`.
///
/// `table` is empty until [`crate::optimizer::ensure_aliases`] assigns the owning table an
/// alias; a field with an empty `table` must never reach the builder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub table: String,
    pub name: String,
    pub alias: String,
}

impl Field {
    pub fn new(table: impl Into<String>, name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
            alias: alias.into(),
        }
    }
}

/// One entry in a `Select`'s `FROM` clause.
#[derive(Clone, Debug, PartialEq)]
pub enum FromItem {
    Table { name: String, alias: Option<String> },
    Subquery { select: Box<Select>, alias: String },
}

impl FromItem {
    pub fn table(name: impl Into<String>, alias: Option<String>) -> Self {
        Self::Table {
            name: name.into(),
            alias,
        }
    }

    /// The alias this source is addressed by in `Field`/`Where` entries: the explicit alias if
    /// set, otherwise the table name itself.
    pub fn effective_alias(&self) -> &str {
        match self {
            Self::Table { name, alias } => alias.as_deref().unwrap_or(name),
            Self::Subquery { alias, .. } => alias,
        }
    }
}

/// The right-hand side of a `WHERE` comparison.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// A positional parameter, indexing into this select's own `Params`.
    Placeholder(usize),
    /// A reference to another selected field, used for inter-table joins.
    FieldRef { table: String, name: String },
    /// No comparison operand (`IS NULL`, `IS TRUE`, `IS NOT NULL`).
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhereOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
    IsNotNull,
    IsTrue,
    Regexp,
}

impl From<CmpOp> for WhereOp {
    fn from(op: CmpOp) -> Self {
        match op {
            CmpOp::Gt => Self::Gt,
            CmpOp::Gte => Self::Gte,
            CmpOp::Lt => Self::Lt,
            CmpOp::Lte => Self::Lte,
        }
    }
}

/// One conjunct of a `Select`'s `WHERE` clause: `<table>.<field> <op> <operand>`.
#[derive(Clone, Debug, PartialEq)]
pub struct WhereClause {
    pub table: String,
    pub field: String,
    pub op: WhereOp,
    pub operand: Operand,
}

impl WhereClause {
    pub fn eq_param(table: impl Into<String>, field: impl Into<String>, param_index: usize) -> Self {
        Self {
            table: table.into(),
            field: field.into(),
            op: WhereOp::Eq,
            operand: Operand::Placeholder(param_index),
        }
    }

    pub fn eq_field(
        table: impl Into<String>,
        field: impl Into<String>,
        other_table: impl Into<String>,
        other_field: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            field: field.into(),
            op: WhereOp::Eq,
            operand: Operand::FieldRef {
                table: other_table.into(),
                name: other_field.into(),
            },
        }
    }

    /// A clause that always evaluates false, used by `Page` (rule 8) to represent an empty
    /// result without needing dialect-specific "no rows" syntax.
    pub fn never(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            field: "__never__".to_owned(),
            op: WhereOp::IsNull,
            operand: Operand::None,
        }
    }
}

/// The lowered SQL-shape. Produced by the optimizer, consumed by the builder.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Select {
    pub fields: Vec<Field>,
    pub from: Vec<FromItem>,
    pub where_: Vec<WhereClause>,
    pub params: Vec<Param>,
    pub offset: u64,
    pub limit: u64,
    /// When set, the builder emits `ORDER BY __node` so that rows sharing a primary key are
    /// contiguous, which the `NextPath` replay mechanism (`iterator.rs`) depends on.
    pub next_path: bool,
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    /// The field aliased `__node`, if this select currently has one.
    pub fn node_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.alias == "__node")
    }

    pub fn node_field_mut(&mut self) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.alias == "__node")
    }

    /// True when this select's fields are exactly the four quad directions (`Quads`-shaped).
    pub fn is_quad_shaped(&self) -> bool {
        let want = [
            Direction::Subject.internal_tag(),
            Direction::Predicate.internal_tag(),
            Direction::Object.internal_tag(),
            Direction::Label.internal_tag(),
        ];
        want.iter()
            .all(|tag| self.fields.iter().any(|f| f.alias == *tag))
    }

    /// Appends a parameter and returns its 0-based index for use in an [`Operand::Placeholder`].
    pub fn push_param(&mut self, param: Param) -> usize {
        self.params.push(param);
        self.params.len() - 1
    }

    /// Convenience for `push_param(Param::Value(value))`.
    pub fn push_value_param(&mut self, value: Value) -> usize {
        self.push_param(Param::Value(value))
    }

    /// Convenience for `push_param(Param::Hash(hash))`.
    pub fn push_hash_param(&mut self, hash: NodeHash) -> usize {
        self.push_param(Param::Hash(hash))
    }
}
