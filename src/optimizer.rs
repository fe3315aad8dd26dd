//! Rule-based lowering of a [`Shape`] tree into a [`Select`].
//!
//! Mirrors the teacher's `sparopt::Optimizer` shape: a unit-like entry point running a fixed,
//! ordered pipeline of named rewrite passes, each a recursive match that rebuilds children via
//! smart constructors before attempting to fold the node itself. Unmatched shapes are returned
//! unchanged with `ok = false`; correctness never depends on every shape being lowered — the
//! iterator runtime can refuse a shape that didn't fully reduce to a single `Select` rather than
//! silently mis-executing it.

use std::collections::BTreeMap;

use crate::dialect::Dialect;
use crate::select::{Field, FromItem, Operand, Select, WhereClause, WhereOp};
use crate::shape::{LookupKind, QuadFilter, Shape, ValueFilter};
use crate::value::{Direction, NodeHash, Value};

/// Monotonic table-alias counter (`t_1, t_2, …`), scoped to a single optimization run.
#[derive(Default)]
pub struct AliasAllocator {
    next: u32,
}

impl AliasAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_alias(&mut self) -> String {
        self.next += 1;
        format!("t_{}", self.next)
    }
}

/// Runs the optimizer's rewrite pipeline over `shape`, returning the (possibly partially)
/// lowered tree and whether the root itself reduced to a single `Select`.
pub fn optimize_shape(dialect: &dyn Dialect, shape: Shape) -> (Shape, bool) {
    let mut alloc = AliasAllocator::new();
    let (optimized, ok) = optimize_rec(dialect, &mut alloc, shape);
    (optimized, ok)
}

/// If `shape` reduced to a `Select`, unwraps it; otherwise `None`.
pub fn as_select(shape: &Shape) -> Option<&Select> {
    match shape {
        Shape::Lowered(select) => Some(select),
        _ => None,
    }
}

fn optimize_rec(dialect: &dyn Dialect, alloc: &mut AliasAllocator, shape: Shape) -> (Shape, bool) {
    match shape {
        Shape::Lowered(select) => (Shape::Lowered(select), true),
        Shape::AllNodes => lower_all_nodes(),
        Shape::Lookup(kind) => lower_lookup(kind),
        Shape::Quads(filters) => {
            let optimized_filters: Vec<QuadFilter> = filters
                .into_iter()
                .map(|f| optimize_quad_filter(dialect, alloc, f))
                .collect();
            lower_quads(alloc, optimized_filters)
        }
        Shape::NodesFrom { direction, quads } => {
            let (quads, quads_ok) = optimize_rec(dialect, alloc, *quads);
            if !quads_ok {
                return (
                    Shape::NodesFrom {
                        direction,
                        quads: Box::new(quads),
                    },
                    false,
                );
            }
            lower_nodes_from(direction, quads)
        }
        Shape::QuadsAction { result, save, filter } => lower_quads_action(result, save, filter),
        Shape::Filter { from, filters } => {
            let (from, from_ok) = optimize_rec(dialect, alloc, *from);
            if !from_ok {
                return (
                    Shape::Filter {
                        from: Box::new(from),
                        filters,
                    },
                    false,
                );
            }
            lower_filter(dialect, from, filters)
        }
        Shape::Save { from, tags } => {
            let (from, from_ok) = optimize_rec(dialect, alloc, *from);
            if !from_ok {
                return (
                    Shape::Save {
                        from: Box::new(from),
                        tags,
                    },
                    false,
                );
            }
            lower_save(from, tags)
        }
        Shape::Page { from, skip, limit } => {
            let (from, from_ok) = optimize_rec(dialect, alloc, *from);
            if !from_ok {
                return (
                    Shape::Page {
                        from: Box::new(from),
                        skip,
                        limit,
                    },
                    false,
                );
            }
            lower_page(dialect, from, skip, limit)
        }
        Shape::Intersect(shapes) => {
            let optimized: Vec<Shape> = shapes
                .into_iter()
                .map(|s| optimize_rec(dialect, alloc, s).0)
                .collect();
            lower_intersect(alloc, optimized)
        }
    }
}

fn optimize_quad_filter(dialect: &dyn Dialect, alloc: &mut AliasAllocator, filter: QuadFilter) -> QuadFilter {
    match filter {
        QuadFilter::Fixed { .. } => filter,
        QuadFilter::Linked { direction, from } => {
            let (from, _ok) = optimize_rec(dialect, alloc, *from);
            QuadFilter::Linked {
                direction,
                from: Box::new(from),
            }
        }
    }
}

/// Rule 1: `AllNodes` -> `SELECT hash AS __node FROM nodes`.
fn lower_all_nodes() -> (Shape, bool) {
    let mut select = Select::new();
    select.fields.push(Field::new("nodes", "hash", "__node"));
    select.from.push(FromItem::table("nodes", None));
    (Shape::Lowered(select), true)
}

/// Rule 2: single-element `Lookup` -> a `nodes` select with a value-shaped or hash-shaped
/// `WHERE`.
fn lower_lookup(kind: LookupKind) -> (Shape, bool) {
    if kind.values().len() != 1 {
        return (Shape::Lookup(kind), false);
    }
    let mut select = Select::new();
    select.fields.push(Field::new("nodes", "hash", "__node"));
    select.from.push(FromItem::table("nodes", None));
    match kind {
        LookupKind::ByHash(values) => {
            let hash = NodeHash::of(&values.into_iter().next().unwrap());
            let idx = select.push_hash_param(hash);
            select
                .where_
                .push(WhereClause::eq_param("nodes", "hash", idx));
        }
        LookupKind::ByValue(values) => {
            let value = values.into_iter().next().unwrap();
            push_value_equality(&mut select, "nodes", &value);
        }
    }
    (Shape::Lowered(select), true)
}

/// Appends the conjuncts that pin `nodes` rows to exactly `value`'s variant and content,
/// following the column layout in SPEC_FULL.md §3 (exactly one value-class populated per row).
fn push_value_equality(select: &mut Select, alias: &str, value: &Value) {
    push_value_predicate(select, alias, value, WhereOp::Eq);
}

/// Appends the conjuncts comparing `nodes` rows of `value`'s variant to `value` under `op`,
/// mirroring scenario 6 of SPEC_FULL.md §8: the primary value-class column takes `op`, the
/// columns identifying the variant itself are asserted/excluded with `IS [NOT] NULL`/`IS TRUE`.
fn push_value_predicate(select: &mut Select, alias: &str, value: &Value, op: WhereOp) {
    match value {
        Value::Iri(v) => {
            push_string_column(select, alias, v, op);
            select.where_.push(is_true(alias, "iri"));
            push_excluded(select, alias, &["bnode", "datatype", "language"]);
        }
        Value::BNode(v) => {
            push_string_column(select, alias, v, op);
            select.where_.push(is_true(alias, "bnode"));
            push_excluded(select, alias, &["iri", "datatype", "language"]);
        }
        Value::String(v) => {
            push_string_column(select, alias, v, op);
            push_excluded(select, alias, &["iri", "bnode", "datatype", "language"]);
        }
        Value::LangString { value, lang } => {
            push_string_column(select, alias, value, op);
            let idx = select.push_value_param(Value::String(lang.clone()));
            select
                .where_
                .push(WhereClause::eq_param(alias, "language", idx));
            push_excluded(select, alias, &["iri", "bnode", "datatype"]);
        }
        Value::TypedString { value, datatype } => {
            push_string_column(select, alias, value, op);
            let idx = select.push_value_param(Value::String(datatype.clone()));
            select
                .where_
                .push(WhereClause::eq_param(alias, "datatype", idx));
            push_excluded(select, alias, &["iri", "bnode", "language"]);
        }
        Value::Int(_) => push_typed_column(select, alias, "value_int", value.clone(), op),
        Value::Float(_) => push_typed_column(select, alias, "value_float", value.clone(), op),
        Value::Bool(_) => push_typed_column(select, alias, "value_bool", value.clone(), op),
        Value::Time(_) => push_typed_column(select, alias, "value_time", value.clone(), op),
    }
}

fn push_string_column(select: &mut Select, alias: &str, s: &str, op: WhereOp) {
    let idx = select.push_value_param(Value::String(s.to_owned()));
    select.where_.push(WhereClause {
        table: alias.to_owned(),
        field: "value_string".to_owned(),
        op,
        operand: Operand::Placeholder(idx),
    });
}

fn push_typed_column(select: &mut Select, alias: &str, column: &str, value: Value, op: WhereOp) {
    let idx = select.push_value_param(value);
    select.where_.push(WhereClause {
        table: alias.to_owned(),
        field: column.to_owned(),
        op,
        operand: Operand::Placeholder(idx),
    });
}

fn is_true(alias: &str, field: &str) -> WhereClause {
    WhereClause {
        table: alias.to_owned(),
        field: field.to_owned(),
        op: WhereOp::IsTrue,
        operand: Operand::None,
    }
}

fn push_excluded(select: &mut Select, alias: &str, fields: &[&str]) {
    for field in fields {
        select.where_.push(WhereClause {
            table: alias.to_owned(),
            field: (*field).to_owned(),
            op: WhereOp::IsNull,
            operand: Operand::None,
        });
    }
}

/// Rule 4: `Quads(filters)` -> a `quads AS t_n` select with one `WHERE`/subquery join per
/// filter.
fn lower_quads(alloc: &mut AliasAllocator, filters: Vec<QuadFilter>) -> (Shape, bool) {
    let alias = alloc.next_alias();
    let mut select = Select::new();
    select.from.push(FromItem::table("quads", Some(alias.clone())));
    for direction in [
        Direction::Subject,
        Direction::Predicate,
        Direction::Object,
        Direction::Label,
    ] {
        select.fields.push(Field::new(
            alias.clone(),
            direction.column(),
            direction.internal_tag(),
        ));
    }

    for filter in filters {
        let direction = filter.direction();
        match filter {
            QuadFilter::Fixed { values, .. } if values.len() == 1 => {
                let hash = NodeHash::of(&values.into_iter().next().unwrap());
                let idx = select.push_hash_param(hash);
                select
                    .where_
                    .push(WhereClause::eq_param(alias.clone(), direction.column(), idx));
            }
            QuadFilter::Fixed { .. } => {
                return (Shape::Quads(vec![filter_back(direction, filter)]), false);
            }
            QuadFilter::Linked { from, .. } => {
                let Some(remote) = as_select(&from).cloned() else {
                    return (
                        Shape::Quads(vec![QuadFilter::Linked { direction, from }]),
                        false,
                    );
                };
                if remote.fields.len() == 1 && remote.fields[0].alias == "__node" {
                    // Sub-shape with a single output field: embed as a joined subquery. Its own
                    // `Params` stay scoped to the nested `Select`; the builder renders nested
                    // `From` sources (and their params) before this select's own `Where`.
                    let sub_alias = alloc.next_alias();
                    select.from.push(FromItem::Subquery {
                        select: Box::new(remote),
                        alias: sub_alias.clone(),
                    });
                    select.where_.push(WhereClause::eq_field(
                        alias.clone(),
                        direction.column(),
                        sub_alias,
                        "__node",
                    ));
                } else if remote.node_field().is_some() {
                    if references_own_node_field(&remote) {
                        return (
                            Shape::Quads(vec![QuadFilter::Linked { direction, from }]),
                            false,
                        );
                    }
                    let Some((remote_table, remote_field)) = merge_select(&mut select, alloc, remote, true) else {
                        return (
                            Shape::Quads(vec![QuadFilter::Linked { direction, from }]),
                            false,
                        );
                    };
                    select.where_.push(WhereClause::eq_field(
                        alias.clone(),
                        direction.column(),
                        remote_table,
                        remote_field,
                    ));
                } else {
                    return (
                        Shape::Quads(vec![QuadFilter::Linked { direction, from }]),
                        false,
                    );
                }
            }
        }
    }
    (Shape::Lowered(select), true)
}

fn filter_back(direction: Direction, filter: QuadFilter) -> QuadFilter {
    match filter {
        QuadFilter::Fixed { values, .. } => QuadFilter::Fixed { direction, values },
        other => other,
    }
}

fn reindex_params(select: &mut Select, offset: usize) {
    for clause in &mut select.where_ {
        if let Operand::Placeholder(i) = &mut clause.operand {
            *i += offset;
        }
    }
    for item in &mut select.from {
        if let FromItem::Subquery { select: inner, .. } = item {
            reindex_params(inner, offset);
        }
    }
}

/// True if any `WHERE` entry of `select` references the column backing its own `__node` field,
/// which would make an outer join rename ambiguous (SPEC_FULL.md §4.D rule 4 bullet 2).
fn references_own_node_field(select: &Select) -> bool {
    let Some(node_field) = select.node_field() else {
        return false;
    };
    select.where_.iter().any(|w| {
        matches!(
            &w.operand,
            Operand::FieldRef { table, name }
                if *table == node_field.table && *name == node_field.name
        )
    })
}

/// Merges `remote`'s `From`/`Where`/`Params` into `outer`, re-indexing `remote`'s placeholder
/// operands by `outer`'s current parameter count first. Returns the `(table, field)` of
/// `remote`'s `__node` column for the caller to join against, optionally dropping that field
/// from the merged output.
fn merge_select(
    outer: &mut Select,
    alloc: &mut AliasAllocator,
    mut remote: Select,
    drop_node_field: bool,
) -> Option<(String, String)> {
    ensure_aliases(outer, alloc);
    ensure_aliases(&mut remote, alloc);
    let offset = outer.params.len();
    reindex_params(&mut remote, offset);
    let node_field = remote.node_field().cloned()?;
    let join = (node_field.table.clone(), node_field.name.clone());
    let fields_to_keep: Vec<Field> = remote
        .fields
        .into_iter()
        .filter(|f| !(drop_node_field && f.alias == "__node"))
        .collect();
    outer.fields.extend(fields_to_keep);
    outer.from.extend(remote.from);
    outer.where_.extend(remote.where_);
    outer.params.extend(remote.params);
    Some(join)
}

/// For every `From` table without an alias, assigns a fresh `t_n` and rewrites every `Field`
/// and `Where` occurrence addressing it by its bare table name to the new alias. Idempotent:
/// tables that already carry an alias are left untouched.
pub fn ensure_aliases(select: &mut Select, alloc: &mut AliasAllocator) {
    for item in &mut select.from {
        if let FromItem::Table { name, alias } = item {
            if alias.is_none() {
                let old_name = name.clone();
                let new_alias = alloc.next_alias();
                for field in &mut select.fields {
                    if field.table == old_name {
                        field.table = new_alias.clone();
                    }
                }
                for clause in &mut select.where_ {
                    if clause.table == old_name {
                        clause.table = new_alias.clone();
                    }
                    if let Operand::FieldRef { table, .. } = &mut clause.operand {
                        if *table == old_name {
                            *table = new_alias.clone();
                        }
                    }
                }
                *alias = Some(new_alias);
            }
        }
    }
}

/// Rule 5: `NodesFrom{dir, quads}` where `quads` is a four-direction select -> keep only the
/// field for `dir`, renamed to `__node`.
fn lower_nodes_from(direction: Direction, quads: Shape) -> (Shape, bool) {
    let Some(select) = as_select(&quads) else {
        return (
            Shape::NodesFrom {
                direction,
                quads: Box::new(quads),
            },
            false,
        );
    };
    if !select.is_quad_shaped() {
        return (
            Shape::NodesFrom {
                direction,
                quads: Box::new(quads),
            },
            false,
        );
    }
    let mut select = select.clone();
    let wanted_tag = direction.internal_tag();
    select
        .fields
        .retain(|f| !f.alias.starts_with("__") || f.alias == wanted_tag);
    if let Some(field) = select.fields.iter_mut().find(|f| f.alias == wanted_tag) {
        field.alias = "__node".to_owned();
    }
    (Shape::Lowered(select), true)
}

/// Rule 6: `QuadsAction{result, save, filter}` -> a single select over `quads`, iterating
/// `save`/`filter` in `Direction` order (guaranteed by `BTreeMap`) for deterministic SQL.
fn lower_quads_action(
    result: Direction,
    save: BTreeMap<Direction, Vec<String>>,
    filter: BTreeMap<Direction, Value>,
) -> (Shape, bool) {
    let mut select = Select::new();
    select.from.push(FromItem::table("quads", None));
    select
        .fields
        .push(Field::new("quads", result.column(), "__node"));
    for (direction, tags) in &save {
        for tag in tags {
            select
                .fields
                .push(Field::new("quads", direction.column(), tag.clone()));
        }
    }
    for (direction, value) in filter {
        let hash = NodeHash::of(&value);
        let idx = select.push_hash_param(hash);
        select
            .where_
            .push(WhereClause::eq_param("quads", direction.column(), idx));
    }
    (Shape::Lowered(select), true)
}

/// Rule 3: `Filter(from, filters)` where `from` is a nodes-only select -> split recognized
/// filters into the select's own `WHERE`, wrapping any remainder in a residual `Filter`.
fn lower_filter(dialect: &dyn Dialect, from: Shape, filters: Vec<ValueFilter>) -> (Shape, bool) {
    let Some(select) = as_select(&from) else {
        return (
            Shape::Filter {
                from: Box::new(from),
                filters,
            },
            false,
        );
    };
    if !is_nodes_only(select) {
        return (
            Shape::Filter {
                from: Box::new(from),
                filters,
            },
            false,
        );
    }
    let alias = select.from[0].effective_alias().to_owned();
    let mut select = select.clone();
    let mut residual = Vec::new();
    for filter in filters {
        match &filter {
            ValueFilter::Comparison { op, value } => {
                push_value_predicate(&mut select, &alias, value, (*op).into());
            }
            ValueFilter::Regexp { pattern, .. } | ValueFilter::Wildcard { pattern } => {
                if let Some(regexp_op) = dialect.regexp_op() {
                    let idx = select.push_value_param(Value::String(pattern.clone()));
                    select.where_.push(WhereClause {
                        table: alias.clone(),
                        field: "value_string".to_owned(),
                        op: regexp_op.into(),
                        operand: Operand::Placeholder(idx),
                    });
                } else {
                    residual.push(filter);
                }
            }
        }
    }
    if residual.is_empty() {
        (Shape::Lowered(select), true)
    } else {
        (
            Shape::Filter {
                from: Box::new(Shape::Lowered(select)),
                filters: residual,
            },
            false,
        )
    }
}

fn is_nodes_only(select: &Select) -> bool {
    select.from.len() == 1
        && matches!(&select.from[0], FromItem::Table { name, .. } if name == "nodes")
}

/// Rule 7: `Save{from, tags}` -> prepends copies of the `__node` field aliased under each tag.
fn lower_save(from: Shape, tags: Vec<String>) -> (Shape, bool) {
    let Some(select) = as_select(&from) else {
        return (
            Shape::Save {
                from: Box::new(from),
                tags,
            },
            false,
        );
    };
    let mut select = select.clone();
    let Some(node_field) = select.node_field().cloned() else {
        return (
            Shape::Save {
                from: Box::new(Shape::Lowered(select)),
                tags,
            },
            false,
        );
    };
    for tag in tags {
        select
            .fields
            .push(Field::new(node_field.table.clone(), node_field.name.clone(), tag));
    }
    (Shape::Lowered(select), true)
}

/// Rule 8: `Page{from, skip, limit}` -> composes pagination with `from`'s own offset/limit using
/// the `0 = infinite` convention; emits a never-matching sentinel on an empty intersection.
fn lower_page(dialect: &dyn Dialect, from: Shape, skip: u64, limit: u64) -> (Shape, bool) {
    let Some(select) = as_select(&from) else {
        return (
            Shape::Page {
                from: Box::new(from),
                skip,
                limit,
            },
            false,
        );
    };
    let mut select = select.clone();
    let new_skip = select.offset + skip;
    let inner_limit = none_if_zero(select.limit);
    let remaining = inner_limit.map(|l| l.saturating_sub(skip));
    let outer_limit = none_if_zero(limit);
    let composed = match (remaining, outer_limit) {
        (None, None) => None,
        (Some(r), None) => Some(r),
        (None, Some(o)) => Some(o),
        (Some(r), Some(o)) => Some(r.min(o)),
    };
    if composed == Some(0) {
        let never_table = select
            .from
            .first()
            .map(|f| f.effective_alias().to_owned())
            .unwrap_or_default();
        select.where_.push(WhereClause::never(never_table));
        select.offset = 0;
        select.limit = 0;
        return (Shape::Lowered(select), true);
    }
    if new_skip > 0 && composed.is_none() && dialect.no_offset_without_limit() {
        return (
            Shape::Page {
                from: Box::new(Shape::Lowered(select)),
                skip,
                limit,
            },
            false,
        );
    }
    select.offset = new_skip;
    select.limit = composed.unwrap_or(0);
    (Shape::Lowered(select), true)
}

fn none_if_zero(n: u64) -> Option<u64> {
    if n == 0 { None } else { Some(n) }
}

/// Rule 9: `Intersect[shapes]` -> merges every select-shaped child onto a primary select via an
/// inner join on `__node`; non-select children are retained inside a residual `Intersect`.
fn lower_intersect(alloc: &mut AliasAllocator, shapes: Vec<Shape>) -> (Shape, bool) {
    let mut selects = Vec::new();
    let mut residual = Vec::new();
    for shape in shapes {
        match as_select(&shape) {
            Some(select) => selects.push(select.clone()),
            None => residual.push(shape),
        }
    }
    if selects.len() < 2 {
        let mut rebuilt: Vec<Shape> = selects.into_iter().map(Shape::Lowered).collect();
        rebuilt.extend(residual);
        return (Shape::Intersect(rebuilt), false);
    }
    let mut primary = selects.remove(0);
    ensure_aliases(&mut primary, alloc);
    let Some(primary_node) = primary.node_field().cloned() else {
        let mut rebuilt = vec![Shape::Lowered(primary)];
        rebuilt.extend(selects.into_iter().map(Shape::Lowered));
        rebuilt.extend(residual);
        return (Shape::Intersect(rebuilt), false);
    };
    for secondary in selects {
        let Some((remote_table, remote_field)) = merge_select(&mut primary, alloc, secondary, true) else {
            continue;
        };
        primary.where_.push(WhereClause::eq_field(
            primary_node.table.clone(),
            primary_node.name.clone(),
            remote_table,
            remote_field,
        ));
    }
    if residual.is_empty() {
        (Shape::Lowered(primary), true)
    } else {
        let mut rebuilt = vec![Shape::Lowered(primary)];
        rebuilt.extend(residual);
        (Shape::Intersect(rebuilt), false)
    }
}
