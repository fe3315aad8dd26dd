//! Renders an optimized [`Select`] to dialect SQL text plus its positional argument list.
//!
//! A single counter and a single flat `args` accumulator are threaded through one recursive
//! render pass (`BuildCtx`): `From` sources are rendered — and so consume their own nested
//! `Params` — before a select's own `Where`, so a subquery's parameters land in `args` ahead of
//! the outer `WHERE`'s, matching the positional placeholders the dialect emits as it goes.

use crate::dialect::Dialect;
use crate::select::{FromItem, Operand, Param, Select, WhereClause, WhereOp};

/// Renders `select` against `dialect`, returning `(sql, args)` ready to hand to the execution
/// surface as a single prepared statement.
pub fn build(dialect: &dyn Dialect, select: &Select) -> (String, Vec<Param>) {
    let mut ctx = BuildCtx {
        dialect,
        next_placeholder: 1,
        args: Vec::new(),
    };
    let sql = ctx.render_select(select);
    (sql, ctx.args)
}

struct BuildCtx<'d> {
    dialect: &'d dyn Dialect,
    next_placeholder: u32,
    args: Vec<Param>,
}

impl BuildCtx<'_> {
    fn next_placeholder_sql(&mut self) -> String {
        let sql = self.dialect.placeholder(self.next_placeholder);
        self.next_placeholder += 1;
        sql
    }

    fn render_select(&mut self, select: &Select) -> String {
        let fields_sql = self.render_fields(select);
        let from_sql = self.render_from(&select.from);
        let mut sql = format!("SELECT {fields_sql} FROM {from_sql}");

        if !select.where_.is_empty() {
            let clauses: Vec<String> = select
                .where_
                .iter()
                .map(|clause| self.render_where(select, clause))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        if select.next_path && !select.is_quad_shaped() {
            sql.push_str(" ORDER BY __node");
        }

        if select.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", select.limit));
        }
        if select.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", select.offset));
        }
        sql
    }

    fn render_fields(&self, select: &Select) -> String {
        let qualify = qualify_columns(select);
        select
            .fields
            .iter()
            .map(|f| {
                let column = if qualify {
                    format!("{}.{}", f.table, f.name)
                } else {
                    f.name.clone()
                };
                if f.alias == f.name {
                    column
                } else {
                    format!("{column} AS {}", quote_ident(self.dialect, &f.alias))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn render_from(&mut self, from: &[FromItem]) -> String {
        from.iter()
            .map(|item| match item {
                FromItem::Table { name, alias } => match alias {
                    Some(alias) => format!("{name} AS {alias}"),
                    None => name.clone(),
                },
                FromItem::Subquery { select, alias } => {
                    let inner = self.render_select(select);
                    format!("({inner}) AS {alias}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn render_where(&mut self, select: &Select, clause: &WhereClause) -> String {
        if clause.field == "__never__" {
            return "1 = 0".to_owned();
        }
        let field_sql = if qualify_columns(select) {
            format!("{}.{}", clause.table, clause.field)
        } else {
            clause.field.clone()
        };
        match clause.op {
            WhereOp::IsNull => format!("{field_sql} IS NULL"),
            WhereOp::IsNotNull => format!("{field_sql} IS NOT NULL"),
            WhereOp::IsTrue => format!("{field_sql} IS TRUE"),
            WhereOp::Regexp => {
                let operand_sql = self.render_operand(select, &clause.operand);
                self.dialect.render_regexp(&field_sql, &operand_sql)
            }
            op @ (WhereOp::Eq | WhereOp::Gt | WhereOp::Gte | WhereOp::Lt | WhereOp::Lte) => {
                let operand_sql = self.render_operand(select, &clause.operand);
                format!("{field_sql} {} {operand_sql}", sql_op(op))
            }
        }
    }

    fn render_operand(&mut self, select: &Select, operand: &Operand) -> String {
        match operand {
            Operand::Placeholder(idx) => {
                let param = select
                    .params
                    .get(*idx)
                    .unwrap_or_else(|| panic!("placeholder {idx} has no matching param; optimizer bug"))
                    .clone();
                self.args.push(param);
                self.next_placeholder_sql()
            }
            Operand::FieldRef { table, name } => format!("{table}.{name}"),
            Operand::None => String::new(),
        }
    }
}

/// A select reading from a single, implicitly-named table has no need to qualify its own
/// columns; one explicitly aliased (`Quads`, always) or joining multiple sources does.
fn qualify_columns(select: &Select) -> bool {
    !matches!(
        select.from.as_slice(),
        [FromItem::Table { alias: None, .. }]
    )
}

fn sql_op(op: WhereOp) -> &'static str {
    match op {
        WhereOp::Eq => "=",
        WhereOp::Gt => ">",
        WhereOp::Gte => ">=",
        WhereOp::Lt => "<",
        WhereOp::Lte => "<=",
        WhereOp::IsNull | WhereOp::IsNotNull | WhereOp::IsTrue | WhereOp::Regexp => {
            unreachable!("handled by render_where directly")
        }
    }
}

/// Quotes `ident` with the dialect's field-quote character only when it isn't already a plain
/// identifier (ASCII alphanumeric/underscore, not digit-leading) — e.g. a user tag containing a
/// space (`"l 1"`).
fn quote_ident(dialect: &dyn Dialect, ident: &str) -> String {
    let is_plain = !ident.is_empty()
        && ident
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if is_plain {
        ident.to_owned()
    } else {
        let quote = dialect.field_quote();
        let escaped = ident.replace(quote, &format!("{quote}{quote}"));
        format!("{quote}{escaped}{quote}")
    }
}
