//! An in-process implementation of the abstract SQL execution surface (`backend.rs`), used so
//! this crate's own test suite can exercise the optimizer/builder/iterator/mutation engine
//! without a live database connection.
//!
//! Grounded on the teacher's `MemoryStorage`: a second, purely-in-Rust implementation of the
//! same trait surface the "real" backend exposes, kept around for the test suite rather than
//! production traffic. Since this crate's abstract surface is a SQL one rather than a term store,
//! the implementation here is a small hand-rolled tokenizer/parser/interpreter scoped to exactly
//! the SQL text this crate's own `builder.rs`/`mutation.rs`/`store.rs` emit — not a general SQL
//! engine. Transactions snapshot the whole table set on `savepoint` rather than tracking
//! individual writes, which is wasteful at real-database scale but exactly the "simple and
//! obviously correct" trade a reference engine should make.

use std::sync::{Arc, Mutex, RwLock};

use time::format_description::well_known::Rfc3339;

use crate::backend::{CancellationToken, Column, Row, RowCursor, SqlConnection, SqlTransaction, map_driver_error};
use crate::dialect::Dialect;
use crate::error::{DomainError, Result};
use crate::select::Param;
use crate::value::Value;

// ---------------------------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(i64),
    Placeholder,
    Star,
    Comma,
    Dot,
    LParen,
    RParen,
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Eof,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Placeholder);
                i += 1;
            }
            '$' => {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                tokens.push(Token::Placeholder);
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '>' => {
                i += 1;
                if chars.get(i) == Some(&'=') {
                    tokens.push(Token::Gte);
                    i += 1;
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '<' => {
                i += 1;
                if chars.get(i) == Some(&'=') {
                    tokens.push(Token::Lte);
                    i += 1;
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(text.parse().unwrap_or(0)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => i += 1,
        }
    }
    tokens.push(Token::Eof);
    tokens
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(sql: &str) -> Self {
        Self {
            tokens: tokenize(sql),
            pos: 0,
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s.eq_ignore_ascii_case(word))
    }

    fn eat_keyword(&mut self, word: &str) -> std::result::Result<(), String> {
        if self.is_keyword(word) {
            self.advance();
            Ok(())
        } else {
            Err(format!("expected {word}, found {:?}", self.peek()))
        }
    }

    fn eat_ident(&mut self) -> std::result::Result<String, String> {
        match self.advance() {
            Token::Ident(s) => Ok(s),
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    fn eat(&mut self, token: Token) -> std::result::Result<(), String> {
        if *self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(format!("expected {token:?}, found {:?}", self.peek()))
        }
    }

    fn eat_number(&mut self) -> std::result::Result<u64, String> {
        match self.advance() {
            Token::Number(n) => Ok(n as u64),
            other => Err(format!("expected a number, found {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------------------------

enum Stmt {
    Select(SelectStmt),
    Insert(InsertStmt),
    Delete(DeleteStmt),
    CreateTable(CreateTableStmt),
    CreateIndex(UniqueIndexDef),
    /// A plain (non-unique) index, parsed and discarded: this engine always full-scans.
    CreateNonUniqueIndex,
}

struct SelectStmt {
    fields: Vec<SelectItem>,
    from: Vec<FromSrc>,
    where_: Vec<WherePred>,
    order_by_node: bool,
    limit: Option<u64>,
    offset: Option<u64>,
}

enum SelectItem {
    Literal(i64),
    Column {
        table: Option<String>,
        name: String,
        alias: Option<String>,
    },
    CountStar {
        alias: Option<String>,
    },
    Max {
        column: String,
        alias: Option<String>,
    },
}

enum FromSrc {
    Table { name: String, alias: Option<String> },
    Subquery { select: Box<SelectStmt>, alias: String },
}

#[derive(Clone, Copy)]
enum CmpOpSql {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

enum Rhs {
    Placeholder,
    FieldRef { table: String, field: String },
}

enum WherePred {
    Cmp {
        table: Option<String>,
        field: String,
        op: CmpOpSql,
        rhs: Rhs,
    },
    IsNull {
        table: Option<String>,
        field: String,
    },
    IsNotNull {
        table: Option<String>,
        field: String,
    },
    IsTrue {
        table: Option<String>,
        field: String,
    },
    /// The `1 = 0` sentinel the builder emits for `WhereClause::never`.
    Literal(bool),
}

struct InsertStmt {
    table: String,
    columns: Vec<String>,
    ignore_dup: bool,
}

struct DeleteStmt {
    table: String,
    where_: Vec<WherePred>,
}

struct CreateTableStmt {
    name: String,
    columns: Vec<String>,
    primary_key: Option<String>,
    autoincrement: Option<String>,
}

#[derive(Clone)]
enum IndexPredicate {
    IsNull(String),
    IsNotNull(String),
}

#[derive(Clone)]
struct UniqueIndexDef {
    table: String,
    columns: Vec<String>,
    predicate: Option<IndexPredicate>,
}

fn parse_statement(sql: &str) -> std::result::Result<Stmt, String> {
    let mut p = Parser::new(sql);
    if p.is_keyword("SELECT") {
        Ok(Stmt::Select(parse_select(&mut p)?))
    } else if p.is_keyword("INSERT") {
        Ok(Stmt::Insert(parse_insert(&mut p)?))
    } else if p.is_keyword("DELETE") {
        Ok(Stmt::Delete(parse_delete(&mut p)?))
    } else if p.is_keyword("CREATE") {
        parse_create(&mut p)
    } else {
        Err(format!("unrecognized statement: {sql}"))
    }
}

fn parse_select(p: &mut Parser) -> std::result::Result<SelectStmt, String> {
    p.eat_keyword("SELECT")?;
    let fields = parse_select_items(p)?;
    let from = if p.is_keyword("FROM") {
        p.advance();
        parse_from_list(p)?
    } else {
        Vec::new()
    };
    let where_ = if p.is_keyword("WHERE") {
        p.advance();
        parse_where_list(p)?
    } else {
        Vec::new()
    };
    let mut order_by_node = false;
    if p.is_keyword("ORDER") {
        p.advance();
        p.eat_keyword("BY")?;
        let column = p.eat_ident()?;
        if column != "__node" {
            return Err(format!("unsupported ORDER BY column: {column}"));
        }
        order_by_node = true;
    }
    let limit = if p.is_keyword("LIMIT") {
        p.advance();
        Some(p.eat_number()?)
    } else {
        None
    };
    let offset = if p.is_keyword("OFFSET") {
        p.advance();
        Some(p.eat_number()?)
    } else {
        None
    };
    Ok(SelectStmt {
        fields,
        from,
        where_,
        order_by_node,
        limit,
        offset,
    })
}

fn parse_select_items(p: &mut Parser) -> std::result::Result<Vec<SelectItem>, String> {
    let mut items = vec![parse_select_item(p)?];
    while matches!(p.peek(), Token::Comma) {
        p.advance();
        items.push(parse_select_item(p)?);
    }
    Ok(items)
}

fn parse_optional_alias(p: &mut Parser) -> std::result::Result<Option<String>, String> {
    if p.is_keyword("AS") {
        p.advance();
        Ok(Some(p.eat_ident()?))
    } else {
        Ok(None)
    }
}

fn parse_select_item(p: &mut Parser) -> std::result::Result<SelectItem, String> {
    if let Token::Number(n) = p.peek().clone() {
        p.advance();
        return Ok(SelectItem::Literal(n));
    }
    if p.is_keyword("COUNT") {
        p.advance();
        p.eat(Token::LParen)?;
        p.eat(Token::Star)?;
        p.eat(Token::RParen)?;
        return Ok(SelectItem::CountStar {
            alias: parse_optional_alias(p)?,
        });
    }
    if p.is_keyword("MAX") {
        p.advance();
        p.eat(Token::LParen)?;
        let column = p.eat_ident()?;
        p.eat(Token::RParen)?;
        return Ok(SelectItem::Max {
            column,
            alias: parse_optional_alias(p)?,
        });
    }
    let first = p.eat_ident()?;
    let (table, name) = if matches!(p.peek(), Token::Dot) {
        p.advance();
        (Some(first), p.eat_ident()?)
    } else {
        (None, first)
    };
    Ok(SelectItem::Column {
        table,
        name,
        alias: parse_optional_alias(p)?,
    })
}

fn parse_from_list(p: &mut Parser) -> std::result::Result<Vec<FromSrc>, String> {
    let mut items = vec![parse_from_item(p)?];
    while matches!(p.peek(), Token::Comma) {
        p.advance();
        items.push(parse_from_item(p)?);
    }
    Ok(items)
}

fn parse_from_item(p: &mut Parser) -> std::result::Result<FromSrc, String> {
    if matches!(p.peek(), Token::LParen) {
        p.advance();
        let inner = parse_select(p)?;
        p.eat(Token::RParen)?;
        p.eat_keyword("AS")?;
        let alias = p.eat_ident()?;
        return Ok(FromSrc::Subquery {
            select: Box::new(inner),
            alias,
        });
    }
    let name = p.eat_ident()?;
    let alias = if p.is_keyword("AS") {
        p.advance();
        Some(p.eat_ident()?)
    } else {
        None
    };
    Ok(FromSrc::Table { name, alias })
}

fn parse_where_list(p: &mut Parser) -> std::result::Result<Vec<WherePred>, String> {
    let mut preds = vec![parse_where_pred(p)?];
    while p.is_keyword("AND") {
        p.advance();
        preds.push(parse_where_pred(p)?);
    }
    Ok(preds)
}

fn parse_where_pred(p: &mut Parser) -> std::result::Result<WherePred, String> {
    if let Token::Number(lhs) = p.peek().clone() {
        p.advance();
        p.eat(Token::Eq)?;
        let rhs = p.eat_number()? as i64;
        return Ok(WherePred::Literal(lhs == rhs));
    }
    let first = p.eat_ident()?;
    let (table, field) = if matches!(p.peek(), Token::Dot) {
        p.advance();
        (Some(first), p.eat_ident()?)
    } else {
        (None, first)
    };
    if p.is_keyword("IS") {
        p.advance();
        if p.is_keyword("NOT") {
            p.advance();
            p.eat_keyword("NULL")?;
            return Ok(WherePred::IsNotNull { table, field });
        }
        if p.is_keyword("TRUE") {
            p.advance();
            return Ok(WherePred::IsTrue { table, field });
        }
        p.eat_keyword("NULL")?;
        return Ok(WherePred::IsNull { table, field });
    }
    let op = match p.advance() {
        Token::Eq => CmpOpSql::Eq,
        Token::Gt => CmpOpSql::Gt,
        Token::Gte => CmpOpSql::Gte,
        Token::Lt => CmpOpSql::Lt,
        Token::Lte => CmpOpSql::Lte,
        other => return Err(format!("expected a comparison operator, found {other:?}")),
    };
    let rhs = if matches!(p.peek(), Token::Placeholder) {
        p.advance();
        Rhs::Placeholder
    } else {
        let table = p.eat_ident()?;
        p.eat(Token::Dot)?;
        let field = p.eat_ident()?;
        Rhs::FieldRef { table, field }
    };
    Ok(WherePred::Cmp { table, field, op, rhs })
}

fn parse_insert(p: &mut Parser) -> std::result::Result<InsertStmt, String> {
    p.eat_keyword("INSERT")?;
    p.eat_keyword("INTO")?;
    let table = p.eat_ident()?;
    p.eat(Token::LParen)?;
    let mut columns = vec![p.eat_ident()?];
    while matches!(p.peek(), Token::Comma) {
        p.advance();
        columns.push(p.eat_ident()?);
    }
    p.eat(Token::RParen)?;
    p.eat_keyword("VALUES")?;
    p.eat(Token::LParen)?;
    let mut value_count = 1;
    p.eat(Token::Placeholder)?;
    while matches!(p.peek(), Token::Comma) {
        p.advance();
        p.eat(Token::Placeholder)?;
        value_count += 1;
    }
    p.eat(Token::RParen)?;
    if columns.len() != value_count {
        return Err("column/value count mismatch in INSERT".to_owned());
    }
    let mut ignore_dup = false;
    if p.is_keyword("ON") {
        p.advance();
        p.eat_keyword("CONFLICT")?;
        if matches!(p.peek(), Token::LParen) {
            p.advance();
            let _conflict_column = p.eat_ident()?;
            p.eat(Token::RParen)?;
        }
        p.eat_keyword("DO")?;
        p.eat_keyword("NOTHING")?;
        ignore_dup = true;
    }
    Ok(InsertStmt {
        table,
        columns,
        ignore_dup,
    })
}

fn parse_delete(p: &mut Parser) -> std::result::Result<DeleteStmt, String> {
    p.eat_keyword("DELETE")?;
    p.eat_keyword("FROM")?;
    let table = p.eat_ident()?;
    p.eat_keyword("WHERE")?;
    Ok(DeleteStmt {
        table,
        where_: parse_where_list(p)?,
    })
}

fn parse_create(p: &mut Parser) -> std::result::Result<Stmt, String> {
    p.eat_keyword("CREATE")?;
    if p.is_keyword("TABLE") {
        p.advance();
        let name = p.eat_ident()?;
        p.eat(Token::LParen)?;
        let mut columns = Vec::new();
        let mut primary_key = None;
        let mut autoincrement = None;
        loop {
            let column = p.eat_ident()?;
            // Consume the rest of this column's type/constraint tokens, noting the two
            // constraints this engine cares about; everything else (BLOB, TEXT, NOT NULL, ...)
            // only matters to a real database's storage layer.
            loop {
                match p.peek().clone() {
                    Token::Comma | Token::RParen => break,
                    Token::Ident(s) if s.eq_ignore_ascii_case("PRIMARY") => {
                        p.advance();
                        p.eat_keyword("KEY")?;
                        primary_key = Some(column.clone());
                    }
                    Token::Ident(s) if s.eq_ignore_ascii_case("AUTOINCREMENT") => {
                        p.advance();
                        autoincrement = Some(column.clone());
                    }
                    _ => {
                        p.advance();
                    }
                }
            }
            columns.push(column);
            if matches!(p.peek(), Token::Comma) {
                p.advance();
                continue;
            }
            break;
        }
        p.eat(Token::RParen)?;
        return Ok(Stmt::CreateTable(CreateTableStmt {
            name,
            columns,
            primary_key,
            autoincrement,
        }));
    }
    let unique = if p.is_keyword("UNIQUE") {
        p.advance();
        true
    } else {
        false
    };
    p.eat_keyword("INDEX")?;
    let _name = p.eat_ident()?;
    p.eat_keyword("ON")?;
    let table = p.eat_ident()?;
    p.eat(Token::LParen)?;
    let mut columns = vec![p.eat_ident()?];
    while matches!(p.peek(), Token::Comma) {
        p.advance();
        columns.push(p.eat_ident()?);
    }
    p.eat(Token::RParen)?;
    let predicate = if p.is_keyword("WHERE") {
        p.advance();
        let field = p.eat_ident()?;
        p.eat_keyword("IS")?;
        if p.is_keyword("NOT") {
            p.advance();
            p.eat_keyword("NULL")?;
            Some(IndexPredicate::IsNotNull(field))
        } else {
            p.eat_keyword("NULL")?;
            Some(IndexPredicate::IsNull(field))
        }
    } else {
        None
    };
    if unique {
        Ok(Stmt::CreateIndex(UniqueIndexDef {
            table,
            columns,
            predicate,
        }))
    } else {
        Ok(Stmt::CreateNonUniqueIndex)
    }
}

// ---------------------------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Table {
    columns: Vec<String>,
    primary_key: Option<String>,
    autoincrement: Option<String>,
    rows: Vec<Vec<Option<Column>>>,
    next_autoincrement: i64,
}

#[derive(Clone, Default)]
struct DataState {
    tables: std::collections::HashMap<String, Table>,
}

/// One cell of an intermediate (not-yet-projected) row: a value addressed by the table/alias it
/// came from plus its column name, so `WHERE`/join predicates can resolve both qualified
/// (`t_1.subject_hash`) and unqualified (`value_string`) references against a row built from an
/// arbitrary cross product of sources.
#[derive(Clone)]
struct Cell {
    table: Option<String>,
    name: String,
    value: Option<Column>,
}

type NamedRow = Vec<Cell>;

fn resolve_cell<'a>(row: &'a NamedRow, table: Option<&str>, name: &str) -> Option<&'a Option<Column>> {
    row.iter()
        .find(|c| c.name == name && (table.is_none() || c.table.as_deref() == table))
        .map(|c| &c.value)
}

fn cell_value(row: &NamedRow, table: Option<&str>, name: &str) -> Option<Column> {
    resolve_cell(row, table, name).cloned().flatten()
}

fn value_to_column(value: &Value) -> Column {
    match value {
        Value::String(s) => Column::Text(s.clone()),
        Value::Int(n) => Column::Int(*n),
        Value::Float(f) => Column::Float(*f),
        Value::Bool(b) => Column::Bool(*b),
        Value::Time(t) => {
            let utc = t.to_offset(time::UtcOffset::UTC);
            let formatted = utc
                .format(&Rfc3339)
                .unwrap_or_else(|_| utc.unix_timestamp().to_string());
            Column::Text(formatted)
        }
        other => unreachable!("bound Value params are only ever String/Int/Float/Bool/Time, got {other:?}"),
    }
}

fn param_to_column(param: &Param) -> Option<Column> {
    match param {
        Param::Hash(hash) => Some(Column::Hash(*hash.as_bytes())),
        Param::Value(value) => Some(value_to_column(value)),
        Param::Null => None,
    }
}

fn compare(lhs: &Option<Column>, op: CmpOpSql, rhs: &Option<Column>) -> bool {
    let (Some(l), Some(r)) = (lhs, rhs) else {
        return false;
    };
    match (l, r) {
        (Column::Hash(a), Column::Hash(b)) => matches!(op, CmpOpSql::Eq) && a == b,
        (Column::Text(a), Column::Text(b)) => cmp_ord(a, b, op),
        (Column::Int(a), Column::Int(b)) => cmp_ord(a, b, op),
        (Column::Float(a), Column::Float(b)) => cmp_ord(a, b, op),
        (Column::Bool(a), Column::Bool(b)) => cmp_ord(a, b, op),
        _ => false,
    }
}

fn cmp_ord<T: PartialOrd>(a: &T, b: &T, op: CmpOpSql) -> bool {
    match op {
        CmpOpSql::Eq => a == b,
        CmpOpSql::Gt => a > b,
        CmpOpSql::Gte => a >= b,
        CmpOpSql::Lt => a < b,
        CmpOpSql::Lte => a <= b,
    }
}

enum ResolvedRhs {
    Value(Option<Column>),
    FieldRef { table: String, field: String },
}

enum ResolvedPred {
    Cmp {
        table: Option<String>,
        field: String,
        op: CmpOpSql,
        rhs: ResolvedRhs,
    },
    IsNull { table: Option<String>, field: String },
    IsNotNull { table: Option<String>, field: String },
    IsTrue { table: Option<String>, field: String },
    Literal(bool),
}

/// Binds each `WherePred`'s placeholder (if any) to the next argument in `args`, in left-to-right
/// clause order — matching the order the builder assigned placeholders as it rendered the select.
fn resolve_where(preds: &[WherePred], args: &mut std::slice::Iter<'_, Param>) -> std::result::Result<Vec<ResolvedPred>, String> {
    preds
        .iter()
        .map(|pred| {
            Ok(match pred {
                WherePred::Cmp { table, field, op, rhs } => {
                    let rhs = match rhs {
                        Rhs::Placeholder => {
                            let param = args.next().ok_or("not enough bound arguments for this statement")?;
                            ResolvedRhs::Value(param_to_column(param))
                        }
                        Rhs::FieldRef { table, field } => ResolvedRhs::FieldRef {
                            table: table.clone(),
                            field: field.clone(),
                        },
                    };
                    ResolvedPred::Cmp {
                        table: table.clone(),
                        field: field.clone(),
                        op: *op,
                        rhs,
                    }
                }
                WherePred::IsNull { table, field } => ResolvedPred::IsNull {
                    table: table.clone(),
                    field: field.clone(),
                },
                WherePred::IsNotNull { table, field } => ResolvedPred::IsNotNull {
                    table: table.clone(),
                    field: field.clone(),
                },
                WherePred::IsTrue { table, field } => ResolvedPred::IsTrue {
                    table: table.clone(),
                    field: field.clone(),
                },
                WherePred::Literal(b) => ResolvedPred::Literal(*b),
            })
        })
        .collect()
}

fn row_matches(row: &NamedRow, preds: &[ResolvedPred]) -> bool {
    preds.iter().all(|pred| match pred {
        ResolvedPred::Literal(b) => *b,
        ResolvedPred::IsNull { table, field } => resolve_cell(row, table.as_deref(), field).is_none_or(Option::is_none),
        ResolvedPred::IsNotNull { table, field } => {
            resolve_cell(row, table.as_deref(), field).is_some_and(Option::is_some)
        }
        ResolvedPred::IsTrue { table, field } => {
            matches!(cell_value(row, table.as_deref(), field), Some(Column::Bool(true)))
        }
        ResolvedPred::Cmp { table, field, op, rhs } => {
            let lhs = cell_value(row, table.as_deref(), field);
            let rhs = match rhs {
                ResolvedRhs::Value(v) => v.clone(),
                ResolvedRhs::FieldRef { table, field } => cell_value(row, Some(table.as_str()), field),
            };
            compare(&lhs, *op, &rhs)
        }
    })
}

fn cross_product(sources: Vec<Vec<NamedRow>>) -> Vec<NamedRow> {
    sources.into_iter().fold(vec![NamedRow::new()], |acc, rows| {
        let mut out = Vec::with_capacity(acc.len() * rows.len().max(1));
        for left in &acc {
            for right in &rows {
                let mut combined = left.clone();
                combined.extend(right.iter().cloned());
                out.push(combined);
            }
        }
        out
    })
}

fn compare_sort_key(a: &Option<Column>, b: &Option<Column>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Column::Hash(x)), Some(Column::Hash(y))) => x.cmp(y),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// The underlying `(table, column)` a select's `__node`-aliased item reads from, if it has one.
fn node_field_ref(fields: &[SelectItem]) -> Option<(Option<String>, String)> {
    fields.iter().find_map(|field| match field {
        SelectItem::Column { table, name, alias } => {
            let output_name = alias.as_deref().unwrap_or(name);
            (output_name == "__node").then(|| (table.clone(), name.clone()))
        }
        _ => None,
    })
}

fn project_row(fields: &[SelectItem], row: &NamedRow) -> std::result::Result<NamedRow, String> {
    fields
        .iter()
        .map(|field| match field {
            SelectItem::Literal(n) => Ok(Cell {
                table: None,
                name: "literal".to_owned(),
                value: Some(Column::Int(*n)),
            }),
            SelectItem::Column { table, name, alias } => Ok(Cell {
                table: None,
                name: alias.clone().unwrap_or_else(|| name.clone()),
                value: cell_value(row, table.as_deref(), name),
            }),
            SelectItem::CountStar { .. } | SelectItem::Max { .. } => {
                Err("aggregate item mixed into a non-aggregate projection".to_owned())
            }
        })
        .collect()
}

fn project_aggregate(fields: &[SelectItem], rows: &[NamedRow]) -> std::result::Result<NamedRow, String> {
    fields
        .iter()
        .map(|field| match field {
            SelectItem::CountStar { alias } => Ok(Cell {
                table: None,
                name: alias.clone().unwrap_or_else(|| "count".to_owned()),
                value: Some(Column::Int(rows.len() as i64)),
            }),
            SelectItem::Max { column, alias } => {
                let max = rows
                    .iter()
                    .filter_map(|row| cell_value(row, None, column))
                    .filter_map(|value| value.as_int())
                    .max();
                Ok(Cell {
                    table: None,
                    name: alias.clone().unwrap_or_else(|| column.clone()),
                    value: max.map(Column::Int),
                })
            }
            SelectItem::Literal(n) => Ok(Cell {
                table: None,
                name: "literal".to_owned(),
                value: Some(Column::Int(*n)),
            }),
            SelectItem::Column { .. } => {
                Err("plain column mixed with an aggregate item (no GROUP BY support)".to_owned())
            }
        })
        .collect()
}

/// Evaluates `stmt` against `state`, returning its result rows still tagged by source table/alias
/// (used directly when `stmt` is itself a nested `FROM` subquery) rather than the flattened
/// `backend::Row` shape `query()` ultimately returns.
fn eval_select_rows(
    state: &DataState,
    stmt: &SelectStmt,
    args: &mut std::slice::Iter<'_, Param>,
) -> std::result::Result<Vec<NamedRow>, String> {
    let mut sources = Vec::new();
    for src in &stmt.from {
        match src {
            FromSrc::Table { name, alias } => {
                let table = state
                    .tables
                    .get(name)
                    .ok_or_else(|| format!("no such table: {name}"))?;
                let alias_name = alias.clone().unwrap_or_else(|| name.clone());
                let rows = table
                    .rows
                    .iter()
                    .map(|row| {
                        table
                            .columns
                            .iter()
                            .cloned()
                            .zip(row.iter().cloned())
                            .map(|(name, value)| Cell {
                                table: Some(alias_name.clone()),
                                name,
                                value,
                            })
                            .collect::<NamedRow>()
                    })
                    .collect::<Vec<_>>();
                sources.push(rows);
            }
            FromSrc::Subquery { select, alias } => {
                let inner = eval_select_rows(state, select, args)?;
                let rewritten = inner
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(|mut cell| {
                                cell.table = Some(alias.clone());
                                cell
                            })
                            .collect()
                    })
                    .collect();
                sources.push(rewritten);
            }
        }
    }

    let base_rows = if sources.is_empty() {
        vec![NamedRow::new()]
    } else {
        cross_product(sources)
    };

    let resolved_where = resolve_where(&stmt.where_, args)?;
    let mut matched: Vec<NamedRow> = base_rows.into_iter().filter(|row| row_matches(row, &resolved_where)).collect();

    if stmt.order_by_node {
        // `matched` rows are still keyed by their source table's own column names at this point
        // (projection to output aliases happens below); resolve whichever select item is
        // aliased `__node` back to its underlying (table, column) so the sort reads the right
        // cell instead of a column literally named `__node`, which only exists post-projection.
        let node_ref = node_field_ref(&stmt.fields);
        matched.sort_by(|a, b| match &node_ref {
            Some((table, name)) => compare_sort_key(
                &cell_value(a, table.as_deref(), name),
                &cell_value(b, table.as_deref(), name),
            ),
            None => std::cmp::Ordering::Equal,
        });
    }

    let has_aggregate = stmt
        .fields
        .iter()
        .any(|f| matches!(f, SelectItem::CountStar { .. } | SelectItem::Max { .. }));
    if has_aggregate {
        return Ok(vec![project_aggregate(&stmt.fields, &matched)?]);
    }

    let offset = stmt.offset.unwrap_or(0) as usize;
    let after_offset = matched.into_iter().skip(offset);
    let limited: Vec<NamedRow> = match stmt.limit {
        Some(n) => after_offset.take(n as usize).collect(),
        None => after_offset.collect(),
    };
    limited.iter().map(|row| project_row(&stmt.fields, row)).collect()
}

fn named_row_to_row(row: NamedRow) -> Row {
    row.into_iter().map(|c| c.value).collect()
}

fn index_predicate_holds(columns: &[String], row: &[Option<Column>], predicate: &Option<IndexPredicate>) -> bool {
    let (column, want_null) = match predicate {
        None => return true,
        Some(IndexPredicate::IsNull(c)) => (c, true),
        Some(IndexPredicate::IsNotNull(c)) => (c, false),
    };
    let Some(idx) = columns.iter().position(|c| c == column) else {
        return false;
    };
    row[idx].is_none() == want_null
}

fn exec_insert(table: &mut Table, indexes: &[UniqueIndexDef], stmt: &InsertStmt, args: &[Param]) -> std::result::Result<u64, String> {
    if args.len() != stmt.columns.len() {
        return Err("column/value count mismatch in INSERT".to_owned());
    }
    let mut row: Vec<Option<Column>> = vec![None; table.columns.len()];
    for (column, param) in stmt.columns.iter().zip(args.iter()) {
        let idx = table
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| format!("no such column: {column}"))?;
        row[idx] = param_to_column(param);
    }
    if let Some(auto_column) = &table.autoincrement {
        if let Some(idx) = table.columns.iter().position(|c| c == auto_column) {
            if row[idx].is_none() {
                table.next_autoincrement += 1;
                row[idx] = Some(Column::Int(table.next_autoincrement));
            }
        }
    }

    let mut conflicts: Vec<String> = Vec::new();
    if let Some(pk) = &table.primary_key {
        let idx = table
            .columns
            .iter()
            .position(|c| c == pk)
            .expect("primary key column name is drawn from this table's own column list");
        if row[idx].is_some() && table.rows.iter().any(|existing| existing[idx] == row[idx]) {
            conflicts.push(pk.clone());
        }
    }
    for index in indexes {
        if !index_predicate_holds(&table.columns, &row, &index.predicate) {
            continue;
        }
        let column_indexes: Vec<usize> = index
            .columns
            .iter()
            .map(|c| {
                table
                    .columns
                    .iter()
                    .position(|tc| tc == c)
                    .expect("unique index column name is drawn from this table's own column list")
            })
            .collect();
        let collides = table.rows.iter().any(|existing| {
            index_predicate_holds(&table.columns, existing, &index.predicate)
                && column_indexes.iter().all(|&idx| existing[idx] == row[idx])
        });
        if collides {
            conflicts.push(index.columns.join(", "));
        }
    }
    if !conflicts.is_empty() {
        if stmt.ignore_dup {
            return Ok(0);
        }
        return Err(format!("UNIQUE constraint failed: {}.{}", stmt.table, conflicts.join("; ")));
    }

    table.rows.push(row);
    Ok(1)
}

fn exec_delete(table: &mut Table, stmt: &DeleteStmt, args: &[Param]) -> std::result::Result<u64, String> {
    let mut arg_iter = args.iter();
    let resolved = resolve_where(&stmt.where_, &mut arg_iter)?;
    let columns = table.columns.clone();
    let before = table.rows.len();
    table.rows.retain(|row| {
        let named: NamedRow = columns
            .iter()
            .cloned()
            .zip(row.iter().cloned())
            .map(|(name, value)| Cell { table: None, name, value })
            .collect();
        !row_matches(&named, &resolved)
    });
    Ok((before - table.rows.len()) as u64)
}

fn apply_ddl(state: &mut DataState, indexes: &mut Vec<UniqueIndexDef>, stmt: Stmt) -> std::result::Result<(), String> {
    match stmt {
        Stmt::CreateTable(def) => {
            if state.tables.contains_key(&def.name) {
                return Err(format!("table {} already exists", def.name));
            }
            state.tables.insert(
                def.name,
                Table {
                    columns: def.columns,
                    primary_key: def.primary_key,
                    autoincrement: def.autoincrement,
                    rows: Vec::new(),
                    next_autoincrement: 0,
                },
            );
            Ok(())
        }
        Stmt::CreateIndex(def) => {
            indexes.push(def);
            Ok(())
        }
        Stmt::CreateNonUniqueIndex => Ok(()),
        Stmt::Select(_) | Stmt::Insert(_) | Stmt::Delete(_) => Err("not a DDL statement".to_owned()),
    }
}

fn execute_query(state: &DataState, dialect: &dyn Dialect, sql: &str, args: &[Param]) -> Result<Vec<Row>> {
    let stmt = parse_statement(sql).map_err(|e| map_driver_error(dialect, SqlEngineError(e)))?;
    let Stmt::Select(select) = stmt else {
        return Err(DomainError::InvalidShape("query() called with a non-SELECT statement".to_owned()));
    };
    let mut arg_iter = args.iter();
    let rows = eval_select_rows(state, &select, &mut arg_iter).map_err(|e| map_driver_error(dialect, SqlEngineError(e)))?;
    Ok(rows.into_iter().map(named_row_to_row).collect())
}

fn execute_mutating(
    working: &mut DataState,
    indexes: &RwLock<Vec<UniqueIndexDef>>,
    dialect: &dyn Dialect,
    sql: &str,
    args: &[Param],
) -> Result<u64> {
    let stmt = parse_statement(sql).map_err(|e| map_driver_error(dialect, SqlEngineError(e)))?;
    match stmt {
        Stmt::Insert(insert) => {
            let guard = indexes.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            let applicable: Vec<UniqueIndexDef> = guard.iter().filter(|i| i.table == insert.table).cloned().collect();
            drop(guard);
            let table = working
                .tables
                .get_mut(&insert.table)
                .ok_or_else(|| map_driver_error(dialect, SqlEngineError(format!("no such table: {}", insert.table))))?;
            exec_insert(table, &applicable, &insert, args).map_err(|e| map_driver_error(dialect, SqlEngineError(e)))
        }
        Stmt::Delete(delete) => {
            let table = working
                .tables
                .get_mut(&delete.table)
                .ok_or_else(|| map_driver_error(dialect, SqlEngineError(format!("no such table: {}", delete.table))))?;
            exec_delete(table, &delete, args).map_err(|e| map_driver_error(dialect, SqlEngineError(e)))
        }
        ddl @ (Stmt::CreateTable(_) | Stmt::CreateIndex(_) | Stmt::CreateNonUniqueIndex) => {
            let mut guard = indexes.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            apply_ddl(working, &mut guard, ddl).map_err(|e| map_driver_error(dialect, SqlEngineError(e)))?;
            Ok(0)
        }
        Stmt::Select(_) => Err(DomainError::InvalidShape("execute() called with a SELECT statement".to_owned())),
    }
}

#[derive(Debug)]
struct SqlEngineError(String);

impl std::fmt::Display for SqlEngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SqlEngineError {}

// ---------------------------------------------------------------------------------------------
// SqlConnection / SqlTransaction / RowCursor
// ---------------------------------------------------------------------------------------------

/// An in-process `SqlConnection` backed by plain Rust data structures, for tests. Schema (the set
/// of tables and unique indexes) lives behind its own lock since DDL is issued once up front and
/// never rolled back the way row data is; row data lives behind a `Mutex` transactions snapshot
/// wholesale on `begin`.
pub struct MemoryConnection {
    dialect: Arc<dyn Dialect>,
    indexes: RwLock<Vec<UniqueIndexDef>>,
    state: Mutex<DataState>,
}

impl MemoryConnection {
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self {
            dialect,
            indexes: RwLock::new(Vec::new()),
            state: Mutex::new(DataState::default()),
        }
    }
}

impl SqlConnection for MemoryConnection {
    fn query(&self, sql: &str, args: &[Param], cancel: &CancellationToken) -> Result<Box<dyn RowCursor>> {
        cancel.check()?;
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let rows = execute_query(&state, self.dialect.as_ref(), sql, args)?;
        Ok(Box::new(MemoryRowCursor::new(rows)))
    }

    fn execute_ddl(&self, sql: &str) -> Result<()> {
        let stmt = parse_statement(sql).map_err(|e| map_driver_error(self.dialect.as_ref(), SqlEngineError(e)))?;
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut indexes = self.indexes.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        match stmt {
            ddl @ (Stmt::CreateTable(_) | Stmt::CreateIndex(_) | Stmt::CreateNonUniqueIndex) => {
                apply_ddl(&mut state, &mut indexes, ddl).map_err(|e| map_driver_error(self.dialect.as_ref(), SqlEngineError(e)))
            }
            _ => Err(DomainError::InvalidShape(
                "execute_ddl() called with a non-DDL statement".to_owned(),
            )),
        }
    }

    fn begin(&self, cancel: &CancellationToken) -> Result<Box<dyn SqlTransaction + '_>> {
        cancel.check()?;
        let working = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
        Ok(Box::new(MemoryTransaction {
            dialect: self.dialect.clone(),
            connection_state: &self.state,
            indexes: &self.indexes,
            working,
            snapshots: Vec::new(),
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    dialect: Arc<dyn Dialect>,
    connection_state: &'a Mutex<DataState>,
    indexes: &'a RwLock<Vec<UniqueIndexDef>>,
    working: DataState,
    /// Snapshots pushed by `savepoint`, popped by `release_savepoint`/`rollback_to_savepoint`.
    /// Unlike a real database, this engine doesn't track savepoints by name — `mutation.rs` only
    /// ever nests one level deep, so a stack is simpler than a name-keyed map and behaves
    /// identically for that usage.
    snapshots: Vec<DataState>,
}

impl SqlTransaction for MemoryTransaction<'_> {
    fn query(&mut self, sql: &str, args: &[Param], cancel: &CancellationToken) -> Result<Box<dyn RowCursor>> {
        cancel.check()?;
        let rows = execute_query(&self.working, self.dialect.as_ref(), sql, args)?;
        Ok(Box::new(MemoryRowCursor::new(rows)))
    }

    fn execute(&mut self, sql: &str, args: &[Param], cancel: &CancellationToken) -> Result<u64> {
        cancel.check()?;
        execute_mutating(&mut self.working, self.indexes, self.dialect.as_ref(), sql, args)
    }

    fn savepoint(&mut self, _name: &str) -> Result<()> {
        self.snapshots.push(self.working.clone());
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, _name: &str) -> Result<()> {
        self.working = self
            .snapshots
            .last()
            .cloned()
            .ok_or_else(|| DomainError::InvalidShape("rollback_to_savepoint() with no open savepoint".to_owned()))?;
        Ok(())
    }

    fn release_savepoint(&mut self, _name: &str) -> Result<()> {
        self.snapshots
            .pop()
            .ok_or_else(|| DomainError::InvalidShape("release_savepoint() with no open savepoint".to_owned()))?;
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        *self
            .connection_state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = self.working;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct MemoryRowCursor {
    rows: std::vec::IntoIter<Row>,
}

impl MemoryRowCursor {
    fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into_iter() }
    }
}

impl RowCursor for MemoryRowCursor {
    fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        cancel.check()?;
        Ok(self.rows.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::sqlite::SqliteDialect;
    use crate::value::NodeHash;

    fn connection() -> MemoryConnection {
        MemoryConnection::new(SqliteDialect::new())
    }

    fn init(conn: &MemoryConnection) {
        let dialect = SqliteDialect::new();
        let mut statements = dialect.nodes_table_ddl();
        statements.extend(dialect.quads_table_ddl());
        statements.extend(dialect.indexes(None));
        conn.init_schema(&statements, true).unwrap();
    }

    #[test]
    fn init_schema_then_select_1_succeeds() {
        let conn = connection();
        init(&conn);
        let cancel = CancellationToken::new();
        conn.query("SELECT 1", &[], &cancel).unwrap();
    }

    #[test]
    fn duplicate_table_reports_database_exists() {
        let conn = connection();
        init(&conn);
        let err = conn
            .execute_ddl("CREATE TABLE nodes (hash BLOB PRIMARY KEY)")
            .unwrap_err();
        assert!(matches!(err, DomainError::DatabaseExists));
    }

    #[test]
    fn insert_and_select_node_round_trips() {
        let conn = connection();
        init(&conn);
        let hash = NodeHash::of(&Value::Iri("http://example.com/a".to_owned()));
        let cancel = CancellationToken::new();
        let mut tx = conn.begin(&cancel).unwrap();
        tx.execute(
            "INSERT INTO nodes (hash, value_string, iri) VALUES (?, ?, ?) ON CONFLICT (hash) DO NOTHING",
            &[
                Param::Hash(hash),
                Param::Value(Value::String("http://example.com/a".to_owned())),
                Param::Value(Value::Bool(true)),
            ],
            &cancel,
        )
        .unwrap();
        tx.commit().unwrap();

        let mut cursor = conn
            .query(
                "SELECT value_string, iri FROM nodes WHERE hash = ?",
                &[Param::Hash(hash)],
                &cancel,
            )
            .unwrap();
        let row = cursor.next(&cancel).unwrap().unwrap();
        assert_eq!(row[0].as_ref().unwrap().as_text(), Some("http://example.com/a"));
        assert_eq!(row[1].as_ref().unwrap().as_bool(), Some(true));
    }

    #[test]
    fn duplicate_quad_without_ignore_dup_reports_quad_exists() {
        let conn = connection();
        init(&conn);
        let s = NodeHash::of(&Value::Iri("s".to_owned()));
        let p = NodeHash::of(&Value::Iri("p".to_owned()));
        let o = NodeHash::of(&Value::Iri("o".to_owned()));
        let cancel = CancellationToken::new();
        let insert_sql = "INSERT INTO quads (subject_hash, predicate_hash, object_hash, label_hash) VALUES (?, ?, ?, ?)";
        let args = [Param::Hash(s), Param::Hash(p), Param::Hash(o), Param::Null];

        let mut tx = conn.begin(&cancel).unwrap();
        tx.execute(insert_sql, &args, &cancel).unwrap();
        tx.commit().unwrap();

        let mut tx = conn.begin(&cancel).unwrap();
        let err = tx.execute(insert_sql, &args, &cancel).unwrap_err();
        assert!(matches!(err, DomainError::QuadExists));
    }

    #[test]
    fn savepoint_rollback_discards_writes() {
        let conn = connection();
        init(&conn);
        let hash = NodeHash::of(&Value::Int(1));
        let cancel = CancellationToken::new();
        let mut tx = conn.begin(&cancel).unwrap();
        tx.savepoint("sp").unwrap();
        tx.execute(
            "INSERT INTO nodes (hash, value_int) VALUES (?, ?) ON CONFLICT (hash) DO NOTHING",
            &[Param::Hash(hash), Param::Value(Value::Int(1))],
            &cancel,
        )
        .unwrap();
        tx.rollback_to_savepoint("sp").unwrap();
        tx.commit().unwrap();

        let mut cursor = conn
            .query("SELECT COUNT(*) FROM nodes", &[], &cancel)
            .unwrap();
        let row = cursor.next(&cancel).unwrap().unwrap();
        assert_eq!(row[0].as_ref().unwrap().as_int(), Some(0));
    }

    #[test]
    fn horizon_query_reports_max_and_zero_when_empty() {
        let conn = connection();
        init(&conn);
        let cancel = CancellationToken::new();
        let sql = "SELECT value_int FROM (SELECT MAX(horizon) AS value_int FROM quads) AS t";
        let mut cursor = conn.query(sql, &[], &cancel).unwrap();
        let row = cursor.next(&cancel).unwrap().unwrap();
        assert!(row[0].is_none());

        let s = NodeHash::of(&Value::Iri("s".to_owned()));
        let p = NodeHash::of(&Value::Iri("p".to_owned()));
        let o = NodeHash::of(&Value::Iri("o".to_owned()));
        let mut tx = conn.begin(&cancel).unwrap();
        tx.execute(
            "INSERT INTO quads (subject_hash, predicate_hash, object_hash, label_hash) VALUES (?, ?, ?, ?)",
            &[Param::Hash(s), Param::Hash(p), Param::Hash(o), Param::Null],
            &cancel,
        )
        .unwrap();
        tx.commit().unwrap();

        let mut cursor = conn.query(sql, &[], &cancel).unwrap();
        let row = cursor.next(&cancel).unwrap().unwrap();
        assert_eq!(row[0].as_ref().unwrap().as_int(), Some(1));
    }
}
