//! End-to-end tests against the in-memory reference SQL surface, exercising the full
//! `Store`/`Shape`/optimizer/builder/iterator/mutation stack the way a real dialect would see it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quadstore::backend::{CancellationToken, RowCursor, SqlConnection, SqlTransaction};
use quadstore::dialect::sqlite::SqliteDialect;
use quadstore::memory::MemoryConnection;
use quadstore::select::{Field, FromItem, Param, Select};
use quadstore::{
    DeltaAction, Delta, Direction, DomainError, IgnoreOpts, Iterator, PrimaryResult, Quad,
    QuadFilter, Shape, Store, StoreOptions, Value, ValueFilter,
};

/// An `SqlConnection` wrapping another one, recording whether a transaction it opened was ever
/// rolled back — proves `apply_deltas` calls `tx.rollback()` on the error path rather than
/// relying on drop-without-rollback being harmless (`MemoryTransaction` happens to be, since only
/// `commit()` writes back to shared state, but the trait makes no such promise).
struct SpyConnection {
    inner: Arc<MemoryConnection>,
    rollback_called: Arc<AtomicBool>,
}

impl SqlConnection for SpyConnection {
    fn query(&self, sql: &str, args: &[Param], cancel: &CancellationToken) -> quadstore::Result<Box<dyn RowCursor>> {
        self.inner.query(sql, args, cancel)
    }

    fn execute_ddl(&self, sql: &str) -> quadstore::Result<()> {
        self.inner.execute_ddl(sql)
    }

    fn begin(&self, cancel: &CancellationToken) -> quadstore::Result<Box<dyn SqlTransaction + '_>> {
        let inner = self.inner.begin(cancel)?;
        Ok(Box::new(SpyTransaction {
            inner,
            rollback_called: self.rollback_called.clone(),
        }))
    }

    fn close(&self) -> quadstore::Result<()> {
        self.inner.close()
    }
}

struct SpyTransaction<'a> {
    inner: Box<dyn SqlTransaction + 'a>,
    rollback_called: Arc<AtomicBool>,
}

impl SqlTransaction for SpyTransaction<'_> {
    fn query(&mut self, sql: &str, args: &[Param], cancel: &CancellationToken) -> quadstore::Result<Box<dyn RowCursor>> {
        self.inner.query(sql, args, cancel)
    }

    fn execute(&mut self, sql: &str, args: &[Param], cancel: &CancellationToken) -> quadstore::Result<u64> {
        self.inner.execute(sql, args, cancel)
    }

    fn savepoint(&mut self, name: &str) -> quadstore::Result<()> {
        self.inner.savepoint(name)
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> quadstore::Result<()> {
        self.inner.rollback_to_savepoint(name)
    }

    fn release_savepoint(&mut self, name: &str) -> quadstore::Result<()> {
        self.inner.release_savepoint(name)
    }

    fn commit(self: Box<Self>) -> quadstore::Result<()> {
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> quadstore::Result<()> {
        self.rollback_called.store(true, Ordering::SeqCst);
        self.inner.rollback()
    }
}

fn open_store() -> Store {
    open_store_with_connection().0
}

fn open_store_with_connection() -> (Store, Arc<MemoryConnection>) {
    let dialect = SqliteDialect::new();
    let conn = Arc::new(MemoryConnection::new(dialect.clone()));
    let store = Store::init(conn.clone(), dialect, StoreOptions::new("sqlite")).unwrap();
    (store, conn)
}

fn quad(s: &str, p: &str, o: &str) -> Quad {
    Quad {
        subject: Value::Iri(s.to_owned()),
        predicate: Value::Iri(p.to_owned()),
        object: Value::Iri(o.to_owned()),
        label: None,
    }
}

fn add(q: Quad) -> Delta {
    Delta {
        action: DeltaAction::Add,
        quad: q,
        id: None,
        ts: None,
    }
}

fn delete(q: Quad) -> Delta {
    Delta {
        action: DeltaAction::Delete,
        quad: q,
        id: None,
        ts: None,
    }
}

fn drain_nodes(store: &Store, shape: Shape) -> Vec<quadstore::NodeHash> {
    let mut it = store.iterator(shape).unwrap();
    let mut out = Vec::new();
    while let Some(binding) = it.next().unwrap() {
        match binding.result {
            PrimaryResult::Node(hash) => out.push(hash),
            PrimaryResult::Quad(_) => panic!("expected node-shaped result"),
        }
    }
    out
}

#[test]
fn init_twice_reports_database_exists() {
    let dialect = SqliteDialect::new();
    let conn = Arc::new(MemoryConnection::new(dialect.clone()));
    Store::init(conn.clone(), dialect.clone(), StoreOptions::new("sqlite")).unwrap();
    let err = Store::init(conn, dialect, StoreOptions::new("sqlite")).unwrap_err();
    assert!(matches!(err, DomainError::DatabaseExists));
}

#[test]
fn open_against_initialized_store_succeeds() {
    let dialect = SqliteDialect::new();
    let conn = Arc::new(MemoryConnection::new(dialect.clone()));
    Store::init(conn.clone(), dialect.clone(), StoreOptions::new("sqlite")).unwrap();
    Store::open(conn, dialect, StoreOptions::new("sqlite")).unwrap();
}

#[test]
fn name_of_round_trips_every_value_class() {
    let store = open_store();
    let values = vec![
        Value::Iri("http://example.com/a".to_owned()),
        Value::BNode("b0".to_owned()),
        Value::String("plain".to_owned()),
        Value::LangString {
            value: "bonjour".to_owned(),
            lang: "fr".to_owned(),
        },
        Value::TypedString {
            value: "2020".to_owned(),
            datatype: "http://example.com/year".to_owned(),
        },
        Value::Int(42),
        Value::Float(1.5),
        Value::Bool(true),
    ];
    for value in values {
        let q = Quad {
            subject: value.clone(),
            predicate: Value::Iri("http://example.com/p".to_owned()),
            object: Value::Iri("http://example.com/o".to_owned()),
            label: None,
        };
        store
            .apply_deltas(&[add(q)], IgnoreOpts::default())
            .unwrap();
        let hash = store.value_of(&value);
        assert_eq!(store.name_of(hash).unwrap(), value);
    }
}

#[test]
fn name_of_nil_hash_is_rejected() {
    let store = open_store();
    let err = store.name_of(quadstore::NodeHash::NIL).unwrap_err();
    assert!(matches!(err, DomainError::InvalidShape(_)));
}

#[test]
fn all_nodes_returns_every_distinct_hash() {
    let store = open_store();
    store
        .apply_deltas(
            &[add(quad("s", "p", "o1")), add(quad("s", "p", "o2"))],
            IgnoreOpts::default(),
        )
        .unwrap();
    // four distinct terms: s, p, o1, o2
    let nodes = drain_nodes(&store, Shape::AllNodes);
    assert_eq!(nodes.len(), 4);
}

#[test]
fn quads_fixed_filter_matches_subject_and_predicate() {
    let store = open_store();
    store
        .apply_deltas(
            &[add(quad("s", "p", "o1")), add(quad("s", "p", "o2")), add(quad("s", "other", "o3"))],
            IgnoreOpts::default(),
        )
        .unwrap();
    let s_hash = store.value_of(&Value::Iri("s".to_owned()));
    let p_hash = store.value_of(&Value::Iri("p".to_owned()));
    let shape = Shape::quads(vec![
        QuadFilter::Fixed {
            direction: Direction::Subject,
            values: vec![Value::Iri("s".to_owned())],
        },
        QuadFilter::Fixed {
            direction: Direction::Predicate,
            values: vec![Value::Iri("p".to_owned())],
        },
    ]);
    let mut it = store.iterator(shape).unwrap();
    let mut objects = Vec::new();
    while let Some(binding) = it.next().unwrap() {
        match binding.result {
            PrimaryResult::Quad(q) => {
                assert_eq!(q.subject, s_hash);
                assert_eq!(q.predicate, p_hash);
                objects.push(q.object);
            }
            PrimaryResult::Node(_) => panic!("expected quad-shaped result"),
        }
    }
    assert_eq!(objects.len(), 2);
}

#[test]
fn nodes_from_projects_a_single_direction() {
    let store = open_store();
    store
        .apply_deltas(
            &[add(quad("s", "p", "o1")), add(quad("s", "p", "o2"))],
            IgnoreOpts::default(),
        )
        .unwrap();
    let shape = Shape::nodes_from(
        Direction::Object,
        Shape::quads(vec![QuadFilter::Fixed {
            direction: Direction::Subject,
            values: vec![Value::Iri("s".to_owned())],
        }]),
    );
    let nodes = drain_nodes(&store, shape);
    assert_eq!(nodes.len(), 2);
}

#[test]
fn quads_action_result_with_save_column() {
    let store = open_store();
    store
        .apply_deltas(&[add(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    let mut save = BTreeMap::new();
    save.insert(Direction::Object, vec!["ob".to_owned()]);
    let mut filter = BTreeMap::new();
    filter.insert(Direction::Predicate, Value::Iri("p".to_owned()));
    let shape = Shape::QuadsAction {
        result: Direction::Subject,
        save,
        filter,
    };
    let mut it = store.iterator(shape).unwrap();
    let binding = it.next().unwrap().expect("one row");
    let s_hash = store.value_of(&Value::Iri("s".to_owned()));
    let o_hash = store.value_of(&Value::Iri("o".to_owned()));
    match binding.result {
        PrimaryResult::Node(hash) => assert_eq!(hash, s_hash),
        PrimaryResult::Quad(_) => panic!("expected node-shaped result"),
    }
    assert_eq!(binding.tags.get("ob"), Some(&o_hash));
    assert!(it.next().unwrap().is_none());
}

#[test]
fn lookup_by_value_and_by_hash_agree() {
    let store = open_store();
    store
        .apply_deltas(&[add(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    let target = Value::Iri("s".to_owned());
    let by_value = drain_nodes(&store, Shape::lookup_by_value(vec![target.clone()]));
    let by_hash = drain_nodes(&store, Shape::lookup_by_hash(vec![target.clone()]));
    assert_eq!(by_value, by_hash);
    assert_eq!(by_value, vec![store.value_of(&target)]);
}

#[test]
fn lookup_of_absent_value_is_empty() {
    let store = open_store();
    let nodes = drain_nodes(
        &store,
        Shape::lookup_by_value(vec![Value::Iri("nowhere".to_owned())]),
    );
    assert!(nodes.is_empty());
}

#[test]
fn filter_comparison_restricts_to_plain_strings_above_bound() {
    let store = open_store();
    store
        .apply_deltas(
            &[
                add(quad("a-subject", "p", "o")),
                add(quad("z-subject", "p", "o")),
            ],
            IgnoreOpts::default(),
        )
        .unwrap();
    // plain String nodes rank below IRIs in this dataset's term set; restrict with a Comparison
    // filter over the interned string values themselves.
    store
        .apply_deltas(
            &[add(Quad {
                subject: Value::String("alpha".to_owned()),
                predicate: Value::Iri("p".to_owned()),
                object: Value::Iri("o".to_owned()),
                label: None,
            })],
            IgnoreOpts::default(),
        )
        .unwrap();
    store
        .apply_deltas(
            &[add(Quad {
                subject: Value::String("zulu".to_owned()),
                predicate: Value::Iri("p".to_owned()),
                object: Value::Iri("o".to_owned()),
                label: None,
            })],
            IgnoreOpts::default(),
        )
        .unwrap();
    let shape = Shape::AllNodes.filter(vec![ValueFilter::Comparison {
        op: quadstore::select::CmpOp::Gt,
        value: Value::String("m".to_owned()),
    }]);
    let nodes = drain_nodes(&store, shape);
    assert!(nodes.contains(&store.value_of(&Value::String("zulu".to_owned()))));
    assert!(!nodes.contains(&store.value_of(&Value::String("alpha".to_owned()))));
}

#[test]
fn page_skip_and_limit_compose_like_a_single_page() {
    let store = open_store();
    for i in 0..5 {
        store
            .apply_deltas(
                &[add(Quad {
                    subject: Value::Int(i),
                    predicate: Value::Iri("p".to_owned()),
                    object: Value::Iri("o".to_owned()),
                    label: None,
                })],
                IgnoreOpts::default(),
            )
            .unwrap();
    }
    let nested = Shape::Page {
        from: Box::new(Shape::Page {
            from: Box::new(Shape::AllNodes),
            skip: 1,
            limit: 3,
        }),
        skip: 1,
        limit: 2,
    };
    let composed = Shape::AllNodes.page(2, 2);
    assert_eq!(drain_nodes(&store, nested), drain_nodes(&store, composed));
}

#[test]
fn intersect_of_two_lookups_on_same_node_agrees() {
    let store = open_store();
    store
        .apply_deltas(&[add(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    let target = Value::Iri("s".to_owned());
    let shape = Shape::intersect(vec![
        Shape::lookup_by_value(vec![target.clone()]),
        Shape::AllNodes,
    ]);
    let nodes = drain_nodes(&store, shape);
    assert_eq!(nodes, vec![store.value_of(&target)]);
}

#[test]
fn idempotent_add_with_ignore_dup_leaves_state_unchanged() {
    let store = open_store();
    let batch = [add(quad("s", "p", "o"))];
    store
        .apply_deltas(&batch, IgnoreOpts { ignore_dup: true, ignore_missing: false })
        .unwrap();
    let after_first = store.size().unwrap();
    store
        .apply_deltas(&batch, IgnoreOpts { ignore_dup: true, ignore_missing: false })
        .unwrap();
    assert_eq!(store.size().unwrap(), after_first);
    let quads = drain_quads(&store);
    assert_eq!(quads.len(), 1);
}

fn drain_quads(store: &Store) -> Vec<quadstore::QuadHashes> {
    let mut it = store.all_quads().unwrap();
    let mut out = Vec::new();
    while let Some(binding) = it.next().unwrap() {
        match binding.result {
            PrimaryResult::Quad(q) => out.push(q),
            PrimaryResult::Node(_) => panic!("expected quad-shaped result"),
        }
    }
    out
}

#[test]
fn duplicate_add_without_ignore_dup_fails_batch_and_leaves_state_unchanged() {
    let store = open_store();
    store
        .apply_deltas(&[add(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    let before = store.size().unwrap();
    let horizon_before = store.horizon().unwrap();
    let err = store
        .apply_deltas(
            &[add(quad("s", "p", "o2")), add(quad("s", "p", "o"))],
            IgnoreOpts::default(),
        )
        .unwrap_err();
    assert!(matches!(err, DomainError::QuadExists));
    // the whole batch (including the first, non-conflicting add) must have rolled back
    assert_eq!(store.size().unwrap(), before);
    assert_eq!(store.horizon().unwrap(), horizon_before);
    assert_eq!(drain_quads(&store).len(), 1);
}

#[test]
fn failed_batch_rolls_back_the_transaction_explicitly() {
    let dialect = SqliteDialect::new();
    let inner = Arc::new(MemoryConnection::new(dialect.clone()));
    let rollback_called = Arc::new(AtomicBool::new(false));
    let conn: Arc<dyn SqlConnection> = Arc::new(SpyConnection {
        inner: inner.clone(),
        rollback_called: rollback_called.clone(),
    });
    let store = Store::init(conn, dialect, StoreOptions::new("sqlite")).unwrap();

    store
        .apply_deltas(&[add(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    assert!(!rollback_called.load(Ordering::SeqCst));

    let err = store
        .apply_deltas(
            &[add(quad("s", "p", "o2")), add(quad("s", "p", "o"))],
            IgnoreOpts::default(),
        )
        .unwrap_err();
    assert!(matches!(err, DomainError::QuadExists));
    assert!(rollback_called.load(Ordering::SeqCst));
}

#[test]
fn delete_missing_quad_without_ignore_missing_errors() {
    let store = open_store();
    let err = store
        .apply_deltas(&[delete(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap_err();
    assert!(matches!(err, DomainError::QuadNotExist));
}

#[test]
fn delete_missing_quad_with_ignore_missing_is_a_no_op() {
    let store = open_store();
    store
        .apply_deltas(
            &[delete(quad("s", "p", "o"))],
            IgnoreOpts { ignore_dup: false, ignore_missing: true },
        )
        .unwrap();
}

#[test]
fn add_then_delete_round_trips_to_empty_quads() {
    let store = open_store();
    store
        .apply_deltas(&[add(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    assert_eq!(drain_quads(&store).len(), 1);
    store
        .apply_deltas(&[delete(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    assert!(drain_quads(&store).is_empty());
}

#[test]
fn horizon_tracks_the_highest_assigned_row_and_is_zero_when_empty() {
    let store = open_store();
    assert_eq!(store.horizon().unwrap(), 0);
    store
        .apply_deltas(&[add(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    assert_eq!(store.horizon().unwrap(), 1);
    store
        .apply_deltas(&[add(quad("s2", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    assert_eq!(store.horizon().unwrap(), 2);
}

#[test]
fn contains_matches_an_inserted_quad_and_rejects_a_foreign_one() {
    let store = open_store();
    store
        .apply_deltas(&[add(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    let shape = Shape::quads(vec![QuadFilter::Fixed {
        direction: Direction::Subject,
        values: vec![Value::Iri("s".to_owned())],
    }]);
    let mut it = store.iterator(shape).unwrap();
    let present = PrimaryResult::Quad(quadstore::QuadHashes {
        subject: store.value_of(&Value::Iri("s".to_owned())),
        predicate: store.value_of(&Value::Iri("p".to_owned())),
        object: store.value_of(&Value::Iri("o".to_owned())),
        label: quadstore::NodeHash::NIL,
    });
    assert!(it.contains(&present).unwrap());

    let absent = PrimaryResult::Quad(quadstore::QuadHashes {
        subject: store.value_of(&Value::Iri("s".to_owned())),
        predicate: store.value_of(&Value::Iri("p".to_owned())),
        object: store.value_of(&Value::Iri("nowhere".to_owned())),
        label: quadstore::NodeHash::NIL,
    });
    assert!(!it.contains(&absent).unwrap());
}

#[test]
fn iterator_used_after_close_errors() {
    let store = open_store();
    store
        .apply_deltas(&[add(quad("s", "p", "o"))], IgnoreOpts::default())
        .unwrap();
    let mut it = store.iterator(Shape::AllNodes).unwrap();
    it.next().unwrap();
    it.close();
    assert!(it.is_closed());
    let err = it.next().unwrap_err();
    assert!(matches!(err, DomainError::InvalidShape(_)));
}

/// `ORDER BY __node` must sort by the hash value the `__node`-aliased column actually carries,
/// not by insertion order — inserts nodes in an order distinct from their hash byte order and
/// asserts the rendered query corrects it.
#[test]
fn order_by_node_sorts_by_hash_bytes_not_insertion_order() {
    let (store, conn) = open_store_with_connection();
    let values = [
        Value::Iri("charlie".to_owned()),
        Value::Iri("alpha".to_owned()),
        Value::Iri("bravo".to_owned()),
    ];
    for value in &values {
        store
            .apply_deltas(
                &[add(Quad {
                    subject: value.clone(),
                    predicate: Value::Iri("p".to_owned()),
                    object: Value::Iri("o".to_owned()),
                    label: None,
                })],
                IgnoreOpts::default(),
            )
            .unwrap();
    }
    // the predicate/object IRIs shared by every inserted quad are also `iri = true` nodes and
    // must appear in the expected set alongside the three varying subjects.
    let mut expected: Vec<quadstore::NodeHash> = values
        .iter()
        .chain([&Value::Iri("p".to_owned()), &Value::Iri("o".to_owned())])
        .map(|v| store.value_of(v))
        .collect();
    expected.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    let mut select = Select::new();
    select.from.push(FromItem::table("nodes", None));
    select.fields.push(Field::new("nodes", "hash", "__node"));
    select.where_.push(quadstore::select::WhereClause {
        table: "nodes".to_owned(),
        field: "iri".to_owned(),
        op: quadstore::select::WhereOp::IsTrue,
        operand: quadstore::select::Operand::None,
    });
    select.next_path = true;

    let mut it = Iterator::new(store.dialect().clone(), conn, select);
    let mut actual = Vec::new();
    while let Some(binding) = it.next().unwrap() {
        match binding.result {
            PrimaryResult::Node(hash) => actual.push(hash),
            PrimaryResult::Quad(_) => panic!("expected node-shaped result"),
        }
    }
    assert_eq!(actual, expected);
}

/// Exercises the `NextPath` replay mechanism directly against a hand-built two-tag `Select`,
/// since no shipped shape combinator currently drives the optimizer to set `next_path`.
#[test]
fn next_path_groups_rows_sharing_the_same_primary_key() {
    let dialect = SqliteDialect::new();
    let conn = Arc::new(MemoryConnection::new(dialect.clone()));
    let store = Store::init(conn.clone(), dialect.clone(), StoreOptions::new("sqlite")).unwrap();
    store
        .apply_deltas(
            &[add(quad("s", "p1", "o1")), add(quad("s", "p2", "o2"))],
            IgnoreOpts::default(),
        )
        .unwrap();

    let mut select = Select::new();
    select.from.push(FromItem::table("quads", Some("t_1".to_owned())));
    select.fields.push(Field::new("t_1", "subject_hash", "__node"));
    select
        .fields
        .push(Field::new("t_1", "object_hash", "tag"));
    select.next_path = true;

    let mut it = Iterator::new(dialect, conn, select);
    let first = it.next().unwrap().expect("first row");
    assert!(matches!(first.result, PrimaryResult::Node(_)));
    let mut grouped = vec![first];
    while let Some(binding) = it.next_path().unwrap() {
        grouped.push(binding);
    }
    assert_eq!(grouped.len(), 2);
    for binding in &grouped {
        match binding.result {
            PrimaryResult::Node(hash) => {
                assert_eq!(hash, store.value_of(&Value::Iri("s".to_owned())));
            }
            PrimaryResult::Quad(_) => panic!("expected node-shaped result"),
        }
    }
}
