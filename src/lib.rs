//! A SQL-backed quad store query core.
//!
//! A [`store::Store`] turns a tree of [`shape::Shape`] combinators into a SQL query against a
//! `nodes`/`quads` schema, via a rule-based optimizer (`optimizer`) that lowers the tree into a
//! single [`select::Select`], a renderer (`builder`) that turns that into dialect-specific SQL
//! text, and a streaming cursor (`iterator`) that decodes the result rows back into node/quad
//! hashes. Mutations go through a separate batched delta engine (`mutation`) with savepoint-based
//! retry. Everything above the database boundary talks to an abstract execution surface
//! (`backend::SqlConnection`); `memory` is an in-process implementation of that surface used by
//! this crate's own tests, and `dialect::sqlite` is a reference dialect descriptor pairing with
//! any such connection.

pub mod backend;
pub mod builder;
pub mod dialect;
pub mod error;
pub mod iterator;
pub mod memory;
pub mod mutation;
pub mod optimizer;
pub mod select;
pub mod shape;
pub mod store;
pub mod value;

pub use backend::{CancellationToken, Column, Row, RowCursor, SqlConnection, SqlTransaction};
pub use error::{DomainError, InfrastructureError, Result};
pub use iterator::{Binding, Iterator, PrimaryResult};
pub use mutation::{Delta, DeltaAction, IgnoreOpts, Quad};
pub use shape::{LookupKind, QuadFilter, Shape, ValueFilter};
pub use store::{Store, StoreOptions};
pub use value::{Direction, NodeHash, QuadHashes, Value};
