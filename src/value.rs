//! The typed value model and its content hashing.
//!
//! A [`Value`] is the polymorphic node payload stored in the `nodes` table. Every value has a
//! deterministic canonical string form (see [`Value::canonical_string`]); a [`NodeHash`] is the
//! SHA-1 of that string and is the only identity the SQL layer ever keys on.

use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};

use sha1::{Digest, Sha1};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{DomainError, Result};

/// Canonical datatype IRIs used when re-serializing native literals.
pub mod datatype {
    pub const INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
    pub const DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
    pub const BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
    pub const DATE_TIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
}

/// A 20-byte SHA-1 content hash of a [`Value`]'s canonical string form.
///
/// The all-zero hash is reserved to mean "nil" — used for the `label` direction of an
/// unlabelled quad.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHash([u8; 20]);

impl NodeHash {
    /// The reserved nil hash (an unlabelled quad's `label_hash`).
    pub const NIL: Self = Self([0; 20]);

    /// Hashes a value's canonical string form.
    pub fn of(value: &Value) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(value.canonical_string().as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The four quad directions a [`NodeHash`] can be addressed by, plus `Any` used to mean "the
/// result column of a node-producing shape".
///
/// Declaration order doubles as the iteration order the optimizer and builder rely on for
/// deterministic SQL (see `QuadsAction` in `shape.rs`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Any,
    Subject,
    Predicate,
    Object,
    Label,
}

impl Direction {
    /// The `quads` table column name for this direction; panics on `Any`, which has no column.
    pub fn column(self) -> &'static str {
        match self {
            Self::Any => unreachable!("Direction::Any has no backing column"),
            Self::Subject => "subject_hash",
            Self::Predicate => "predicate_hash",
            Self::Object => "object_hash",
            Self::Label => "label_hash",
        }
    }

    /// The `__`-prefixed tag this direction's quad column is aliased to when a `Quads` shape
    /// produces the four directions as a single row.
    pub fn internal_tag(self) -> &'static str {
        match self {
            Self::Any => "__node",
            Self::Subject => "__subject",
            Self::Predicate => "__predicate",
            Self::Object => "__object",
            Self::Label => "__label",
        }
    }
}

/// A 4-tuple of [`NodeHash`] addressed by [`Direction`], the canonical result of quad-shaped
/// queries. `label` is `NodeHash::NIL` for an unlabelled quad.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QuadHashes {
    pub subject: NodeHash,
    pub predicate: NodeHash,
    pub object: NodeHash,
    pub label: NodeHash,
}

impl QuadHashes {
    pub fn get(&self, direction: Direction) -> NodeHash {
        match direction {
            Direction::Any => panic!("QuadHashes has no Any component"),
            Direction::Subject => self.subject,
            Direction::Predicate => self.predicate,
            Direction::Object => self.object,
            Direction::Label => self.label,
        }
    }
}

/// The polymorphic RDF value stored per `nodes` row.
///
/// Every variant has a deterministic [`Value::canonical_string`] used as hash input; two values
/// are hash-equal iff their canonical strings coincide. `Time` values are canonicalized to UTC
/// RFC 3339 before hashing, so two `Time` values denoting the same instant but constructed with
/// different offsets hash identically.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Iri(String),
    BNode(String),
    String(String),
    LangString { value: String, lang: String },
    TypedString { value: String, datatype: String },
    Int(i64),
    Float(f64),
    Bool(bool),
    Time(OffsetDateTime),
}

impl Value {
    /// The deterministic string used as SHA-1 input for this value. Distinct variants never
    /// collide because each prefixes its payload with a tag byte absent from the payload's own
    /// alphabet (canonical forms below never contain `\u{0}`).
    pub fn canonical_string(&self) -> String {
        match self {
            Self::Iri(v) => format!("I\0{v}"),
            Self::BNode(v) => format!("B\0{v}"),
            Self::String(v) => format!("S\0{v}"),
            Self::LangString { value, lang } => format!("L\0{lang}\0{value}"),
            Self::TypedString { value, datatype } => format!("T\0{datatype}\0{value}"),
            Self::Int(v) => format!("N\0{v}"),
            Self::Float(v) => format!("F\0{v}"),
            Self::Bool(v) => format!("O\0{v}"),
            Self::Time(v) => {
                let utc = v.to_offset(time::UtcOffset::UTC);
                let formatted = utc
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| utc.unix_timestamp().to_string());
                format!("D\0{formatted}")
            }
        }
    }

    /// The canonical datatype IRI re-serialization should use for a native literal; `None` for
    /// the string-shaped variants, which carry their own (possibly absent) datatype/language.
    pub fn canonical_datatype(&self) -> Option<&'static str> {
        match self {
            Self::Int(_) => Some(datatype::INTEGER),
            Self::Float(_) => Some(datatype::DOUBLE),
            Self::Bool(_) => Some(datatype::BOOLEAN),
            Self::Time(_) => Some(datatype::DATE_TIME),
            _ => None,
        }
    }

    pub fn is_iri(&self) -> bool {
        matches!(self, Self::Iri(_))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(v: OffsetDateTime) -> Self {
        Self::Time(v)
    }
}

/// A single entry in the [`ValueParserRegistry`]: given a lexical form, attempt to coerce it
/// into the native `Value` variant this datatype maps to.
pub type DatatypeParser = fn(&str) -> Result<Value>;

/// Process-global table of datatype IRI -> lexical form parser.
///
/// Mirrors the dialect registry in `dialect.rs`: a builder populates it once at process start
/// and it is read-only thereafter. Mutating it after the first store is opened is a logic error,
/// not a data race — registration is not on any hot path.
pub struct ValueParserRegistry {
    parsers: RwLock<HashMap<String, DatatypeParser>>,
}

impl ValueParserRegistry {
    fn new() -> Self {
        let mut parsers: HashMap<String, DatatypeParser> = HashMap::new();
        parsers.insert(datatype::INTEGER.to_owned(), parse_integer);
        parsers.insert(datatype::DOUBLE.to_owned(), parse_double);
        parsers.insert(datatype::BOOLEAN.to_owned(), parse_boolean);
        parsers.insert(datatype::DATE_TIME.to_owned(), parse_date_time);
        Self {
            parsers: RwLock::new(parsers),
        }
    }

    pub fn global() -> &'static Self {
        static REGISTRY: OnceLock<ValueParserRegistry> = OnceLock::new();
        REGISTRY.get_or_init(Self::new)
    }

    /// Registers (or replaces) the parser for a datatype IRI.
    pub fn register(&self, datatype_iri: impl Into<String>, parser: DatatypeParser) {
        self.parsers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(datatype_iri.into(), parser);
    }

    /// Coerces `lexical_form` under `datatype_iri` into a native `Value` if the datatype is
    /// registered; otherwise returns a plain `TypedString` carrying the lexical form unchanged.
    pub fn parse(&self, lexical_form: &str, datatype_iri: &str) -> Result<Value> {
        let parsers = self
            .parsers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match parsers.get(datatype_iri) {
            Some(parser) => parser(lexical_form),
            None => Ok(Value::TypedString {
                value: lexical_form.to_owned(),
                datatype: datatype_iri.to_owned(),
            }),
        }
    }
}

/// Convenience wrapper around [`ValueParserRegistry::global`]'s [`ValueParserRegistry::parse`].
pub fn parse_typed(lexical_form: &str, datatype_iri: &str) -> Result<Value> {
    ValueParserRegistry::global().parse(lexical_form, datatype_iri)
}

fn parse_integer(lexical_form: &str) -> Result<Value> {
    lexical_form
        .trim()
        .parse::<i64>()
        .map(Value::Int)
        .map_err(|_| DomainError::ValueParse {
            lexical_form: lexical_form.to_owned(),
            datatype: datatype::INTEGER.to_owned(),
        })
}

fn parse_double(lexical_form: &str) -> Result<Value> {
    lexical_form
        .trim()
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|_| DomainError::ValueParse {
            lexical_form: lexical_form.to_owned(),
            datatype: datatype::DOUBLE.to_owned(),
        })
}

fn parse_boolean(lexical_form: &str) -> Result<Value> {
    match lexical_form.trim() {
        "true" | "1" => Ok(Value::Bool(true)),
        "false" | "0" => Ok(Value::Bool(false)),
        _ => Err(DomainError::ValueParse {
            lexical_form: lexical_form.to_owned(),
            datatype: datatype::BOOLEAN.to_owned(),
        }),
    }
}

fn parse_date_time(lexical_form: &str) -> Result<Value> {
    OffsetDateTime::parse(lexical_form.trim(), &Rfc3339)
        .map(Value::Time)
        .map_err(|_| DomainError::ValueParse {
            lexical_form: lexical_form.to_owned(),
            datatype: datatype::DATE_TIME.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn hash_is_stable_for_known_value() {
        let hash = NodeHash::of(&Value::Iri("http://example.com/a".to_owned()));
        assert_eq!(
            format!("{hash:?}"),
            hex::encode_canonical(&Value::Iri("http://example.com/a".to_owned()))
        );
    }

    #[test]
    fn time_equal_instants_hash_equal() {
        let a = Value::Time(datetime!(2024-01-01 00:00:00 UTC));
        let b = Value::Time(datetime!(2024-01-01 02:00:00 +2));
        assert_eq!(NodeHash::of(&a), NodeHash::of(&b));
    }

    #[test]
    fn distinct_variants_do_not_collide() {
        let iri = Value::Iri("x".to_owned());
        let bnode = Value::BNode("x".to_owned());
        let string = Value::String("x".to_owned());
        assert_ne!(NodeHash::of(&iri), NodeHash::of(&bnode));
        assert_ne!(NodeHash::of(&bnode), NodeHash::of(&string));
    }

    #[test]
    fn nil_hash_is_all_zero() {
        assert!(NodeHash::NIL.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn parse_typed_round_trips_integer() {
        let value = parse_typed("42", datatype::INTEGER).unwrap();
        assert_eq!(value, Value::Int(42));
    }

    #[test]
    fn parse_typed_falls_back_to_typed_string_for_unknown_datatype() {
        let value = parse_typed("abc", "http://example.com/custom").unwrap();
        assert_eq!(
            value,
            Value::TypedString {
                value: "abc".to_owned(),
                datatype: "http://example.com/custom".to_owned(),
            }
        );
    }

    #[test]
    fn parse_typed_rejects_malformed_lexical_form() {
        assert!(parse_typed("not-a-number", datatype::INTEGER).is_err());
    }

    mod hex {
        use super::Value;
        use sha1::{Digest, Sha1};

        pub fn encode_canonical(value: &Value) -> String {
            let mut hasher = Sha1::new();
            hasher.update(value.canonical_string().as_bytes());
            let digest = hasher.finalize();
            digest.iter().map(|b| format!("{b:02x}")).collect()
        }
    }
}
