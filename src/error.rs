use std::error::Error;

/// The public error taxonomy of the quad store core.
///
/// Every fallible operation exposed by this crate returns `Result<T, DomainError>`. Raw
/// driver errors never cross the API boundary directly: a [`crate::dialect::Dialect`] maps
/// them through [`crate::dialect::Dialect::error_map`] first.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DomainError {
    /// `init` was called against an address that already holds the store's tables.
    #[error("database already exists")]
    DatabaseExists,
    /// An `Add` delta without `ignore_dup` collided with an existing quad.
    #[error("quad already exists")]
    QuadExists,
    /// A `Delete` delta without `ignore_missing` targeted a quad that is not present.
    #[error("quad does not exist")]
    QuadNotExist,
    /// A lexical form could not be parsed under its declared datatype.
    #[error("could not parse {lexical_form:?} as {datatype}")]
    ValueParse {
        /// The lexical form that failed to parse.
        lexical_form: String,
        /// The datatype IRI the lexical form was parsed against.
        datatype: String,
    },
    /// A shape tree mixed incompatible variants (unreachable in well-typed callers).
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    /// `open`/`init` referenced a `flavor` with no registered [`crate::dialect::Dialect`].
    #[error("unsupported SQL dialect: {0}")]
    DialectUnsupported(String),
    /// A transient/retryable condition was observed and retries were exhausted.
    #[error("transient error after retrying: {0}")]
    Retryable(#[source] Box<dyn Error + Send + Sync>),
    /// The retry wrapper's transaction body succeeded but its commit/release could not be
    /// confirmed; the mutation may or may not have taken effect.
    #[error("commit outcome is ambiguous: {0}")]
    AmbiguousCommit(#[source] Box<dyn Error + Send + Sync>),
    /// Connection loss, I/O, or encoding failures from the execution surface.
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
    /// A raw SQL execution error that did not map to any named domain case.
    #[error("sql error: {0}")]
    Sql(#[source] Box<dyn Error + Send + Sync>),
}

impl DomainError {
    /// Wraps an arbitrary error as a [`DomainError::Sql`] — the fallback used by a
    /// [`crate::dialect::Dialect::error_map`] implementation when no more specific case applies.
    pub fn sql(source: impl Error + Send + Sync + 'static) -> Self {
        Self::Sql(Box::new(source))
    }

    /// Wraps an arbitrary error as a [`DomainError::Retryable`].
    pub fn retryable(source: impl Error + Send + Sync + 'static) -> Self {
        Self::Retryable(Box::new(source))
    }

    /// Wraps an arbitrary error as a [`DomainError::AmbiguousCommit`].
    pub fn ambiguous_commit(source: impl Error + Send + Sync + 'static) -> Self {
        Self::AmbiguousCommit(Box::new(source))
    }
}

/// Connection loss, cancellation, and other failures below the domain-error layer.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum InfrastructureError {
    /// The operation's [`crate::CancellationToken`] fired before completion.
    #[error("operation was cancelled")]
    Cancelled,
    /// The underlying connection or pool reported a failure unrelated to the query itself.
    #[error("connection error: {0}")]
    Connection(#[source] Box<dyn Error + Send + Sync>),
    /// A row was structurally inconsistent (e.g. more than one value-class populated).
    #[error("corrupt row: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
