use thiserror::Error;

/// Canonical smq error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SmqError::Syntax`]: the statement fails the SQL grammar
/// - [`SmqError::Analysis`]: name resolution or classification failures found
///   after a successful parse (prohibited database, no database selected,
///   table missing from the metadata catalog)
/// - [`SmqError::Unsupported`]: syntactically valid constructs the rewriter
///   intentionally does not transform
/// - [`SmqError::InvalidConfig`]: configuration/catalog contract violations
/// - [`SmqError::Internal`]: broken invariants; these indicate bugs, are
///   returned to the caller, and never abort the process
/// - [`SmqError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum SmqError {
    /// SQL text rejected by the parser.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Name resolution or table classification failure.
    ///
    /// The message is the user-facing text surfaced on the query session,
    /// e.g. `Query references prohibited dbs: SECRET` or
    /// `No database selected.`.
    #[error("{0}")]
    Analysis(String),

    /// Valid request for a rewrite the planner does not implement.
    ///
    /// Examples:
    /// - set functions outside SUM/COUNT/AVG/MIN/MAX
    /// - DISTINCT inside an aggregate
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Invalid or inconsistent configuration state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard smq result alias.
pub type Result<T> = std::result::Result<T, SmqError>;
