use crate::path::PathBuf;

/// Errors raised while navigating, mutating, or decoding tree values.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// A path walk through an [`Evolver`](crate::Evolver) or
    /// [`transform`](crate::Value) encountered a segment with no
    /// matching field, key, or item.
    #[error("path not found: {0}")]
    PathNotFound(PathBuf),

    /// A record's invariant rejected the state produced by a commit.
    /// The commit is aborted atomically; the evolver's caller observes
    /// the original tree, unchanged.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// An operation expected one [`Kind`](crate::value::Kind) of value
    /// but found another (e.g. `ADD` against a record).
    #[error("type mismatch: expected {expected}, found {found:?}")]
    TypeMismatch {
        /// What the operation required.
        expected: &'static str,
        /// The kind actually found.
        found: crate::value::Kind,
    },

    /// The canonical byte encoding was truncated mid-value.
    #[error("truncated canonical encoding")]
    Truncated,

    /// The canonical byte encoding was otherwise malformed.
    #[error("malformed canonical encoding: {0}")]
    Malformed(&'static str),
}
