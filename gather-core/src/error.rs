//! Query error types.
//!
//! A query distinguishes two flavors of failure. A [`Fault::Error`] is a
//! recoverable domain failure produced by a data source or an embedded
//! effect; it short-circuits sequential composition and can be transformed
//! with [`Query::map_error`](crate::query::Query::map_error). A
//! [`Fault::Defect`] is an unrecoverable programming error, most commonly a
//! data source violating its contract by not resolving a request it was
//! handed. Defects deliberately pass through `map_error` untouched so that
//! contract violations surface at the top of a run rather than being
//! swallowed by error-channel plumbing.
use thiserror::Error;

/// An unrecoverable defect observed while running a query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Defect {
    /// A data source completed its batch without resolving one of the
    /// requests in it. The offending source and request are named so the
    /// broken contract can be tracked down.
    #[error("data source `{data_source}` did not complete request {request}")]
    MissingResult {
        /// Name of the data source that dropped the request.
        data_source: String,
        /// Debug rendering of the dropped request.
        request: String,
    },
    /// A required value was absent where the query expected one to exist.
    #[error("expected a value, but none was present")]
    MissingValue,
}

/// The failure channel of a query: either a recoverable domain error or an
/// unrecoverable [`Defect`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault<E> {
    /// A recoverable failure surfaced by a data source or embedded effect.
    #[error("query failed: {0:?}")]
    Error(E),
    /// An unrecoverable defect. Never caught by error-channel combinators.
    #[error(transparent)]
    Defect(#[from] Defect),
}

impl<E> Fault<E> {
    /// Transform the domain error, leaving defects untouched.
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Fault<F> {
        match self {
            Self::Error(err) => Fault::Error(f(err)),
            Self::Defect(defect) => Fault::Defect(defect),
        }
    }

    /// Extract the domain error, if this fault carries one.
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Error(err) => Some(err),
            Self::Defect(_) => None,
        }
    }

    /// Extract the defect, if this fault carries one.
    pub fn into_defect(self) -> Option<Defect> {
        match self {
            Self::Error(_) => None,
            Self::Defect(defect) => Some(defect),
        }
    }

    /// Whether this fault is an unrecoverable defect.
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::Defect(_))
    }
}
