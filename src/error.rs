//! Error types and Result module.

#![allow(clippy::doc_markdown)]

use displaydoc::Display;
use thiserror::Error;

/// Result type returned by the dispatch engine and the registry.
pub type SearchResult<T> = Result<T, SearchErrorKind>;

/// [`SearchErrorKind`] describes the errors that can be returned by the
/// lookup dispatch and caching engine
#[derive(Error, Debug, Display)]
#[non_exhaustive]
pub enum SearchErrorKind {
    /// unknown lookup type `{0}`
    UnknownLookupType(String),
    /// lookup type `{0}` is not available (not in the binary - check build configuration)
    LookupTypeNotAvailable(String),
    /// format error in lookup type `{0}`
    LookupTypeFormat(String),
    /// "partial" is not permitted for lookup type `{0}`
    PartialNotPermitted(String),
    /// defaults using "*" or "*@" are not permitted for lookup type `{0}`
    StarNotPermitted(String),
    /// tainted filename for search: `{0}`
    TaintedFilename(String),
    /// backend index `{0}` is out of range for this registry
    NoSuchBackend(usize),
    /// search handle is stale (issued before the last tidyup)
    StaleHandle,
    /// database is closed; reopen before searching
    DatabaseClosed,
    /// {0:?}
    Driver(anyhow::Error),
}
