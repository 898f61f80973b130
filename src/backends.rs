//! Shipped backend drivers.
//!
//! Each driver is behind a cargo feature; with the feature off the type
//! stays declared in the built-in registry but is reported as not
//! available.

#[cfg(feature = "lsearch")]
pub mod lsearch;
#[cfg(feature = "testdb")]
pub mod testdb;
