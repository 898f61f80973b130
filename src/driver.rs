//! The backend driver contract.
//!
//! Each storage kind (flat file, indexed file, SQL server, DNS, ...) is a
//! plugin implementing [`LookupDriver`]. The engine multiplexes drivers
//! behind one `find` API and never interprets their data; drivers never
//! see the caches.

use std::any::Any;

use anyhow::Result;

/// Opaque per-database state owned by a driver between `open` and `close`.
///
/// Drivers downcast this back to their own type.
pub type DriverHandle = Box<dyn Any>;

/// How a lookup result may be cached by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CacheDirective {
    /// Cache until the next tidyup.
    #[default]
    Forever,
    /// Cache for this many seconds.
    Seconds(u32),
    /// Do not cache this result, and drop everything previously cached for
    /// this database. Used after side-effecting queries.
    Disable,
}

/// Result of a single driver lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindOutcome {
    /// The key matched; `data` is the stored value.
    Found {
        data: String,
        caching: CacheDirective,
    },
    /// Definite miss.
    NotFound { caching: CacheDirective },
    /// Transient failure; the caller may retry later.
    Defer { message: String },
}

impl FindOutcome {
    /// A hit cached under the default directive.
    pub fn hit(data: impl Into<String>) -> Self {
        Self::Found {
            data: data.into(),
            caching: CacheDirective::default(),
        }
    }

    /// A miss cached under the default directive.
    #[must_use]
    pub fn miss() -> Self {
        Self::NotFound {
            caching: CacheDirective::default(),
        }
    }

    /// A transient failure.
    pub fn defer(message: impl Into<String>) -> Self {
        Self::Defer {
            message: message.into(),
        }
    }
}

/// File safety requirements verified after a file-backed database is
/// opened.
///
/// Empty owner or group lists allow any owner or group.
#[derive(Clone, Debug, Default)]
pub struct FileChecks {
    /// Mode bits that must not be set on the file.
    pub forbid_mode: u32,
    /// Acceptable owning users.
    pub owners: Vec<u32>,
    /// Acceptable owning groups.
    pub groups: Vec<u32>,
}

/// A pluggable lookup backend.
///
/// `open`, `find` and `close` are mandatory. `check` and `tidy` have
/// no-op defaults for drivers without file safety or global state.
/// Implementations returning `true` from [`supports_quoting`] signal that
/// tainted keys must be quoted with [`quote`] before being used in a
/// query.
///
/// [`supports_quoting`]: LookupDriver::supports_quoting
/// [`quote`]: LookupDriver::quote
pub trait LookupDriver: Send + Sync {
    /// Open the database.
    ///
    /// # Arguments
    ///
    /// * `filename` - the literal path for file-backed kinds, `None` for
    ///   pure-query kinds.
    fn open(&self, filename: Option<&str>) -> Result<DriverHandle>;

    /// Verify mode, owner and group of an already-open file handle.
    ///
    /// Must use `fstat` on the open descriptor; a path `stat` before the
    /// open would race with a rename.
    fn check(
        &self,
        _handle: &mut dyn Any,
        _filename: Option<&str>,
        _checks: &FileChecks,
    ) -> Result<()> {
        Ok(())
    }

    /// Look up one key (or run one query).
    fn find(
        &self,
        handle: &mut dyn Any,
        filename: Option<&str>,
        key: &str,
        opts: Option<&str>,
    ) -> FindOutcome;

    /// Close the database. The engine never closes a handle twice.
    fn close(&self, handle: DriverHandle);

    /// Driver-global cleanup, called once per engine tidyup.
    fn tidy(&self) {}

    /// Whether queries against this driver need quoting of untrusted
    /// input.
    fn supports_quoting(&self) -> bool {
        false
    }

    /// Quote a raw string for safe embedding in a query.
    fn quote(&self, raw: &str) -> String {
        raw.to_string()
    }
}
