//! In-memory query driver for tests and host smoke checks.

use std::{any::Any, collections::BTreeMap, sync::Mutex};

use anyhow::Result;

use crate::driver::{DriverHandle, FindOutcome, LookupDriver};

/// Non-persistent key→value table behind the query interface.
///
/// All data is lost when the driver is dropped. Do not use this driver in
/// production; it exists so hosts and tests can exercise the dispatch
/// path, including the quoting diagnostics, without external services.
#[derive(Debug, Default)]
pub struct TestDbDriver {
    table: Mutex<BTreeMap<String, String>>,
}

impl TestDbDriver {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one row.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self
            .table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.into(), value.into());
    }
}

impl LookupDriver for TestDbDriver {
    fn open(&self, _filename: Option<&str>) -> Result<DriverHandle> {
        Ok(Box::new(()))
    }

    fn find(
        &self,
        _handle: &mut dyn Any,
        _filename: Option<&str>,
        key: &str,
        _opts: Option<&str>,
    ) -> FindOutcome {
        let table = self
            .table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match table.get(key) {
            Some(value) => FindOutcome::hit(value.clone()),
            None => FindOutcome::miss(),
        }
    }

    fn close(&self, _handle: DriverHandle) {}

    fn supports_quoting(&self) -> bool {
        true
    }

    fn quote(&self, raw: &str) -> String {
        let mut quoted = String::with_capacity(raw.len());
        for c in raw.chars() {
            if matches!(c, '\\' | '\'' | '"') {
                quoted.push('\\');
            }
            quoted.push(c);
        }
        quoted
    }
}
