//! The dispatch engine: open-database cache, per-handle result cache and
//! the partial/wildcard fallback.
//!
//! An open database is represented by a [`SearchHandle`] pointing at a
//! cache node. Nodes live until [`tidyup`]; file-backed databases are
//! additionally kept on an LRU chain so the least recently used one can
//! be closed when too many files are open. Each node caches the results
//! of previous lookups, keyed by the literal probe string.
//!
//! [`tidyup`]: SearchEngine::tidyup

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use derive_setters::Setters;
use itertools::Itertools;
use log::{debug, error, trace};
#[cfg(not(feature = "enforce-quote-protection"))]
use log::warn;
use serde_derive::{Deserialize, Serialize};

use crate::{
    driver::{CacheDirective, DriverHandle, FileChecks, FindOutcome},
    error::{SearchErrorKind, SearchResult},
    pool::{Mark, SearchPool, StrRef},
    registry::{BackendKind, ParsedType, PartialMatch, Registry, StarDefault},
    taint::SearchKey,
};

/// Options for a [`SearchEngine`].
#[derive(Clone, Debug, Serialize, Deserialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into, strip_option)]
pub struct SearchOptions {
    /// Bound on simultaneously open file-backed databases. Hard minimum 1.
    pub max_open_files: usize,

    /// Host context named in quoting diagnostics, e.g. the current ACL,
    /// authenticator, transport or router.
    pub context: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_open_files: 25,
            context: None,
        }
    }
}

/// Wildcard behavior for one [`find`] call, usually built from a parsed
/// full type.
///
/// [`find`]: SearchEngine::find
#[derive(Clone, Debug, Default)]
pub struct WildcardRules {
    /// Partial matching parameters; `None` disables component stripping.
    pub partial: Option<PartialMatch>,
    /// Star-default fallbacks.
    pub star: StarDefault,
}

impl WildcardRules {
    /// No wildcarding: the key is probed verbatim only.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

impl From<&ParsedType> for WildcardRules {
    fn from(parsed: &ParsedType) -> Self {
        Self {
            partial: parsed.partial.clone(),
            star: parsed.star,
        }
    }
}

/// Expansion variables pushed by wildcarded matches.
///
/// Successful wildcarded lookups push exactly two slots per match: the
/// *wild* part and the *fixed* part. A slot records a base string plus a
/// significant length; the base may be longer than the length.
#[derive(Debug, Default)]
pub struct Expansions {
    strings: Vec<SearchKey>,
    lengths: Vec<usize>,
}

impl Expansions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of filled slots.
    #[must_use]
    pub fn count(&self) -> usize {
        self.strings.len()
    }

    /// Base string and significant length of slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn slot(&self, index: usize) -> (&SearchKey, usize) {
        (&self.strings[index], self.lengths[index])
    }

    /// The significant text of slot `index`.
    #[must_use]
    pub fn value(&self, index: usize) -> &str {
        self.strings[index]
            .text()
            .get(..self.lengths[index])
            .unwrap_or("")
    }

    pub fn clear(&mut self) {
        self.strings.clear();
        self.lengths.clear();
    }

    fn push(&mut self, string: SearchKey, length: usize) {
        self.strings.push(string);
        self.lengths.push(length);
    }
}

/// Token identifying one opened database within one engine instance.
///
/// Handles stay valid (and stable) until the next [`tidyup`]; a handle
/// held across a tidyup is detected and refused.
///
/// [`tidyup`]: SearchEngine::tidyup
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchHandle {
    index: usize,
    generation: u32,
}

/// One cached open database.
struct CacheNode {
    /// Composite key this node is filed under.
    key: String,
    backend: usize,
    /// Driver state; `None` once the node has been force-closed by LRU
    /// eviction.
    handle: Option<DriverHandle>,
    item_cache: BTreeMap<String, CacheEntry>,
    /// LRU links, live only for open file-backed nodes.
    up: Option<usize>,
    down: Option<usize>,
}

/// One cached lookup result. `data: None` is a cached miss.
struct CacheEntry {
    data: Option<StrRef>,
    /// `None` means the entry never expires.
    expiry: Option<DateTime<Utc>>,
    /// The residual option string that produced this entry.
    opts: Option<String>,
}

/// The lookup dispatch and caching engine.
///
/// All state is per-engine; the host typically keeps one per process and
/// calls [`tidyup`] at natural boundaries (per message, per ACL).
///
/// [`tidyup`]: SearchEngine::tidyup
pub struct SearchEngine {
    registry: Arc<Registry>,
    options: SearchOptions,

    nodes: Vec<CacheNode>,
    by_key: BTreeMap<String, usize>,

    lru_top: Option<usize>,
    lru_bot: Option<usize>,
    open_filecount: usize,

    pool: SearchPool,
    reset_mark: Option<Mark>,

    last_error: String,
    deferred: bool,
    generation: u32,

    #[cfg(test)]
    now_override: Option<DateTime<Utc>>,
}

impl SearchEngine {
    /// Create an engine over the given registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>, options: SearchOptions) -> Self {
        let mut options = options;
        options.max_open_files = options.max_open_files.max(1);
        Self {
            registry,
            options,
            nodes: Vec::new(),
            by_key: BTreeMap::new(),
            lru_top: None,
            lru_bot: None,
            open_filecount: 0,
            pool: SearchPool::new(),
            reset_mark: None,
            last_error: String::new(),
            deferred: false,
            generation: 0,
            #[cfg(test)]
            now_override: None,
        }
    }

    /// Create an engine over the built-in registry with default options.
    #[must_use]
    pub fn with_builtin() -> Self {
        Self::new(Registry::builtin(), SearchOptions::default())
    }

    /// The registry this engine dispatches over.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Message describing the most recent failure; empty after success.
    #[must_use]
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Whether the most recent [`find`] ended in a transient failure
    /// rather than a definite miss. Read before the next engine call.
    ///
    /// [`find`]: SearchEngine::find
    #[must_use]
    pub fn deferred(&self) -> bool {
        self.deferred
    }

    /// Open a database, or return the cached handle if this (backend,
    /// filename) pair is already open.
    ///
    /// For file-backed kinds the file-descriptor budget is enforced here:
    /// when `max_open_files` databases are open, the least recently used
    /// one is closed first (its node and result cache survive).
    ///
    /// # Errors
    ///
    /// * [`SearchErrorKind::TaintedFilename`] - `filename` derives from
    ///   untrusted input.
    /// * [`SearchErrorKind::LookupTypeNotAvailable`] - no driver in this
    ///   binary.
    /// * [`SearchErrorKind::Driver`] - the driver's open or check failed.
    pub fn open(
        &mut self,
        filename: Option<&SearchKey>,
        backend: usize,
        checks: &FileChecks,
    ) -> SearchResult<SearchHandle> {
        self.last_error.clear();
        let registry = Arc::clone(&self.registry);

        if backend >= registry.len() {
            return self.fail(SearchErrorKind::NoSuchBackend(backend));
        }
        if let Some(f) = filename {
            if f.is_tainted() {
                error!("tainted filename for search: '{}'", f.text());
                return self.fail(SearchErrorKind::TaintedFilename(f.text().to_string()));
            }
        }

        if self.reset_mark.is_none() {
            self.reset_mark = Some(self.pool.mark());
        }

        let info = registry.get(backend);
        debug!(
            "search_open: {} \"{}\"",
            info.name,
            filename.map_or("NULL", SearchKey::text)
        );

        let key = composite_key(backend, filename.map(SearchKey::text));
        let existing = self.by_key.get(&key).copied();
        if let Some(index) = existing {
            if self.nodes[index].handle.is_some() {
                debug!("  cached open");
                return Ok(SearchHandle {
                    index,
                    generation: self.generation,
                });
            }
            debug!("  cached closed");
        }

        if info.kind == BackendKind::File && self.open_filecount >= self.options.max_open_files {
            self.evict_lru(&registry);
        }

        let Some(driver) = info.driver.clone() else {
            return self.fail(SearchErrorKind::LookupTypeNotAvailable(info.name.clone()));
        };

        let mut handle = match driver.open(filename.map(SearchKey::text)) {
            Ok(handle) => handle,
            Err(err) => return self.fail(SearchErrorKind::Driver(err)),
        };
        if let Err(err) = driver.check(handle.as_mut(), filename.map(SearchKey::text), checks) {
            driver.close(handle);
            return self.fail(SearchErrorKind::Driver(err));
        }

        if info.kind == BackendKind::File {
            self.open_filecount += 1;
        }

        let index = match existing {
            Some(index) => index,
            None => {
                let index = self.nodes.len();
                self.nodes.push(CacheNode {
                    key: key.clone(),
                    backend,
                    handle: None,
                    item_cache: BTreeMap::new(),
                    up: None,
                    down: None,
                });
                self.by_key.insert(key, index);
                index
            }
        };
        let node = &mut self.nodes[index];
        node.handle = Some(handle);
        node.backend = backend;
        node.up = None;
        node.down = None;

        Ok(SearchHandle {
            index,
            generation: self.generation,
        })
    }

    /// Find one item, with partial matching and star defaults.
    ///
    /// Probes the key verbatim first. On a definite miss the fallbacks
    /// run in order: affixed and component-stripped probes (`partial`),
    /// the `*@` replacement, the literal `"*"`. A deferred probe aborts
    /// the whole call. Wildcarded hits push the wild and fixed parts into
    /// `expand`.
    ///
    /// Core options consumed here (and removed before the driver or the
    /// cache see them): `ret=key` returns the matched key instead of the
    /// value; `cache=no_rd` skips cache reads while still writing back.
    ///
    /// Returns `None` on miss, defer ([`deferred`] set) or failure
    /// ([`last_error`] set).
    ///
    /// [`deferred`]: SearchEngine::deferred
    /// [`last_error`]: SearchEngine::last_error
    pub fn find(
        &mut self,
        handle: SearchHandle,
        filename: Option<&str>,
        key: &SearchKey,
        wildcard: &WildcardRules,
        mut expand: Option<&mut Expansions>,
        opts: Option<&str>,
    ) -> Option<String> {
        self.last_error.clear();
        self.deferred = false;

        if handle.generation != self.generation || handle.index >= self.nodes.len() {
            self.last_error = SearchErrorKind::StaleHandle.to_string();
            return None;
        }
        let index = handle.index;

        debug!(
            "search_find: file=\"{}\" key=\"{}\" partial={:?} star={:?} opts={:?}",
            filename.unwrap_or("NULL"),
            key.text(),
            wildcard.partial,
            wildcard.star,
            opts
        );

        // Strip the engine-level options so they do not end up in cache
        // keys or driver calls.
        let mut cache_rd = true;
        let mut ret_key = false;
        let opts: Option<String> = opts.and_then(|opts| {
            let residual = opts
                .split(',')
                .filter(|ele| match *ele {
                    "ret=key" => {
                        ret_key = true;
                        false
                    }
                    "cache=no_rd" => {
                        cache_rd = false;
                        false
                    }
                    _ => true,
                })
                .join(",");
            (!residual.is_empty()).then_some(residual)
        });
        let opts = opts.as_deref();

        let registry = Arc::clone(&self.registry);
        if registry.get(self.nodes[index].backend).kind == BackendKind::File
            && self.nodes[index].handle.is_some()
            && self.lru_top != Some(index)
        {
            self.promote(index);
            self.trace_lru();
        }

        let mut yielded = self.internal_find(index, filename, key, cache_rd, opts);
        if self.deferred {
            return None;
        }

        let mut set_null_wild = false;
        if yielded.is_some() {
            if wildcard.partial.is_some() {
                set_null_wild = true;
            }
        } else if let Some(partial) = &wildcard.partial {
            let affix = partial.affix.as_str();
            let text = key.text();

            // Whole key behind the affix first.
            if !affix.is_empty() {
                let probe = key.derive(format!("{affix}{text}"));
                trace!("trying partial match {}", probe.text());
                yielded = self.internal_find(index, filename, &probe, cache_rd, opts);
                if self.deferred {
                    return None;
                }
            }

            if yielded.is_some() {
                // Matched a wild entry without any wild part.
                set_null_wild = true;
            } else {
                let mut dots = text.bytes().filter(|&b| b == b'.').count() as i64;
                let mut rest = text;

                while dots >= i64::from(partial.min_components) {
                    dots -= 1;
                    rest = match rest.find('.') {
                        Some(dot) => &rest[dot + 1..],
                        None => "",
                    };

                    // Once the key is exhausted, one last probe for the
                    // affix itself, dropping a trailing dot.
                    let (probe_text, affix_used, last_try) = if rest.is_empty() {
                        if affix.is_empty() {
                            break;
                        }
                        let trimmed = if affix.len() > 1 && affix.ends_with('.') {
                            &affix[..affix.len() - 1]
                        } else {
                            affix
                        };
                        (trimmed.to_string(), trimmed.len(), true)
                    } else {
                        (format!("{affix}{rest}"), affix.len(), false)
                    };

                    trace!("trying partial match {probe_text}");
                    let probe = key.derive(probe_text);
                    yielded = self.internal_find(index, filename, &probe, cache_rd, opts);
                    if self.deferred {
                        return None;
                    }
                    if yielded.is_some() {
                        if let Some(exp) = expand.as_deref_mut() {
                            let fixed_len = probe.len().saturating_sub(affix_used);
                            let wild_len = text.len().saturating_sub(fixed_len + 1);
                            exp.push(key.clone(), wild_len);
                            let fixed = text
                                .get(wild_len + 1..wild_len + 1 + fixed_len)
                                .unwrap_or("");
                            exp.push(SearchKey::untainted(fixed), fixed_len);
                        }
                        break;
                    }
                    if last_try {
                        break;
                    }
                }
            }
        }

        // Replace everything left of the last @ with *.
        if yielded.is_none() && wildcard.star == StarDefault::StarAt {
            let text = key.text();
            if let Some(at) = text.rfind('@') {
                if at > 0 {
                    let probe = key.derive(format!("*{}", &text[at..]));
                    trace!("trying default match {}", probe.text());
                    yielded = self.internal_find(index, filename, &probe, cache_rd, opts);
                    if self.deferred {
                        return None;
                    }
                    if yielded.is_some() {
                        if let Some(exp) = expand.as_deref_mut() {
                            exp.push(key.clone(), at + 1);
                            exp.push(key.clone(), 0);
                        }
                    }
                }
            }
        }

        // Last resort: the literal "*".
        if yielded.is_none() && wildcard.star.is_set() {
            trace!("trying to match *");
            let probe = SearchKey::untainted("*");
            yielded = self.internal_find(index, filename, &probe, cache_rd, opts);
            if yielded.is_some() {
                if let Some(exp) = expand.as_deref_mut() {
                    exp.push(key.clone(), key.len());
                    exp.push(key.clone(), 0);
                }
            }
        }

        // A complete match that could have been partial: empty wild part,
        // whole key as the fixed part.
        if set_null_wild {
            if let Some(exp) = expand.as_deref_mut() {
                exp.push(key.clone(), 0);
                exp.push(key.untainted_copy(), key.len());
            }
        }

        if yielded.is_some() && ret_key {
            yielded = Some(key.untainted_copy().text().to_string());
        }

        yielded
    }

    /// Close every cached database, run driver tidies, release the pool.
    ///
    /// All handles issued before this call become invalid. Calling it
    /// again with nothing opened in between is a no-op.
    pub fn tidyup(&mut self) {
        debug!("search_tidyup called");
        let registry = Arc::clone(&self.registry);

        for node in std::mem::take(&mut self.nodes) {
            if let (Some(handle), Some(driver)) =
                (node.handle, registry.get(node.backend).driver.clone())
            {
                driver.close(handle);
            }
        }
        self.by_key.clear();
        self.lru_top = None;
        self.lru_bot = None;
        self.open_filecount = 0;

        for info in registry.iter() {
            if let Some(driver) = &info.driver {
                driver.tidy();
            }
        }

        if let Some(mark) = self.reset_mark.take() {
            self.pool.reset(mark);
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// One probe against cache and driver, without wildcarding.
    fn internal_find(
        &mut self,
        index: usize,
        filename: Option<&str>,
        key: &SearchKey,
        cache_rd: bool,
        opts: Option<&str>,
    ) -> Option<String> {
        self.last_error.clear();
        self.deferred = false;

        let registry = Arc::clone(&self.registry);
        let backend = self.nodes[index].backend;
        let info = registry.get(backend);

        debug!(
            "internal_search_find: file=\"{}\" type={} key=\"{}\" opts={:?}",
            filename.unwrap_or("NULL"),
            info.name,
            key.text(),
            opts
        );

        if key.is_empty() {
            return None;
        }

        let now = self.now();

        if let Some(entry) = self.nodes[index].item_cache.get(key.text()) {
            let fresh = entry.expiry.map_or(true, |expiry| expiry > now);
            if fresh && entry.opts.as_deref() == opts && cache_rd {
                debug!("cached data used for lookup of {}", key.text());
                return entry.data.map(|data| self.pool.get(data).to_string());
            }
            debug!(
                "cached data found but {}; lookup required",
                if !fresh {
                    "out-of-date"
                } else if cache_rd {
                    "wrong opts"
                } else {
                    "no_rd option set"
                }
            );
        }

        // Tainted queries must be quoted for quoting-capable drivers.
        if filename.is_none()
            && info
                .driver
                .as_ref()
                .map_or(false, |driver| driver.supports_quoting())
            && key.is_tainted()
            && !key.is_quoted_for(backend)
        {
            let context = self
                .options
                .context
                .as_deref()
                .map(|c| format!(" in {c}"))
                .unwrap_or_default();
            #[cfg(feature = "enforce-quote-protection")]
            {
                self.last_error = format!(
                    "tainted search query is not properly quoted{context}: {}",
                    key.text()
                );
                self.deferred = true;
                return None;
            }
            #[cfg(not(feature = "enforce-quote-protection"))]
            warn!(
                "tainted search query is not properly quoted{context}: {}",
                key.text()
            );
        }

        let Some(driver) = info.driver.clone() else {
            self.last_error =
                SearchErrorKind::LookupTypeNotAvailable(info.name.clone()).to_string();
            return None;
        };

        let outcome = {
            let node = &mut self.nodes[index];
            let Some(handle) = node.handle.as_mut() else {
                self.last_error = SearchErrorKind::DatabaseClosed.to_string();
                return None;
            };
            driver.find(handle.as_mut(), filename, key.text(), opts)
        };

        let (data, caching) = match outcome {
            FindOutcome::Defer { message } => {
                self.deferred = true;
                self.last_error = message;
                debug!("lookup deferred: {}", self.last_error);
                return None;
            }
            FindOutcome::Found { data, caching } => (Some(data), caching),
            FindOutcome::NotFound { caching } => (None, caching),
        };

        if caching == CacheDirective::Disable {
            // Forget all lookups on this connection; the bytes go back to
            // the pool only at tidyup.
            debug!("lookup forced cache cleanup");
            self.nodes[index].item_cache = BTreeMap::new();
        } else {
            let expiry = match caching {
                CacheDirective::Seconds(ttl) => Some(now + chrono::Duration::seconds(i64::from(ttl))),
                _ => None,
            };
            trace!(
                "{} cache entry",
                if self.nodes[index].item_cache.contains_key(key.text()) {
                    "replacing old"
                } else {
                    "creating new"
                }
            );
            let data_ref = data.as_deref().map(|data| self.pool.intern(data));
            self.nodes[index].item_cache.insert(
                key.text().to_string(),
                CacheEntry {
                    data: data_ref,
                    expiry,
                    opts: opts.map(String::from),
                },
            );
        }

        match &data {
            Some(data) => debug!("lookup yielded: {data}"),
            None => debug!("lookup failed"),
        }
        data
    }

    /// Move a node to the top of the LRU chain, linking it in if it is
    /// newly opened.
    fn promote(&mut self, index: usize) {
        let (up, down) = {
            let node = &self.nodes[index];
            (node.up, node.down)
        };
        // A node with no up link is either the top (the caller excluded
        // that) or not yet on the chain.
        if let Some(up) = up {
            self.nodes[up].down = down;
            match down {
                Some(down) => self.nodes[down].up = Some(up),
                None => self.lru_bot = Some(up),
            }
        }

        self.nodes[index].up = None;
        self.nodes[index].down = self.lru_top;
        match self.lru_top {
            Some(top) => self.nodes[top].up = Some(index),
            None => self.lru_bot = Some(index),
        }
        self.lru_top = Some(index);
    }

    /// Close the least recently used file-backed database, keeping its
    /// node and result cache.
    fn evict_lru(&mut self, registry: &Registry) {
        let Some(bot) = self.lru_bot else {
            error!("too many lookups open, but cannot find one to close");
            return;
        };
        debug!("too many lookup files open; closing {}", self.nodes[bot].key);

        let up = self.nodes[bot].up;
        self.lru_bot = up;
        match up {
            Some(up) => self.nodes[up].down = None,
            None => self.lru_top = None,
        }
        self.nodes[bot].up = None;
        self.nodes[bot].down = None;

        let backend = self.nodes[bot].backend;
        if let (Some(handle), Some(driver)) = (
            self.nodes[bot].handle.take(),
            registry.get(backend).driver.clone(),
        ) {
            driver.close(handle);
        }
        self.open_filecount = self.open_filecount.saturating_sub(1);
    }

    fn trace_lru(&self) {
        if log::log_enabled!(log::Level::Trace) {
            trace!("LRU list:");
            let mut current = self.lru_top;
            while let Some(index) = current {
                trace!("  {}", self.nodes[index].key);
                if Some(index) == self.lru_bot {
                    trace!("  End");
                }
                current = self.nodes[index].down;
            }
        }
    }

    fn fail<T>(&mut self, err: SearchErrorKind) -> SearchResult<T> {
        self.last_error = err.to_string();
        Err(err)
    }

    fn now(&self) -> DateTime<Utc> {
        #[cfg(test)]
        if let Some(now) = self.now_override {
            return now;
        }
        Utc::now()
    }
}

/// Cache nodes are filed under the search type plus `'0'` concatenated
/// with the filename (empty for pure-query kinds), the filename truncated
/// to 254 bytes.
fn composite_key(backend: usize, filename: Option<&str>) -> String {
    let name = filename.unwrap_or("");
    let mut cut = name.len().min(254);
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut key = String::with_capacity(cut + 1);
    key.push(char::from(b'0'.wrapping_add(backend as u8)));
    key.push_str(&name[..cut]);
    key
}

#[cfg(test)]
mod tests {
    use std::{
        any::Any,
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex},
    };

    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        driver::LookupDriver,
        registry::{BackendInfo, BackendKind},
    };

    /// Shared script and counters for one scripted driver.
    #[derive(Default)]
    struct Script {
        entries: HashMap<String, (String, CacheDirective)>,
        defer_keys: HashSet<String>,
        calls: Vec<String>,
        opens: usize,
        closes: usize,
        tidies: usize,
    }

    impl Script {
        fn shared() -> Arc<Mutex<Self>> {
            Arc::new(Mutex::new(Self::default()))
        }
    }

    fn set(script: &Arc<Mutex<Script>>, key: &str, value: &str) {
        set_with(script, key, value, CacheDirective::Forever);
    }

    fn set_with(script: &Arc<Mutex<Script>>, key: &str, value: &str, caching: CacheDirective) {
        let _ = script
            .lock()
            .unwrap()
            .entries
            .insert(key.to_string(), (value.to_string(), caching));
    }

    fn calls(script: &Arc<Mutex<Script>>) -> Vec<String> {
        script.lock().unwrap().calls.clone()
    }

    struct ScriptedDriver {
        script: Arc<Mutex<Script>>,
        quoting: bool,
    }

    impl ScriptedDriver {
        fn new(script: Arc<Mutex<Script>>) -> Self {
            Self {
                script,
                quoting: false,
            }
        }
    }

    impl LookupDriver for ScriptedDriver {
        fn open(&self, _filename: Option<&str>) -> Result<DriverHandle> {
            self.script.lock().unwrap().opens += 1;
            Ok(Box::new(()))
        }

        fn find(
            &self,
            _handle: &mut dyn Any,
            _filename: Option<&str>,
            key: &str,
            _opts: Option<&str>,
        ) -> FindOutcome {
            let mut script = self.script.lock().unwrap();
            script.calls.push(key.to_string());
            if script.defer_keys.contains(key) {
                return FindOutcome::defer("scripted defer");
            }
            match script.entries.get(key) {
                Some((data, caching)) => FindOutcome::Found {
                    data: data.clone(),
                    caching: *caching,
                },
                None => FindOutcome::miss(),
            }
        }

        fn close(&self, _handle: DriverHandle) {
            self.script.lock().unwrap().closes += 1;
        }

        fn tidy(&self) {
            self.script.lock().unwrap().tidies += 1;
        }

        fn supports_quoting(&self) -> bool {
            self.quoting
        }
    }

    /// Engine over one file-kind driver ("dbm") and one query-kind driver
    /// ("testq") sharing a script each.
    fn engine(
        max_open_files: usize,
    ) -> (SearchEngine, Arc<Mutex<Script>>, Arc<Mutex<Script>>) {
        let file_script = Script::shared();
        let query_script = Script::shared();
        let registry = Arc::new(Registry::new(vec![
            BackendInfo::with_driver(
                "dbm",
                BackendKind::File,
                Arc::new(ScriptedDriver::new(Arc::clone(&file_script))),
            ),
            BackendInfo::with_driver(
                "testq",
                BackendKind::Query,
                Arc::new(ScriptedDriver::new(Arc::clone(&query_script))),
            ),
        ]));
        let engine = SearchEngine::new(
            registry,
            SearchOptions::default().max_open_files(max_open_files),
        );
        (engine, file_script, query_script)
    }

    fn open_file(engine: &mut SearchEngine, name: &str) -> SearchHandle {
        let backend = engine.registry().find_type("dbm").unwrap();
        engine
            .open(
                Some(&SearchKey::untainted(name)),
                backend,
                &FileChecks::default(),
            )
            .unwrap()
    }

    fn find_plain(
        engine: &mut SearchEngine,
        handle: SearchHandle,
        name: &str,
        key: &str,
    ) -> Option<String> {
        engine.find(
            handle,
            Some(name),
            &SearchKey::untainted(key),
            &WildcardRules::none(),
            None,
            None,
        )
    }

    fn partial2() -> WildcardRules {
        WildcardRules {
            partial: Some(PartialMatch {
                min_components: 2,
                affix: "*.".to_string(),
            }),
            star: StarDefault::None,
        }
    }

    #[test]
    fn handles_are_stable_until_tidyup() {
        let (mut engine, _file, _query) = engine(8);
        let first = open_file(&mut engine, "/etc/aliases");
        let again = open_file(&mut engine, "/etc/aliases");
        assert_eq!(first, again);

        engine.tidyup();
        let fresh = open_file(&mut engine, "/etc/aliases");
        assert_ne!(first, fresh);
    }

    #[test]
    fn stale_handle_is_refused_after_tidyup() {
        let (mut engine, file, _query) = engine(8);
        let handle = open_file(&mut engine, "/etc/aliases");
        engine.tidyup();
        assert_eq!(find_plain(&mut engine, handle, "/etc/aliases", "k"), None);
        assert!(engine.last_error().contains("stale"));
        assert!(calls(&file).is_empty());
    }

    #[test]
    fn lru_eviction_closes_least_recently_found() {
        let (mut engine, file, _query) = engine(2);
        set(&file, "k", "v");

        let a = open_file(&mut engine, "/db/a");
        let b = open_file(&mut engine, "/db/b");
        assert_eq!(find_plain(&mut engine, b, "/db/b", "k").as_deref(), Some("v"));
        assert_eq!(find_plain(&mut engine, a, "/db/a", "k").as_deref(), Some("v"));

        // A was used last, so opening a third file closes B.
        let _c = open_file(&mut engine, "/db/c");
        assert_eq!(file.lock().unwrap().closes, 1);
        assert_eq!(engine.open_filecount, 2);
        assert!(engine.nodes[b.index].handle.is_none());
        assert!(!engine.nodes[b.index].item_cache.is_empty());

        // Reopening B reuses its node and evicts A, the older survivor.
        let b2 = open_file(&mut engine, "/db/b");
        assert_eq!(b2.index, b.index);
        assert!(engine.nodes[a.index].handle.is_none());
        assert_eq!(file.lock().unwrap().closes, 2);
        assert_eq!(engine.open_filecount, 2);

        // B's result cache survived the eviction.
        let before = calls(&file).len();
        assert_eq!(find_plain(&mut engine, b2, "/db/b", "k").as_deref(), Some("v"));
        assert_eq!(calls(&file).len(), before);
    }

    #[test]
    fn lru_chain_matches_open_filecount() {
        let (mut engine, file, _query) = engine(3);
        set(&file, "k", "v");
        for name in ["/db/a", "/db/b", "/db/c"] {
            let handle = open_file(&mut engine, name);
            let _ = find_plain(&mut engine, handle, name, "k");
        }
        let mut length = 0;
        let mut current = engine.lru_top;
        while let Some(index) = current {
            assert!(engine.nodes[index].handle.is_some());
            length += 1;
            current = engine.nodes[index].down;
        }
        assert_eq!(length, engine.open_filecount);
        assert!(engine.open_filecount <= 3);
    }

    #[test]
    fn cached_result_expires_with_ttl() {
        let (mut engine, file, _query) = engine(8);
        set_with(&file, "k", "v", CacheDirective::Seconds(60));
        let handle = open_file(&mut engine, "/db/a");
        engine.now_override = Some(Utc::now());

        assert_eq!(find_plain(&mut engine, handle, "/db/a", "k").as_deref(), Some("v"));
        assert_eq!(find_plain(&mut engine, handle, "/db/a", "k").as_deref(), Some("v"));
        assert_eq!(calls(&file).len(), 1);

        engine.now_override = Some(engine.now() + chrono::Duration::seconds(61));
        assert_eq!(find_plain(&mut engine, handle, "/db/a", "k").as_deref(), Some("v"));
        assert_eq!(calls(&file).len(), 2);
    }

    #[test]
    fn misses_are_cached_too() {
        let (mut engine, file, _query) = engine(8);
        let handle = open_file(&mut engine, "/db/a");
        assert_eq!(find_plain(&mut engine, handle, "/db/a", "nope"), None);
        assert!(!engine.deferred());
        assert_eq!(find_plain(&mut engine, handle, "/db/a", "nope"), None);
        assert_eq!(calls(&file).len(), 1);
    }

    #[test]
    fn differing_opts_do_not_share_cache_entries() {
        let (mut engine, file, _query) = engine(8);
        set(&file, "k", "v");
        let handle = open_file(&mut engine, "/db/a");
        let key = SearchKey::untainted("k");

        let probe = |engine: &mut SearchEngine, opts| {
            engine
                .find(handle, Some("/db/a"), &key, &WildcardRules::none(), None, opts)
        };
        assert!(probe(&mut engine, Some("flags=a")).is_some());
        assert!(probe(&mut engine, Some("flags=a")).is_some());
        assert_eq!(calls(&file).len(), 1);

        assert!(probe(&mut engine, Some("flags=b")).is_some());
        assert_eq!(calls(&file).len(), 2);
        assert!(probe(&mut engine, Some("flags=b")).is_some());
        assert_eq!(calls(&file).len(), 2);
    }

    #[test]
    fn cache_no_rd_skips_reads_but_still_writes() {
        let (mut engine, file, _query) = engine(8);
        set(&file, "k", "v1");
        let handle = open_file(&mut engine, "/db/a");
        let key = SearchKey::untainted("k");

        assert_eq!(find_plain(&mut engine, handle, "/db/a", "k").as_deref(), Some("v1"));
        set(&file, "k", "v2");

        // no_rd bypasses the fresh entry and overwrites it.
        let got = engine.find(
            handle,
            Some("/db/a"),
            &key,
            &WildcardRules::none(),
            None,
            Some("cache=no_rd"),
        );
        assert_eq!(got.as_deref(), Some("v2"));
        assert_eq!(calls(&file).len(), 2);

        assert_eq!(find_plain(&mut engine, handle, "/db/a", "k").as_deref(), Some("v2"));
        assert_eq!(calls(&file).len(), 2);
    }

    #[test]
    fn disable_directive_clears_the_result_cache() {
        let (mut engine, _file, query) = engine(8);
        set_with(&query, "update t", "done", CacheDirective::Disable);
        set(&query, "k", "v");
        let backend = engine.registry().find_type("testq").unwrap();
        let handle = engine.open(None, backend, &FileChecks::default()).unwrap();
        let rules = WildcardRules::none();

        let probe = |engine: &mut SearchEngine, key: &str| {
            engine.find(handle, None, &SearchKey::untainted(key), &rules, None, None)
        };

        assert_eq!(probe(&mut engine, "k").as_deref(), Some("v"));
        assert_eq!(calls(&query).len(), 1);

        assert_eq!(probe(&mut engine, "update t").as_deref(), Some("done"));

        // The side-effecting query dropped the whole cache for this
        // handle, so k is fetched again.
        assert_eq!(probe(&mut engine, "k").as_deref(), Some("v"));
        assert_eq!(calls(&query).len(), 3);
    }

    #[test]
    fn partial_match_prefers_longer_tails() {
        let (mut engine, file, _query) = engine(8);
        set(&file, "*.c.d", "close");
        set(&file, "*.d", "far");
        let handle = open_file(&mut engine, "/db/a");
        let key = SearchKey::untainted("a.b.c.d");

        let got = engine.find(handle, Some("/db/a"), &key, &partial2(), None, None);
        assert_eq!(got.as_deref(), Some("close"));
        assert_eq!(
            calls(&file),
            vec!["a.b.c.d", "*.a.b.c.d", "*.b.c.d", "*.c.d"]
        );
    }

    #[test]
    fn partial_match_falls_back_to_shorter_tail() {
        let (mut engine, file, _query) = engine(8);
        set(&file, "*.d", "far");
        let handle = open_file(&mut engine, "/db/a");
        let key = SearchKey::untainted("a.b.c.d");
        let rules = WildcardRules {
            partial: Some(PartialMatch {
                min_components: 1,
                affix: "*.".to_string(),
            }),
            star: StarDefault::None,
        };

        let got = engine.find(handle, Some("/db/a"), &key, &rules, None, None);
        assert_eq!(got.as_deref(), Some("far"));
        assert_eq!(
            calls(&file),
            vec!["a.b.c.d", "*.a.b.c.d", "*.b.c.d", "*.c.d", "*.d"]
        );
    }

    #[test]
    fn partial_match_respects_minimum_components() {
        let (mut engine, file, _query) = engine(8);
        set(&file, "*.d", "too far");
        set(&file, "*.x", "wrong");
        let handle = open_file(&mut engine, "/db/a");
        let key = SearchKey::untainted("a.b.c.d");

        // Stripping stops before fewer than two components remain, so
        // neither entry is reachable.
        let got = engine.find(handle, Some("/db/a"), &key, &partial2(), None, None);
        assert_eq!(got, None);
        assert_eq!(
            calls(&file),
            vec!["a.b.c.d", "*.a.b.c.d", "*.b.c.d", "*.c.d"]
        );
    }

    #[test]
    fn partial_zero_reaches_the_bare_affix() {
        let (mut engine, file, _query) = engine(8);
        set(&file, "*", "wild");
        let handle = open_file(&mut engine, "/db/a");
        let key = SearchKey::untainted("a.b");
        let rules = WildcardRules {
            partial: Some(PartialMatch {
                min_components: 0,
                affix: "*.".to_string(),
            }),
            star: StarDefault::None,
        };

        // The affix loses its trailing dot for the final probe.
        let got = engine.find(handle, Some("/db/a"), &key, &rules, None, None);
        assert_eq!(got.as_deref(), Some("wild"));
        assert_eq!(calls(&file), vec!["a.b", "*.a.b", "*.b", "*"]);
    }

    #[test]
    fn partial_hit_sets_wild_and_fixed_slots() {
        let (mut engine, file, _query) = engine(8);
        set(&file, "*.c.d", "v");
        let handle = open_file(&mut engine, "/db/a");
        let key = SearchKey::tainted("a.b.c.d");
        let mut expand = Expansions::new();

        let got = engine.find(
            handle,
            Some("/db/a"),
            &key,
            &partial2(),
            Some(&mut expand),
            None,
        );
        assert_eq!(got.as_deref(), Some("v"));
        assert_eq!(expand.count(), 2);
        assert_eq!(expand.value(0), "a.b");
        assert_eq!(expand.value(1), "c.d");
        let (wild, _) = expand.slot(0);
        let (fixed, _) = expand.slot(1);
        assert!(wild.is_tainted());
        assert!(!fixed.is_tainted());
    }

    #[test]
    fn complete_match_under_partial_sets_null_wild_slots() {
        let (mut engine, file, _query) = engine(8);
        set(&file, "a.b.c.d", "v");
        let handle = open_file(&mut engine, "/db/a");
        let key = SearchKey::tainted("a.b.c.d");
        let mut expand = Expansions::new();

        let got = engine.find(
            handle,
            Some("/db/a"),
            &key,
            &partial2(),
            Some(&mut expand),
            None,
        );
        assert_eq!(got.as_deref(), Some("v"));
        assert_eq!(expand.count(), 2);
        assert_eq!(expand.value(0), "");
        assert_eq!(expand.value(1), "a.b.c.d");
        assert!(!expand.slot(1).0.is_tainted());
    }

    #[test]
    fn star_at_replaces_left_of_the_at_sign() {
        let (mut engine, _file, query) = engine(8);
        set(&query, "*@example.com", "value");
        let backend = engine.registry().find_type("testq").unwrap();
        let handle = engine.open(None, backend, &FileChecks::default()).unwrap();
        let key = SearchKey::untainted("alice@example.com");
        let mut expand = Expansions::new();
        let rules = WildcardRules {
            partial: None,
            star: StarDefault::StarAt,
        };

        let got = engine.find(
            handle,
            None,
            &key,
            &rules,
            Some(&mut expand),
            Some("ret=key"),
        );
        // ret=key yields the original key, not the stored value.
        assert_eq!(got.as_deref(), Some("alice@example.com"));
        assert_eq!(calls(&query), vec!["alice@example.com", "*@example.com"]);
        assert_eq!(expand.count(), 2);
        assert_eq!(expand.slot(0).1, 6);
        assert_eq!(expand.value(0), "alice@");
        assert_eq!(expand.value(1), "");
    }

    #[test]
    fn star_fallback_matches_bare_star() {
        let (mut engine, _file, query) = engine(8);
        set(&query, "*", "anything");
        let backend = engine.registry().find_type("testq").unwrap();
        let handle = engine.open(None, backend, &FileChecks::default()).unwrap();
        let key = SearchKey::untainted("no.match.here");
        let mut expand = Expansions::new();
        let rules = WildcardRules {
            partial: None,
            star: StarDefault::Star,
        };

        let got = engine.find(handle, None, &key, &rules, Some(&mut expand), None);
        assert_eq!(got.as_deref(), Some("anything"));
        assert_eq!(expand.value(0), "no.match.here");
        assert_eq!(expand.value(1), "");
    }

    #[test]
    fn defer_short_circuits_all_fallbacks() {
        let (mut engine, file, _query) = engine(8);
        let handle = open_file(&mut engine, "/db/a");
        file.lock().unwrap().defer_keys.insert("a.b.c.d".to_string());
        set(&file, "*.c.d", "never reached");
        let key = SearchKey::untainted("a.b.c.d");
        let rules = WildcardRules {
            partial: partial2().partial,
            star: StarDefault::StarAt,
        };

        let got = engine.find(handle, Some("/db/a"), &key, &rules, None, None);
        assert_eq!(got, None);
        assert!(engine.deferred());
        assert_eq!(calls(&file), vec!["a.b.c.d"]);
    }

    #[test]
    fn tainted_filename_fails_open() {
        let (mut engine, file, _query) = engine(8);
        let backend = engine.registry().find_type("dbm").unwrap();
        let err = engine
            .open(
                Some(&SearchKey::tainted("/db/evil")),
                backend,
                &FileChecks::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SearchErrorKind::TaintedFilename(_)));
        assert!(engine.last_error().contains("tainted"));
        assert_eq!(file.lock().unwrap().opens, 0);
    }

    #[cfg(feature = "enforce-quote-protection")]
    #[test]
    fn tainted_unquoted_query_defers_when_enforced() {
        let (_engine, _file, query) = engine(8);
        set(&query, "k", "v");
        // Rebuild the query driver with quoting enabled.
        let registry = Arc::new(Registry::new(vec![BackendInfo::with_driver(
            "testq",
            BackendKind::Query,
            Arc::new(ScriptedDriver {
                script: Arc::clone(&query),
                quoting: true,
            }),
        )]));
        let mut engine = SearchEngine::new(registry, SearchOptions::default());
        let handle = engine.open(None, 0, &FileChecks::default()).unwrap();

        let got = engine.find(
            handle,
            None,
            &SearchKey::tainted("k"),
            &WildcardRules::none(),
            None,
            None,
        );
        assert_eq!(got, None);
        assert!(engine.deferred());
        assert!(engine.last_error().contains("not properly quoted"));
        assert!(calls(&query).is_empty());
    }

    #[test]
    fn quoted_tainted_query_is_not_flagged() {
        let (_engine, _file, query) = engine(8);
        let registry = Arc::new(Registry::new(vec![BackendInfo::with_driver(
            "testq",
            BackendKind::Query,
            Arc::new(ScriptedDriver {
                script: Arc::clone(&query),
                quoting: true,
            }),
        )]));
        set(&query, "k", "v");
        let mut engine = SearchEngine::new(registry, SearchOptions::default());
        let handle = engine.open(None, 0, &FileChecks::default()).unwrap();

        let mut key = SearchKey::tainted("k");
        key.mark_quoted_for(0);
        let got = engine.find(handle, None, &key, &WildcardRules::none(), None, None);
        assert_eq!(got.as_deref(), Some("v"));
    }

    #[test]
    fn tidyup_closes_everything_once_and_is_idempotent() {
        let (mut engine, file, query) = engine(8);
        set(&file, "k", "v");
        for name in ["/db/a", "/db/b", "/db/c", "/db/d"] {
            let handle = open_file(&mut engine, name);
            let _ = find_plain(&mut engine, handle, name, "k");
        }
        let backend = engine.registry().find_type("testq").unwrap();
        let _ = engine.open(None, backend, &FileChecks::default()).unwrap();

        engine.tidyup();
        assert_eq!(file.lock().unwrap().closes, 4);
        assert_eq!(query.lock().unwrap().closes, 1);
        // Every driver's tidy runs, used or not.
        assert_eq!(file.lock().unwrap().tidies, 1);
        assert_eq!(query.lock().unwrap().tidies, 1);
        assert_eq!(engine.open_filecount, 0);
        assert_eq!(engine.pool.len(), 0);
        assert!(engine.reset_mark.is_none());

        engine.tidyup();
        assert_eq!(file.lock().unwrap().closes, 4);
        assert_eq!(file.lock().unwrap().tidies, 2);
    }

    #[test]
    fn empty_key_fails_without_driver_call() {
        let (mut engine, file, _query) = engine(8);
        let handle = open_file(&mut engine, "/db/a");
        assert_eq!(find_plain(&mut engine, handle, "/db/a", ""), None);
        assert!(calls(&file).is_empty());
    }

    #[test]
    fn composite_key_truncates_long_filenames() {
        let long = "x".repeat(400);
        let key = composite_key(3, Some(&long));
        assert_eq!(key.len(), 255);
        assert!(key.starts_with('3'));
    }
}
