//! The backend registry and the lookup type-name parser.
//!
//! A registry is an ordered directory of [`BackendInfo`] descriptors. A
//! descriptor without a driver is *declared but unavailable* - the type
//! name is known, but the code is not in the binary - and is rejected at
//! type-lookup time with a distinct diagnostic.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::{
    driver::LookupDriver,
    error::{SearchErrorKind, SearchResult},
};

/// The three shapes a lookup can take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// A single key against a real file (flat file, DBM). Open handles
    /// count against the file-descriptor budget.
    File,
    /// A self-contained query string (SQL, DNS); no filename.
    Query,
    /// A query that also names a file (e.g. sqlite).
    FileQuery,
}

impl BackendKind {
    /// Query-style kinds take a whole query string rather than a single
    /// key, so partial matching and star defaults make no sense for them.
    #[must_use]
    pub fn is_query_style(self) -> bool {
        matches!(self, Self::Query | Self::FileQuery)
    }
}

/// One entry in the registry.
#[derive(Clone)]
pub struct BackendInfo {
    /// Unique lowercase type name.
    pub name: String,
    pub kind: BackendKind,
    /// The compiled-in driver, or `None` when the type is declared but not
    /// built into this binary.
    pub driver: Option<Arc<dyn LookupDriver>>,
}

impl BackendInfo {
    /// A descriptor whose driver is not compiled in.
    pub fn declared(name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind,
            driver: None,
        }
    }

    /// A descriptor backed by a driver.
    pub fn with_driver(
        name: impl Into<String>,
        kind: BackendKind,
        driver: Arc<dyn LookupDriver>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            driver: Some(driver),
        }
    }
}

impl std::fmt::Debug for BackendInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendInfo")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("available", &self.driver.is_some())
            .finish()
    }
}

/// Star-default suffix parsed from a full lookup type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StarDefault {
    /// No default suffix.
    #[default]
    None,
    /// `*` - fall back to the literal key `"*"`.
    Star,
    /// `*@` - additionally try replacing everything left of the last `@`.
    StarAt,
}

impl StarDefault {
    pub(crate) fn is_set(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Partial (wildcard) matching parameters from a `partial...` prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialMatch {
    /// Minimum number of non-wild components that must remain.
    pub min_components: u32,
    /// Wildcard prefix tried during component stripping, e.g. `"*."`.
    pub affix: String,
}

/// Result of [`Registry::parse_full_type`].
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedType {
    /// Index of the backend in the registry.
    pub backend: usize,
    /// Partial-matching parameters, if the `partial` prefix was given.
    pub partial: Option<PartialMatch>,
    /// Star-default suffix.
    pub star: StarDefault,
    /// Raw options tail after the first `,`, unparsed.
    pub opts: Option<String>,
}

/// An ordered directory of backend descriptors, binary-searched by name.
pub struct Registry {
    backends: Vec<BackendInfo>,
}

impl Registry {
    /// Build a registry from descriptors. Entries are sorted by name;
    /// names must be unique and lowercase.
    #[must_use]
    pub fn new(mut backends: Vec<BackendInfo>) -> Self {
        backends.sort_by(|a, b| a.name.cmp(&b.name));
        Self { backends }
    }

    /// The shared registry of compiled-in drivers, plus declared
    /// placeholders for common types this build leaves out.
    pub fn builtin() -> Arc<Self> {
        static BUILTIN: Lazy<Arc<Registry>> =
            Lazy::new(|| Arc::new(Registry::new(builtin_backends())));
        Arc::clone(&BUILTIN)
    }

    /// Descriptor at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` did not come from this registry.
    #[must_use]
    pub fn get(&self, index: usize) -> &BackendInfo {
        &self.backends[index]
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &BackendInfo> {
        self.backends.iter()
    }

    /// Validate a plain lookup type name.
    ///
    /// The whole of `name` must match a registered name exactly; a name
    /// that is a prefix of a longer registered name (`nis` vs `nisplus`)
    /// matches only its own entry.
    ///
    /// # Errors
    ///
    /// * [`SearchErrorKind::UnknownLookupType`] - no such name.
    /// * [`SearchErrorKind::LookupTypeNotAvailable`] - the name is
    ///   registered but its driver is not in the binary.
    pub fn find_type(&self, name: &str) -> SearchResult<usize> {
        match self
            .backends
            .binary_search_by(|b| b.name.as_str().cmp(name))
        {
            Ok(index) => {
                if self.backends[index].driver.is_some() {
                    Ok(index)
                } else {
                    Err(SearchErrorKind::LookupTypeNotAvailable(name.to_string()))
                }
            }
            Err(_) => Err(SearchErrorKind::UnknownLookupType(name.to_string())),
        }
    }

    /// Validate a full lookup type name: optional `partial` prefix, the
    /// backend name, optional `*`/`*@` suffix, optional `,opt,...` tail.
    ///
    /// # Errors
    ///
    /// Everything [`find_type`] raises, plus
    /// [`SearchErrorKind::LookupTypeFormat`] for a malformed `partial`
    /// prefix and [`SearchErrorKind::PartialNotPermitted`] /
    /// [`SearchErrorKind::StarNotPermitted`] when those modifiers are
    /// applied to a query-style type.
    ///
    /// [`find_type`]: Registry::find_type
    pub fn parse_full_type(&self, name: &str) -> SearchResult<ParsedType> {
        let mut rest = name;
        let mut partial = None;

        if let Some(after) = rest.strip_prefix("partial") {
            let digits_end = after
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(after.len());
            let min_components = if digits_end > 0 {
                after[..digits_end].parse().unwrap_or(u32::MAX)
            } else {
                2
            };
            let after = &after[digits_end..];

            let (affix, after) = if let Some(inner) = after.strip_prefix('(') {
                let affix_end = inner
                    .find(|c: char| !c.is_ascii_punctuation() || c == ')')
                    .unwrap_or(inner.len());
                match inner[affix_end..].strip_prefix(')') {
                    Some(after_paren) => (inner[..affix_end].to_string(), after_paren),
                    None => {
                        return Err(SearchErrorKind::LookupTypeFormat(name.to_string()));
                    }
                }
            } else if let Some(after_dash) = after.strip_prefix('-') {
                ("*.".to_string(), after_dash)
            } else {
                return Err(SearchErrorKind::LookupTypeFormat(name.to_string()));
            };

            partial = Some(PartialMatch {
                min_components,
                affix,
            });
            rest = after;
        }

        // The name runs to the first "*"; anything between a star suffix
        // and the option comma is ignored, as in the original parser.
        let mut star = StarDefault::None;
        let mut name_len = rest.len();
        let star_pos = rest.find('*');
        if let Some(p) = star_pos {
            name_len = p;
            star = if rest[p + 1..].starts_with('@') {
                StarDefault::StarAt
            } else {
                StarDefault::Star
            };
        }

        let mut opts = None;
        let comma_from = star_pos.unwrap_or(0);
        if let Some(c) = rest[comma_from..].find(',') {
            let comma = comma_from + c;
            if comma < name_len {
                name_len = comma;
            }
            opts = Some(rest[comma + 1..].to_string());
        }

        let type_name = &rest[..name_len];
        let backend = self.find_type(type_name)?;

        if self.backends[backend].kind.is_query_style() {
            if partial.is_some() {
                return Err(SearchErrorKind::PartialNotPermitted(type_name.to_string()));
            }
            if star.is_set() {
                return Err(SearchErrorKind::StarNotPermitted(type_name.to_string()));
            }
        }

        Ok(ParsedType {
            backend,
            partial,
            star,
            opts,
        })
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.backends.iter()).finish()
    }
}

/// Filename and payload for the three lookup shapes.
#[derive(Debug, PartialEq, Eq)]
pub struct SplitArgs<'a> {
    /// The file to open, if the kind uses one.
    pub filename: Option<&'a str>,
    /// The key (single-key kinds) or query remainder handed to `find`.
    pub payload: &'a str,
}

/// Split a search string and its argument into filename and payload.
///
/// For [`BackendKind::FileQuery`] the filename comes from a `file=PATH`
/// option when present, or else from a legacy leading `/`-prefixed
/// whitespace-terminated token of the query.
#[must_use]
pub fn split_args<'a>(
    kind: BackendKind,
    search: &'a str,
    query: &'a str,
    opts: Option<&'a str>,
) -> SplitArgs<'a> {
    let query = query.trim_start();
    match kind {
        BackendKind::FileQuery => {
            if let Some(opts) = opts {
                for ele in opts.split(',') {
                    if let Some(path) = ele.strip_prefix("file=") {
                        return SplitArgs {
                            filename: Some(path),
                            payload: query,
                        };
                    }
                }
            }
            if query.starts_with('/') {
                let end = query
                    .find(char::is_whitespace)
                    .unwrap_or(query.len());
                SplitArgs {
                    filename: Some(&query[..end]),
                    payload: query[end..].trim_start(),
                }
            } else {
                SplitArgs {
                    filename: None,
                    payload: query,
                }
            }
        }
        BackendKind::File => SplitArgs {
            filename: Some(query),
            payload: search,
        },
        BackendKind::Query => SplitArgs {
            filename: None,
            payload: query,
        },
    }
}

fn builtin_backends() -> Vec<BackendInfo> {
    let mut list = vec![
        BackendInfo::declared("dbm", BackendKind::File),
        BackendInfo::declared("dsearch", BackendKind::File),
        BackendInfo::declared("mysql", BackendKind::Query),
        BackendInfo::declared("nis", BackendKind::Query),
        BackendInfo::declared("nisplus", BackendKind::Query),
        BackendInfo::declared("sqlite", BackendKind::FileQuery),
    ];

    #[cfg(feature = "lsearch")]
    list.push(BackendInfo::with_driver(
        "lsearch",
        BackendKind::File,
        Arc::new(crate::backends::lsearch::LsearchDriver),
    ));
    #[cfg(not(feature = "lsearch"))]
    list.push(BackendInfo::declared("lsearch", BackendKind::File));

    #[cfg(feature = "testdb")]
    list.push(BackendInfo::with_driver(
        "testdb",
        BackendKind::Query,
        Arc::new(crate::backends::testdb::TestDbDriver::new()),
    ));
    #[cfg(not(feature = "testdb"))]
    list.push(BackendInfo::declared("testdb", BackendKind::Query));

    list
}
