/*!
A library for dispatching key lookups across pluggable backend drivers,
with caching, for mail transport agents.

# Overview

This section gives a brief overview of the primary types in this crate:

The main type is the [`SearchEngine`], which presents one uniform API over
heterogeneous backing stores: resolve a lookup type name through a
[`Registry`], [`open`] a named database, [`find`] keys against it -
possibly with partial (wildcard) matching and star defaults - and
[`tidyup`] when done.

Open databases are cached per engine. File-backed databases are kept on
an LRU chain bounded by [`SearchOptions::max_open_files`]; the least
recently used one is closed when the budget is exceeded, while its node
and cached results survive for a later reopen. Each open database also
caches lookup results with optional expiry and option-sensitive keys.

Backends implement the [`LookupDriver`] trait and are registered by name;
a registered name without a compiled-in driver is reported as
unavailable. Keys and filenames travel as [`SearchKey`] values carrying
their taint state.

# Example

```rust
use lookup_core::{FileChecks, SearchEngine, SearchKey, WildcardRules};

let mut engine = SearchEngine::with_builtin();
let parsed = engine.registry().parse_full_type("testdb,ret=key").unwrap();

let handle = engine
    .open(None, parsed.backend, &FileChecks::default())
    .unwrap();
let found = engine.find(
    handle,
    None,
    &SearchKey::untainted("postmaster"),
    &WildcardRules::none(),
    None,
    parsed.opts.as_deref(),
);
assert!(found.is_none());
assert!(!engine.deferred());

engine.tidyup();
```

# Crate features

This crate exposes a few features for controlling dependency usage:

- **lsearch** - Enables the flat-file linear-search driver. *This feature
  is enabled by default*.

- **testdb** - Enables the in-memory query driver used for tests and
  smoke checks. *This feature is enabled by default*.

- **enforce-quote-protection** - Promotes the tainted-unquoted-key
  diagnostic from a logged warning to a deferred lookup failure. *This
  feature is disabled by default*.

[`open`]: SearchEngine::open
[`find`]: SearchEngine::find
[`tidyup`]: SearchEngine::tidyup
*/

pub mod backends;
pub mod driver;
pub mod error;
mod pool;
pub mod registry;
pub mod search;
pub mod taint;

// lookup_core Public API
pub use crate::{
    driver::{CacheDirective, DriverHandle, FileChecks, FindOutcome, LookupDriver},
    error::{SearchErrorKind, SearchResult},
    registry::{
        split_args, BackendInfo, BackendKind, ParsedType, PartialMatch, Registry, SplitArgs,
        StarDefault,
    },
    search::{Expansions, SearchEngine, SearchHandle, SearchOptions, WildcardRules},
    taint::SearchKey,
};

#[cfg(feature = "lsearch")]
pub use crate::backends::lsearch::LsearchDriver;

#[cfg(feature = "testdb")]
pub use crate::backends::testdb::TestDbDriver;
