//! Taint tracking for lookup keys and filenames.
//!
//! A string is *tainted* when it derives from untrusted input (message
//! envelope, remote host). The engine consults taint at three points:
//! filenames passed to [`open`], keys probed against quoting-capable
//! backends, and strings written into expansion slots.
//!
//! [`open`]: crate::search::SearchEngine::open

/// A lookup key or filename together with its taint state.
///
/// The `quoted_for` marker records which backend the host has already
/// quoted this string for, so a tainted-but-quoted query is not flagged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchKey {
    text: String,
    tainted: bool,
    quoted_for: Option<usize>,
}

impl SearchKey {
    /// Wrap a string that does not derive from untrusted input.
    pub fn untainted(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tainted: false,
            quoted_for: None,
        }
    }

    /// Wrap a string that derives from untrusted input.
    pub fn tainted(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tainted: true,
            quoted_for: None,
        }
    }

    /// The wrapped text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Byte length of the wrapped text.
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Whether the wrapped text is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether this string derives from untrusted input.
    #[must_use]
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Whether this string has been quoted for the given backend.
    #[must_use]
    pub fn is_quoted_for(&self, backend: usize) -> bool {
        self.quoted_for == Some(backend)
    }

    /// Record that the host has quoted this string for the given backend.
    pub fn mark_quoted_for(&mut self, backend: usize) {
        self.quoted_for = Some(backend);
    }

    /// An untainted copy of the text, for strings a successful lookup has
    /// validated.
    #[must_use]
    pub fn untainted_copy(&self) -> Self {
        Self::untainted(self.text.clone())
    }

    /// A key for an internal probe string, inheriting this key's taint but
    /// not its quoting state.
    #[must_use]
    pub(crate) fn derive(&self, text: String) -> Self {
        Self {
            text,
            tainted: self.tainted,
            quoted_for: None,
        }
    }
}

impl From<&str> for SearchKey {
    fn from(text: &str) -> Self {
        Self::untainted(text)
    }
}
