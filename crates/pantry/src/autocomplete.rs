// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Prefix and next-word completion over a lexicographically ordered sorted set.
//!
//! An index stores one member per prefix of every suggestion, of the form
//! `<prefix>*<suggestion>`, all with the same score. Members of a sorted set with equal scores
//! are ordered by their bytes, so every entry for a typed prefix lies in one contiguous range
//! that a single range scan returns.
//!
//! For `pizza margherita` and a minimum prefix length of 2 the index holds:
//!
//! ```text
//! pi*pizza margherita
//! piz*pizza margherita
//! ...
//! pizza *pizza margherita
//! pizza m*pizza margherita
//! ...
//! pizza margherita*pizza margherita
//! ```

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use pantry_store::Store;
use serde::Serialize;
use uuid::Uuid;

use crate::{Error, Result};

/// Separates the prefix from the full suggestion in index entries.
///
/// Normalization removes it from suggestion text, so the first occurrence in an entry always
/// ends the prefix.
pub const SEPARATOR: char = '*';

/// Queries shorter than this many characters return no suggestions.
const MIN_QUERY_CHARS: usize = 2;

/// Raw entries fetched per requested suggestion.
const CANDIDATES_PER_RESULT: usize = 10;

/// How an index is built and queried.
///
/// # Examples
///
/// ```
/// use pantry::AutocompleteOptions;
/// use std::time::Duration;
///
/// let options = AutocompleteOptions::new()
///     .with_min_prefix_len(3)
///     .with_ttl(Duration::from_secs(3600));
///
/// assert_eq!(options.min_prefix_len(), 3);
/// assert_eq!(options.limit(), 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutocompleteOptions {
    min_prefix_len: usize,
    limit: usize,
    ttl: Option<Duration>,
}

impl Default for AutocompleteOptions {
    fn default() -> Self {
        Self {
            min_prefix_len: 2,
            limit: 10,
            ttl: None,
        }
    }
}

impl AutocompleteOptions {
    /// Creates the default options: prefixes from two characters, ten results, no expiry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the shortest indexed prefix, counted in characters.
    #[must_use]
    pub fn with_min_prefix_len(mut self, min_prefix_len: usize) -> Self {
        self.min_prefix_len = min_prefix_len;
        self
    }

    /// Sets the number of suggestions returned by [`AutocompleteIndex::search`].
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Expires the published index after `ttl`.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Returns the shortest indexed prefix.
    #[must_use]
    pub fn min_prefix_len(&self) -> usize {
        self.min_prefix_len
    }

    /// Returns the default number of suggestions.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the lifetime of the published index.
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

/// How a query was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Suggestions are complete names starting with the query.
    Full,
    /// The query ended in whitespace; the result lists the words that can follow it.
    NextWord,
}

/// The result of an autocomplete query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    /// How the query was interpreted.
    pub mode: CompletionMode,
    /// Matching suggestions in index order.
    pub suggestions: Vec<String>,
    /// In [`CompletionMode::NextWord`], the distinct words that follow the query, sorted.
    #[serde(rename = "next_words_only", skip_serializing_if = "Vec::is_empty")]
    pub next_words: Vec<String>,
    /// The normalized query.
    pub prefix: String,
}

impl Completion {
    fn full(prefix: String, suggestions: Vec<String>) -> Self {
        Self {
            mode: CompletionMode::Full,
            suggestions,
            next_words: Vec::new(),
            prefix,
        }
    }
}

/// Normalizes text for indexing and querying.
///
/// Lowercases, trims, collapses whitespace runs to one space and removes [`SEPARATOR`].
///
/// # Examples
///
/// ```
/// assert_eq!(pantry::autocomplete::normalize("  Pizza\t*MARGHERITA* "), "pizza margherita");
/// ```
#[must_use]
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .map(|word| word.replace(SEPARATOR, ""))
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns the index entries for `suggestions`, deduplicated and in index order.
fn index_entries<I>(suggestions: I, min_prefix_len: usize) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut entries = BTreeSet::new();

    for suggestion in suggestions {
        let name = normalize(suggestion.as_ref());
        if name.is_empty() {
            continue;
        }

        // Byte offsets at which each prefix of 1, 2, ... characters ends.
        let ends = name.char_indices().skip(1).map(|(at, _)| at).chain(std::iter::once(name.len()));
        for end in ends.skip(min_prefix_len.saturating_sub(1)) {
            entries.insert(format!("{}{SEPARATOR}{name}", &name[..end]));
        }
    }

    entries
}

/// A prefix and next-word completion index in a store.
///
/// [`build`](Self::build) writes a complete new index under a temporary key and renames it over
/// the live key in one atomic step, so concurrent [`search`](Self::search) calls see either the
/// old or the new index, never a mix. A failed build removes the temporary key and leaves the
/// live index untouched.
///
/// # Examples
///
/// ```
/// use pantry::{AutocompleteIndex, AutocompleteOptions, CompletionMode};
/// use pantry_store::memory::MemoryStore;
/// use std::sync::Arc;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let index = AutocompleteIndex::new(Arc::new(MemoryStore::new()), "autocomplete:products", AutocompleteOptions::new());
/// index.build(["Pizza Margherita", "Pizza Diavola"]).await?;
///
/// let completion = index.search("pizza ").await?;
/// assert_eq!(completion.mode, CompletionMode::NextWord);
/// assert_eq!(completion.next_words, ["diavola", "margherita"]);
/// # Ok::<(), pantry::Error>(())
/// # });
/// ```
pub struct AutocompleteIndex<S: Store> {
    store: Arc<S>,
    key: String,
    options: AutocompleteOptions,
}

impl<S: Store> fmt::Debug for AutocompleteIndex<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutocompleteIndex")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S: Store> AutocompleteIndex<S> {
    /// Creates a handle to the index stored at `key`.
    #[must_use]
    pub fn new(store: Arc<S>, key: impl Into<String>, options: AutocompleteOptions) -> Self {
        Self {
            store,
            key: key.into(),
            options,
        }
    }

    /// Returns the live index key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the options of this index.
    #[must_use]
    pub fn options(&self) -> &AutocompleteOptions {
        &self.options
    }

    /// Replaces the index with one built from `suggestions` and returns its entry count.
    ///
    /// Building from no usable suggestions leaves the live index untouched and returns 0, so an
    /// empty upstream listing cannot wipe out suggestions that are still being served.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexBuildFailure`] if any step fails. The temporary key is removed
    /// before returning and the previously published index is left as it was.
    pub async fn build<I>(&self, suggestions: I) -> Result<u64>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let entries: Vec<String> = index_entries(suggestions, self.options.min_prefix_len).into_iter().collect();

        if entries.is_empty() {
            tracing::warn!(autocomplete.index = %self.key, "autocomplete.empty_build_ignored");
            return Ok(0);
        }

        let temp_key = format!("{}:temp:{}", self.key, Uuid::new_v4().simple());

        match self.publish(&temp_key, &entries).await {
            Ok(()) => {
                tracing::info!(autocomplete.index = %self.key, autocomplete.entries = entries.len(), "autocomplete.built");
                Ok(entries.len() as u64)
            }
            Err(source) => {
                if let Err(e) = self.store.del(&[temp_key]).await {
                    tracing::warn!(autocomplete.index = %self.key, error = %e, "autocomplete.temp_cleanup_failed");
                }
                tracing::error!(autocomplete.index = %self.key, error = %source, "autocomplete.build_failed");
                Err(self.build_failure(source))
            }
        }
    }

    async fn publish(&self, temp_key: &str, entries: &[String]) -> pantry_store::Result<()> {
        self.store.zadd_lex(temp_key, entries).await?;

        // RENAME carries the TTL over, so the index goes live with its lifetime already set.
        if let Some(ttl) = self.options.ttl {
            self.store.expire(temp_key, ttl).await?;
        }
        self.store.rename(temp_key, &self.key).await
    }

    fn build_failure(&self, source: pantry_store::Error) -> Error {
        Error::IndexBuildFailure {
            index: self.key.clone(),
            source,
        }
    }

    /// Completes `input` with up to [`limit`](AutocompleteOptions::limit) suggestions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn search(&self, input: &str) -> Result<Completion> {
        self.search_with_limit(input, self.options.limit).await
    }

    /// Completes `input` with up to `limit` suggestions.
    ///
    /// Input ending in whitespace asks for the next word: the result is in
    /// [`CompletionMode::NextWord`] and lists the words that follow the typed words in indexed
    /// suggestions, together with one suggestion per such word. Any other input returns
    /// suggestions starting with it in [`CompletionMode::Full`]. Inputs shorter than two
    /// characters return nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn search_with_limit(&self, input: &str, limit: usize) -> Result<Completion> {
        let wants_next_word = input.ends_with(char::is_whitespace);
        let prefix = normalize(input);

        if prefix.chars().count() < MIN_QUERY_CHARS {
            return Ok(Completion::full(prefix, Vec::new()));
        }

        let scan_prefix = if wants_next_word { format!("{prefix} ") } else { prefix.clone() };
        let candidates = self
            .store
            .zrange_by_lex_prefix(&self.key, &scan_prefix, limit.saturating_mul(CANDIDATES_PER_RESULT))
            .await?;

        let mut names = distinct_names(&candidates, limit.saturating_mul(2));
        if names.is_empty() || !wants_next_word {
            names.truncate(limit);
            return Ok(Completion::full(prefix, names));
        }

        Ok(next_words(&names, prefix, limit))
    }
}

/// Extracts full names from raw entries, keeping first-seen order.
fn distinct_names(entries: &[String], cap: usize) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut names = Vec::new();

    for entry in entries {
        let Some((_, name)) = entry.split_once(SEPARATOR) else {
            continue;
        };
        if seen.insert(name) {
            names.push(name.to_owned());
            if names.len() >= cap {
                break;
            }
        }
    }
    names
}

fn next_words(names: &[String], prefix: String, limit: usize) -> Completion {
    let typed: Vec<&str> = prefix.split(' ').collect();
    let mut words = BTreeSet::new();
    let mut suggestions = Vec::new();

    for name in names {
        let tokens: Vec<&str> = name.split(' ').collect();
        if tokens.len() > typed.len() && tokens[..typed.len()] == typed[..] && words.insert(tokens[typed.len()].to_owned()) {
            suggestions.push(name.clone());
        }
    }

    suggestions.truncate(limit);
    Completion {
        mode: CompletionMode::NextWord,
        suggestions,
        next_words: words.into_iter().take(limit).collect(),
        prefix,
    }
}
