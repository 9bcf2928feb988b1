// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured log events for cache operations.

use std::time::Duration;

use tracing::Level;

pub(crate) const CACHE_NAME: &str = "cache.name";
pub(crate) const CACHE_OPERATION_NAME: &str = "cache.operation";
pub(crate) const CACHE_ACTIVITY_NAME: &str = "cache.activity";
#[cfg(test)]
pub(crate) const CACHE_EVENT_NAME: &str = "cache.event";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheOperation {
    Get,
    Set,
    Delete,
    Invalidate,
    Refresh,
}

impl CacheOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "cache.get",
            Self::Set => "cache.set",
            Self::Delete => "cache.delete",
            Self::Invalidate => "cache.invalidate",
            Self::Refresh => "cache.refresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheActivity {
    Hit,
    Miss,
    Inserted,
    Invalidated,
    Refreshed,
    DecodeError,
    Error,
}

impl CacheActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "cache.hit",
            Self::Miss => "cache.miss",
            Self::Inserted => "cache.inserted",
            Self::Invalidated => "cache.invalidated",
            Self::Refreshed => "cache.refreshed",
            Self::DecodeError => "cache.decode_error",
            Self::Error => "cache.error",
        }
    }

    pub fn level(self) -> Level {
        match self {
            Self::Hit | Self::Miss | Self::Refreshed => Level::DEBUG,
            Self::Inserted | Self::Invalidated => Level::INFO,
            Self::DecodeError => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }
}

/// Emits one `cache.event` record.
pub(crate) fn record(cache_name: &'static str, operation: CacheOperation, activity: CacheActivity, key: &str, duration: Option<Duration>) {
    let op = operation.as_str();
    let ev = activity.as_str();
    let duration_ns = duration.map(|d| d.as_nanos());

    // Tracing level must be constant, so we use a macro to select the appropriate level.
    // Field names must match the constants above - see field_names_match_constants test.
    macro_rules! emit_event {
        ($level:ident) => {
            tracing::$level!(
                cache.name = cache_name,
                cache.operation = op,
                cache.activity = ev,
                cache.key = key,
                cache.duration_ns = ?duration_ns,
                "cache.event"
            )
        };
    }

    match activity.level() {
        Level::ERROR => emit_event!(error),
        Level::WARN => emit_event!(warn),
        Level::INFO => emit_event!(info),
        _ => emit_event!(debug),
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::LogCapture, *};

    #[test]
    fn operation_names() {
        assert_eq!(CacheOperation::Get.as_str(), "cache.get");
        assert_eq!(CacheOperation::Set.as_str(), "cache.set");
        assert_eq!(CacheOperation::Delete.as_str(), "cache.delete");
        assert_eq!(CacheOperation::Invalidate.as_str(), "cache.invalidate");
        assert_eq!(CacheOperation::Refresh.as_str(), "cache.refresh");
    }

    #[test]
    fn activity_levels() {
        assert_eq!(CacheActivity::Hit.level(), Level::DEBUG);
        assert_eq!(CacheActivity::Miss.level(), Level::DEBUG);
        assert_eq!(CacheActivity::Inserted.level(), Level::INFO);
        assert_eq!(CacheActivity::Invalidated.level(), Level::INFO);
        assert_eq!(CacheActivity::DecodeError.level(), Level::WARN);
        assert_eq!(CacheActivity::Error.level(), Level::ERROR);
    }

    #[test]
    fn field_names_match_constants() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        record(
            "catalog",
            CacheOperation::Invalidate,
            CacheActivity::Error,
            "products:all",
            Some(Duration::from_nanos(12345)),
        );

        capture.assert_contains(CACHE_NAME);
        capture.assert_contains(CACHE_OPERATION_NAME);
        capture.assert_contains(CACHE_ACTIVITY_NAME);
        capture.assert_contains(CACHE_EVENT_NAME);
        capture.assert_contains("catalog");
        capture.assert_contains("products:all");
        capture.assert_contains(CacheActivity::Error.as_str());
    }

    #[test]
    fn events_use_activity_level() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        record("cache", CacheOperation::Get, CacheActivity::Error, "k", None);
        capture.assert_contains("ERROR");

        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        record("cache", CacheOperation::Set, CacheActivity::Inserted, "k", None);
        capture.assert_contains("INFO");

        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        record("cache", CacheOperation::Get, CacheActivity::Hit, "k", None);
        capture.assert_contains("DEBUG");
    }
}
