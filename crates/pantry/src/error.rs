// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for caching and coordination operations.

use std::borrow::Cow;

use crate::codec::CodecError;

/// The result for fallible `pantry` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error boxed from a caller-supplied producer or collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error from a cache, lock, index or job operation.
///
/// Not every failure reaches the caller. Cache reads absorb [`StoreUnavailable`](Self::StoreUnavailable)
/// and [`DecodeFailure`](Self::DecodeFailure) and report a miss instead, while writes always
/// surface them. Releasing or extending a lock that is no longer owned reports `false` rather
/// than [`OwnershipLost`](Self::OwnershipLost).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The store could not complete a round trip.
    #[error("store unavailable")]
    StoreUnavailable(#[from] pantry_store::Error),

    /// A stored value could not be decoded.
    #[error("failed to decode cached value")]
    DecodeFailure(#[source] CodecError),

    /// A value could not be encoded for storage.
    #[error("failed to encode value")]
    EncodeFailure(#[source] CodecError),

    /// A blocking acquisition exhausted its retry budget.
    #[error("lock `{key}` is held by another owner")]
    LockContention {
        /// The contended lock key.
        key: String,
    },

    /// The lock record no longer carries this handle's token.
    #[error("lock `{key}` is no longer owned by this handle")]
    OwnershipLost {
        /// The lock key.
        key: String,
    },

    /// A configuration value is missing or invalid.
    #[error("invalid configuration: {0}")]
    Configuration(Cow<'static, str>),

    /// Rebuilding an autocomplete index failed; the previously published index is untouched.
    #[error("failed to build autocomplete index `{index}`")]
    IndexBuildFailure {
        /// The live index key.
        index: String,
        /// The store failure that aborted the build.
        #[source]
        source: pantry_store::Error,
    },

    /// A value producer or upstream collaborator failed.
    #[error("upstream failure")]
    Upstream(#[source] BoxError),
}

impl Error {
    /// Creates a configuration error from a message.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wraps a collaborator failure.
    pub fn upstream(error: impl Into<BoxError>) -> Self {
        Self::Upstream(error.into())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Error: Send, Sync, std::error::Error);
    }

    #[test]
    fn store_errors_convert() {
        let error: Error = pantry_store::Error::from_message("connection reset").into();

        assert!(matches!(error, Error::StoreUnavailable(_)));
        assert_eq!(error.source().map(ToString::to_string).as_deref(), Some("connection reset"));
    }

    #[test]
    fn display_names_the_key() {
        let error = Error::LockContention { key: "lock:job".to_owned() };
        assert_eq!(error.to_string(), "lock `lock:job` is held by another owner");

        let error = Error::configuration("lock ttl must be positive");
        assert_eq!(error.to_string(), "invalid configuration: lock ttl must be positive");
    }

    #[test]
    fn upstream_keeps_source() {
        let error = Error::upstream("catalog timed out");
        assert_eq!(error.source().map(ToString::to_string).as_deref(), Some("catalog timed out"));
    }
}
