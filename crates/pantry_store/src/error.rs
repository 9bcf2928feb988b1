// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for store operations.

use std::borrow::Cow;

/// The result for fallible store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error from a store operation.
///
/// Every failure to complete a round trip is reported through this type: connection loss,
/// protocol errors, server-side rejections (for example renaming a key that does not exist)
/// and injected test failures. Callers that need to distinguish causes can inspect
/// [`Error::kind`].
///
/// # Examples
///
/// ```
/// use pantry_store::Error;
///
/// let error = Error::from_message("connection reset");
/// assert_eq!(error.to_string(), "connection reset");
/// ```
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error(#[from] ErrorKind);

/// The underlying cause of an [`Error`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The Redis client reported a failure.
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),

    /// The server or backend rejected the command.
    #[error("{0}")]
    Rejected(Cow<'static, str>),
}

impl Error {
    /// Creates an error from a plain message.
    pub fn from_message(message: impl Into<Cow<'static, str>>) -> Self {
        Self(ErrorKind::Rejected(message.into()))
    }

    /// Returns the underlying cause.
    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

#[cfg(feature = "redis")]
impl From<::redis::RedisError> for Error {
    fn from(error: ::redis::RedisError) -> Self {
        Self(ErrorKind::Redis(error))
    }
}
