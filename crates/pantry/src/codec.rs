// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Value encodings used by the object cache.

use serde::{Serialize, de::DeserializeOwned};

/// Compression level used for [`Codec::Compressed`] values.
const COMPRESSION_LEVEL: i32 = 3;

/// How a cached value is laid out in the store.
///
/// The encoding is not recorded alongside the value, so readers must use the same codec as the
/// writer. Reading a value with the wrong codec fails to decode, which the cache reports as a
/// miss.
///
/// # Examples
///
/// ```
/// use pantry::Codec;
///
/// let bytes = Codec::Json.encode(&vec![1, 2, 3])?;
/// assert_eq!(bytes, b"[1,2,3]");
///
/// let packed = Codec::Compressed.encode(&vec![1, 2, 3])?;
/// assert_eq!(Codec::Compressed.decode::<Vec<i32>>(&packed)?, vec![1, 2, 3]);
/// # Ok::<(), pantry::CodecError>(())
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Plain JSON text.
    #[default]
    Json,
    /// MessagePack followed by zstd compression.
    ///
    /// Structs are written as maps keyed by field name, so the payload is self-describing and
    /// untyped values such as `serde_json::Value` decode the same way they do from JSON.
    Compressed,
}

/// A failure to encode or decode a value.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The JSON encoder or decoder failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// The MessagePack encoder failed.
    #[error("msgpack: {0}")]
    Pack(#[from] rmp_serde::encode::Error),

    /// The MessagePack decoder failed.
    #[error("msgpack: {0}")]
    Unpack(#[from] rmp_serde::decode::Error),

    /// The compression stream failed.
    #[error("compression: {0}")]
    Compression(#[from] std::io::Error),
}

impl Codec {
    /// Returns `true` for [`Codec::Compressed`].
    #[must_use]
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Compressed)
    }

    /// Encodes `value` into bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn encode<T>(self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::Compressed => {
                let packed = rmp_serde::to_vec_named(value)?;
                Ok(zstd::encode_all(packed.as_slice(), COMPRESSION_LEVEL)?)
            }
        }
    }

    /// Decodes bytes previously produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are corrupt or describe a different type.
    pub fn decode<T>(self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Compressed => {
                let packed = zstd::decode_all(bytes)?;
                Ok(rmp_serde::from_slice(&packed)?)
            }
        }
    }
}
