//! Opaque wire value.

use bytes::Bytes;
use std::fmt;

/// A value in its wire representation.
///
/// The driver never inspects the contents of a `WireValue`; it only moves
/// them between the codec, the communicator, and the commit digest. Cloning
/// is cheap (reference counted), which matters for buffered cursors and
/// retried statements.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct WireValue(Bytes);

impl WireValue {
    /// Creates a wire value from raw bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Creates a wire value by copying a byte slice.
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the encoded length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the value carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the value and returns the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WireValue(")?;
        for byte in self.0.iter().take(16) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 16 {
            write!(f, "..+{}", self.0.len() - 16)?;
        }
        write!(f, ")")
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for WireValue {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for WireValue {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
