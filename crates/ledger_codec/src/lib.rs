//! # Ledger Codec
//!
//! Value encoding for the ledger driver.
//!
//! The driver treats statement parameters and result rows as opaque
//! [`WireValue`]s. Converting between application types and wire values is
//! the job of a [`Codec`]. This crate provides:
//! - The [`Codec`] trait
//! - [`WireValue`], a cheaply clonable byte buffer
//! - [`CborCodec`], the default `serde`-based CBOR codec
//!
//! ## Usage
//!
//! ```
//! use ledger_codec::{CborCodec, Codec};
//!
//! let codec = CborCodec::new();
//! let wire = codec.encode(&("acct-1", 42u32)).unwrap();
//! let (id, amount): (String, u32) = codec.decode(&wire).unwrap();
//! assert_eq!(id, "acct-1");
//! assert_eq!(amount, 42);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod value;

pub use cbor::CborCodec;
pub use error::{CodecError, CodecResult};
pub use value::WireValue;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts native values to and from their wire representation.
pub trait Codec: Send + Sync {
    /// Encodes a native value.
    fn encode<T>(&self, value: &T) -> CodecResult<WireValue>
    where
        T: Serialize + ?Sized;

    /// Decodes a wire value into a native value.
    fn decode<T>(&self, value: &WireValue) -> CodecResult<T>
    where
        T: DeserializeOwned;
}
