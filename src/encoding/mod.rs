//! Serialization layer: order-preserving key encoding.

pub mod key;

pub use key::{decode_key, encoded_key_len, key_prefix, KeyEncoder};
