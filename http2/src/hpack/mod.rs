//! HPACK header compression (RFC 7541).
//!
//! - A static table of 61 common header fields
//! - A dynamic table of recently used fields with size-based eviction
//! - Variable-length integer encoding with bit prefixes
//! - Huffman coding for string literals (optional on encode)

mod decode;
mod encode;
mod huffman;
mod table;

pub use decode::{HpackDecoder, HpackError};
pub use encode::HpackEncoder;
pub use table::{DynamicTable, HeaderField, StaticTable};

/// Default dynamic table size (RFC 7541 Section 4.2).
pub const DEFAULT_TABLE_SIZE: usize = 4096;
