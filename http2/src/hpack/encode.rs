//! HPACK header block encoding.

use super::huffman;
use super::table::{DynamicTable, HeaderField, StaticTable};
use super::DEFAULT_TABLE_SIZE;

/// Encodes header lists into HPACK header blocks.
///
/// Fields found in the static or dynamic table are emitted as indexed
/// representations; everything else is emitted as a literal with
/// incremental indexing so repeated headers compress on later requests.
pub struct HpackEncoder {
    table: DynamicTable,
    use_huffman: bool,
    /// Pending table-size update to emit at the start of the next block.
    pending_resize: Option<usize>,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self::with_table_size(DEFAULT_TABLE_SIZE)
    }

    pub fn with_table_size(size: usize) -> Self {
        Self {
            table: DynamicTable::new(size),
            use_huffman: true,
            pending_resize: None,
        }
    }

    /// Enable or disable Huffman coding of string literals.
    pub fn set_huffman(&mut self, use_huffman: bool) {
        self.use_huffman = use_huffman;
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. The dynamic table
    /// size update is signaled in the next encoded block.
    pub fn set_table_size(&mut self, size: usize) {
        self.table.set_max_size(size);
        self.pending_resize = Some(size);
    }

    /// Encode a complete header list into `out`.
    pub fn encode(&mut self, headers: &[HeaderField], out: &mut Vec<u8>) {
        if let Some(size) = self.pending_resize.take() {
            // Dynamic table size update: '001' prefix, 5-bit integer.
            encode_integer(size as u64, 5, 0x20, out);
        }

        for field in headers {
            self.encode_field(field, out);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, out: &mut Vec<u8>) {
        let found = StaticTable::find(&field.name, &field.value).map_or_else(
            || self.table.find(&field.name, &field.value),
            |(index, exact)| {
                if exact {
                    Some((index, true))
                } else {
                    // Prefer an exact dynamic match over a static name match.
                    match self.table.find(&field.name, &field.value) {
                        Some((dynamic_index, true)) => Some((dynamic_index, true)),
                        _ => Some((index, false)),
                    }
                }
            },
        );

        match found {
            Some((index, true)) => {
                // Indexed field: '1' prefix, 7-bit index.
                encode_integer(index as u64, 7, 0x80, out);
            }
            Some((index, false)) => {
                // Literal with incremental indexing, indexed name:
                // '01' prefix, 6-bit index.
                encode_integer(index as u64, 6, 0x40, out);
                self.encode_string(&field.value, out);
                self.table.insert(field.clone());
            }
            None => {
                // Literal with incremental indexing, new name.
                out.push(0x40);
                self.encode_string(&field.name, out);
                self.encode_string(&field.value, out);
                self.table.insert(field.clone());
            }
        }
    }

    fn encode_string(&self, data: &[u8], out: &mut Vec<u8>) {
        if self.use_huffman {
            let coded_len = huffman::encoded_len(data);
            if coded_len < data.len() {
                encode_integer(coded_len as u64, 7, 0x80, out);
                huffman::encode(data, out);
                return;
            }
        }
        encode_integer(data.len() as u64, 7, 0x00, out);
        out.extend_from_slice(data);
    }
}

/// Encode an integer with an N-bit prefix (RFC 7541 Section 5.1).
/// `first_byte` carries the representation's flag bits.
fn encode_integer(value: u64, prefix_bits: u8, first_byte: u8, out: &mut Vec<u8>) {
    let limit = (1u64 << prefix_bits) - 1;
    if value < limit {
        out.push(first_byte | value as u8);
        return;
    }

    out.push(first_byte | limit as u8);
    let mut rest = value - limit;
    while rest >= 128 {
        out.push((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    out.push(rest as u8);
}
