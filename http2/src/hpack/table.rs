//! HPACK static and dynamic indexing tables.

use std::collections::VecDeque;

/// A header name/value pair as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Table-entry size per RFC 7541 Section 4.1.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// The 61-entry static table (RFC 7541 Appendix A).
///
/// Index 1 is the first entry; index 0 is never used on the wire.
static STATIC_ENTRIES: &[(&[u8], &[u8])] = &[
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// Lookups against the static table.
pub struct StaticTable;

impl StaticTable {
    /// Number of static entries.
    pub const LEN: usize = 61;

    /// Entry at a 1-based static index.
    pub fn get(index: usize) -> Option<(&'static [u8], &'static [u8])> {
        if index == 0 || index > Self::LEN {
            return None;
        }
        Some(STATIC_ENTRIES[index - 1])
    }

    /// Find a field. Returns `(index, exact)` where `exact` means the
    /// value matched too; otherwise the index is a name-only match.
    pub fn find(name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_match = None;
        for (i, (n, v)) in STATIC_ENTRIES.iter().enumerate() {
            if *n == name {
                if *v == value {
                    return Some((i + 1, true));
                }
                if name_match.is_none() {
                    name_match = Some(i + 1);
                }
            }
        }
        name_match.map(|i| (i, false))
    }
}

/// The dynamic table shared by one direction of a connection.
///
/// Entries are addressed with indices starting right after the static
/// table: the most recently inserted entry is index 62.
#[derive(Debug)]
pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Resize the table, evicting oldest entries as needed.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    /// Insert a field at the front, evicting from the back.
    ///
    /// A field larger than the whole table empties it (RFC 7541 §4.4).
    pub fn insert(&mut self, field: HeaderField) {
        let field_size = field.size();
        if field_size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.size += field_size;
        self.entries.push_front(field);
        self.evict();
    }

    /// Entry at a combined index (static indices pass through `None`).
    pub fn get(&self, index: usize) -> Option<&HeaderField> {
        index
            .checked_sub(StaticTable::LEN + 1)
            .and_then(|i| self.entries.get(i))
    }

    /// Find a field; same contract as [`StaticTable::find`], with
    /// combined indices.
    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_match = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name == name {
                let index = StaticTable::LEN + 1 + i;
                if entry.value == value {
                    return Some((index, true));
                }
                if name_match.is_none() {
                    name_match = Some(index);
                }
            }
        }
        name_match.map(|i| (i, false))
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            if let Some(evicted) = self.entries.pop_back() {
                self.size -= evicted.size();
            } else {
                self.size = 0;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_bounds() {
        assert!(StaticTable::get(0).is_none());
        assert_eq!(StaticTable::get(1), Some((&b":authority"[..], &b""[..])));
        assert_eq!(StaticTable::get(2), Some((&b":method"[..], &b"GET"[..])));
        assert_eq!(
            StaticTable::get(61),
            Some((&b"www-authenticate"[..], &b""[..]))
        );
        assert!(StaticTable::get(62).is_none());
    }

    #[test]
    fn static_find_exact_and_name_only() {
        assert_eq!(StaticTable::find(b":method", b"GET"), Some((2, true)));
        assert_eq!(StaticTable::find(b":method", b"PUT"), Some((2, false)));
        assert_eq!(StaticTable::find(b"x-custom", b"v"), None);
    }

    #[test]
    fn field_size_includes_overhead() {
        let field = HeaderField::new("a", "bc");
        assert_eq!(field.size(), 1 + 2 + 32);
    }

    #[test]
    fn dynamic_insert_and_get() {
        let mut table = DynamicTable::new(4096);
        table.insert(HeaderField::new("x-a", "1"));
        table.insert(HeaderField::new("x-b", "2"));

        // Most recent entry is index 62.
        assert_eq!(table.get(62).unwrap().name, b"x-b");
        assert_eq!(table.get(63).unwrap().name, b"x-a");
        assert!(table.get(64).is_none());
        assert!(table.get(61).is_none()); // static range
    }

    #[test]
    fn dynamic_eviction_on_overflow() {
        // Each entry is 32 + 3 + 1 = 36 bytes; room for two.
        let mut table = DynamicTable::new(72);
        table.insert(HeaderField::new("x-a", "1"));
        table.insert(HeaderField::new("x-b", "2"));
        table.insert(HeaderField::new("x-c", "3"));

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(62).unwrap().name, b"x-c");
        assert_eq!(table.get(63).unwrap().name, b"x-b");
    }

    #[test]
    fn oversized_entry_clears_table() {
        let mut table = DynamicTable::new(40);
        table.insert(HeaderField::new("a", "b"));
        assert_eq!(table.len(), 1);
        table.insert(HeaderField::new("long-name", "long-long-value"));
        assert!(table.is_empty());
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn resize_evicts() {
        let mut table = DynamicTable::new(4096);
        table.insert(HeaderField::new("x-a", "1"));
        table.insert(HeaderField::new("x-b", "2"));
        table.set_max_size(36);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(62).unwrap().name, b"x-b");
    }

    #[test]
    fn dynamic_find() {
        let mut table = DynamicTable::new(4096);
        table.insert(HeaderField::new("x-a", "1"));
        assert_eq!(table.find(b"x-a", b"1"), Some((62, true)));
        assert_eq!(table.find(b"x-a", b"2"), Some((62, false)));
        assert_eq!(table.find(b"x-b", b"1"), None);
    }
}
