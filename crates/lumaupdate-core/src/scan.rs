//! Linear marker search over raw payload bytes
//!
//! Payloads embed their strings either as plain ASCII or as UTF-16LE where
//! every character is followed by a zero byte. Both are found with the same
//! single-pass search: a partial-match cursor advances on every matching
//! unit and is reset to zero on a mismatch.

/// How the needle is laid out in the haystack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// One byte per character
    Ascii,
    /// One byte per character followed by a zero byte
    Utf16Ascii,
}

impl Encoding {
    fn unit_len(self) -> usize {
        match self {
            Encoding::Ascii => 1,
            Encoding::Utf16Ascii => 2,
        }
    }
}

/// Find the offset where the first occurrence of `needle` begins.
///
/// After a mismatch the cursor is reset and the same byte is tried again as a
/// potential first character, so every offset is visited at most twice.
pub fn find(haystack: &[u8], needle: &[u8], encoding: Encoding) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }

    let step = encoding.unit_len();
    let mut cursor = 0;
    let mut start = 0;
    let mut offset = 0;

    while offset + step <= haystack.len() {
        let matches = haystack[offset] == needle[cursor]
            && (encoding == Encoding::Ascii || haystack[offset + 1] == 0);

        if matches {
            if cursor == 0 {
                start = offset;
            }
            cursor += 1;
            if cursor == needle.len() {
                return Some(start);
            }
            offset += step;
            continue;
        }

        if cursor > 0 {
            cursor = 0;
            continue;
        }
        offset += 1;
    }

    None
}
