//! On-disk structures of a ZIM archive.
//!
//! ```text
//! ┌───────────────────────────────┐ 0
//! │ HEADER (80 bytes, fixed)      │
//! ├───────────────────────────────┤ mimeListPos
//! │ MIME LIST                     │
//! ├───────────────────────────────┤ urlPtrPos
//! │ URL POINTERS  [u64; articles] │
//! ├───────────────────────────────┤ titleIdxPos
//! │ TITLE INDEX   [u32; articles] │
//! ├───────────────────────────────┤ clusterPtrPos
//! │ CLUSTER PTRS  [u64; clusters] │
//! ├───────────────────────────────┤
//! │ DIRECTORY ENTRIES (URL order) │
//! ├───────────────────────────────┤
//! │ CLUSTERS                      │
//! ├───────────────────────────────┤ checksumPos
//! │ SHA-256 (32 bytes, optional)  │
//! └───────────────────────────────┘
//! ```

pub mod cluster;
pub mod dirent;
pub mod header;

/// Length of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 32;

/// Encode a mimetype list: NUL-terminated strings closed by an empty one.
pub fn encode_mime_list(mime_types: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for mime in mime_types {
        out.extend_from_slice(mime.as_bytes());
        out.push(0);
    }
    out.push(0);
    out
}

/// Decode a mimetype list, stopping at the first empty string.
///
/// Returns the list and the number of bytes consumed, or `None` if the
/// terminator is missing or a name is not UTF-8.
pub fn decode_mime_list(buf: &[u8]) -> Option<(Vec<String>, usize)> {
    let mut list = Vec::new();
    let mut pos = 0;
    loop {
        let len = buf[pos..].iter().position(|&b| b == 0)?;
        if len == 0 {
            return Some((list, pos + 1));
        }
        list.push(String::from_utf8(buf[pos..pos + len].to_vec()).ok()?);
        pos += len + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_list() {
        let list = vec!["text/html".to_string(), "image/png".to_string()];
        let encoded = encode_mime_list(&list);
        assert_eq!(encoded, b"text/html\0image/png\0\0");
        assert_eq!(decode_mime_list(&encoded), Some((list, encoded.len())));
    }

    #[test]
    fn test_empty_mime_list() {
        assert_eq!(encode_mime_list(&[]), vec![0]);
        assert_eq!(decode_mime_list(b"\0trailing"), Some((vec![], 1)));
        assert_eq!(decode_mime_list(b"text/html"), None);
    }
}
