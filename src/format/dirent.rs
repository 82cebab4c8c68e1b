//! Directory entries: one per archived item, stored in URL order.

/// Mimetype slot value marking a redirect entry.
pub const REDIRECT_MIMETYPE: u16 = 0xFFFF;

/// Where an entry's payload lives, or which entry it redirects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Blob `blob` inside cluster `cluster`.
    Blob { cluster: u32, blob: u32 },
    /// URL-order index of the redirect target.
    Redirect(u32),
}

/// In-memory directory entry, before it is serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub namespace: char,
    pub url: String,
    pub title: String,
    /// Index into the mimetype list; unused for redirects.
    pub mime_index: u16,
    pub target: Target,
}

impl DirEntry {
    /// Title used for ordering; an entry without a title sorts by its url.
    pub fn sort_title(&self) -> &str {
        if self.title.is_empty() {
            &self.url
        } else {
            &self.title
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.target, Target::Redirect(_))
    }

    /// Serialized length in bytes.
    pub fn encoded_len(&self) -> usize {
        let fixed = match self.target {
            Target::Blob { .. } => 16,
            Target::Redirect(_) => 12,
        };
        fixed + self.url.len() + 1 + self.stored_title().len() + 1
    }

    /// Append the wire form of this entry to `out`.
    ///
    /// Layout: mimetype u16, parameter length u8 (always 0), namespace u8,
    /// revision u32, then either cluster u32 + blob u32 or redirect index
    /// u32, then url and title, each NUL-terminated.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mime = match self.target {
            Target::Blob { .. } => self.mime_index,
            Target::Redirect(_) => REDIRECT_MIMETYPE,
        };
        out.extend_from_slice(&mime.to_le_bytes());
        out.push(0);
        out.push(self.namespace as u8);
        out.extend_from_slice(&0u32.to_le_bytes());
        match self.target {
            Target::Blob { cluster, blob } => {
                out.extend_from_slice(&cluster.to_le_bytes());
                out.extend_from_slice(&blob.to_le_bytes());
            }
            Target::Redirect(index) => out.extend_from_slice(&index.to_le_bytes()),
        }
        out.extend_from_slice(self.url.as_bytes());
        out.push(0);
        out.extend_from_slice(self.stored_title().as_bytes());
        out.push(0);
    }

    /// Parse an entry from the start of `buf`. An empty stored title is
    /// reported as the url.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let read_u32 = |at: usize| -> Option<u32> {
            Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
        };
        let mime = u16::from_le_bytes(buf.get(0..2)?.try_into().ok()?);
        let parameter_len = *buf.get(2)? as usize;
        let namespace = *buf.get(3)? as char;
        let (target, strings_at) = if mime == REDIRECT_MIMETYPE {
            (Target::Redirect(read_u32(8)?), 12)
        } else {
            let cluster = read_u32(8)?;
            let blob = read_u32(12)?;
            (Target::Blob { cluster, blob }, 16)
        };

        let rest = buf.get(strings_at..)?;
        let url_len = rest.iter().position(|&b| b == 0)?;
        let url = std::str::from_utf8(&rest[..url_len]).ok()?.to_string();
        let rest = &rest[url_len + 1..];
        let title_len = rest.iter().position(|&b| b == 0)?;
        let title = std::str::from_utf8(&rest[..title_len]).ok()?.to_string();
        // Extra parameter bytes follow the title; they only need to exist.
        rest.get(title_len + 1..title_len + 1 + parameter_len)?;

        Some(Self {
            namespace,
            title: if title.is_empty() { url.clone() } else { title },
            url,
            mime_index: if mime == REDIRECT_MIMETYPE { 0 } else { mime },
            target,
        })
    }

    /// Titles equal to the url are stored empty.
    fn stored_title(&self) -> &str {
        if self.title == self.url {
            ""
        } else {
            &self.title
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_blob_entry() {
        let entry = DirEntry {
            namespace: 'A',
            url: "Home".into(),
            title: "Welcome".into(),
            mime_index: 2,
            target: Target::Blob {
                cluster: 1,
                blob: 7,
            },
        };
        let mut out = Vec::new();
        entry.encode(&mut out);
        assert_eq!(out.len(), entry.encoded_len());
        assert_eq!(&out[0..2], &[2, 0]);
        assert_eq!(out[3], b'A');
        assert_eq!(&out[8..12], &[1, 0, 0, 0]);
        assert_eq!(&out[12..16], &[7, 0, 0, 0]);
        assert_eq!(&out[16..], b"Home\0Welcome\0");
    }

    #[test]
    fn test_encode_redirect_with_url_title() {
        let entry = DirEntry {
            namespace: 'A',
            url: "Old".into(),
            title: "Old".into(),
            mime_index: 0,
            target: Target::Redirect(3),
        };
        let mut out = Vec::new();
        entry.encode(&mut out);
        assert_eq!(out.len(), entry.encoded_len());
        assert_eq!(&out[0..2], &[0xFF, 0xFF]);
        assert_eq!(&out[8..12], &[3, 0, 0, 0]);
        assert_eq!(&out[12..], b"Old\0\0");
        assert!(entry.is_redirect());
    }

    #[test]
    fn test_decode_matches_encode() {
        let entry = DirEntry {
            namespace: 'I',
            url: "img/logo.png".into(),
            title: "Logo".into(),
            mime_index: 4,
            target: Target::Blob {
                cluster: 9,
                blob: 0,
            },
        };
        let mut out = Vec::new();
        entry.encode(&mut out);
        out.extend_from_slice(b"next entry");
        assert_eq!(DirEntry::decode(&out), Some(entry));
        assert_eq!(DirEntry::decode(&out[..10]), None);
    }

    #[test]
    fn test_decode_restores_url_title() {
        let mut out = Vec::new();
        DirEntry {
            namespace: 'A',
            url: "Old".into(),
            title: "Old".into(),
            mime_index: 0,
            target: Target::Redirect(1),
        }
        .encode(&mut out);
        let decoded = DirEntry::decode(&out).unwrap();
        assert_eq!(decoded.title, "Old");
        assert_eq!(decoded.target, Target::Redirect(1));
    }

    #[test]
    fn test_sort_title_falls_back_to_url() {
        let entry = DirEntry {
            namespace: 'A',
            url: "b".into(),
            title: String::new(),
            mime_index: 0,
            target: Target::Redirect(0),
        };
        assert_eq!(entry.sort_title(), "b");
    }
}
