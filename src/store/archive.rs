//! Read access to a finished archive.
//!
//! Every region the header points to is bounds-checked at open time, so the
//! accessors below only fail on I/O errors or corrupt entries.

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{FormatError, Result, ZimError};
use crate::format::cluster;
use crate::format::dirent::{DirEntry, Target};
use crate::format::header::{Fileheader, HEADER_SIZE};
use crate::format::{decode_mime_list, CHECKSUM_SIZE};
use crate::store::part::MultiPart;

/// Upper bound on the mimetype list read at open time.
const MAX_MIME_LIST_LEN: u64 = 64 * 1024;

/// Chunk size used while hashing the archive body.
const HASH_CHUNK: usize = 1024 * 1024;

/// Outcome of [`Archive::verify_checksum`] when the archive is not corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// The stored digest matches the archive body.
    Valid,
    /// The archive was written without a checksum.
    Missing,
}

/// An opened archive, single- or multi-part.
#[derive(Debug)]
pub struct Archive {
    parts: MultiPart,
    header: Fileheader,
    mime_types: Vec<String>,
}

impl Archive {
    /// Open and validate the archive at `path` (or its `aa`, `ab`, ... parts).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let parts = MultiPart::open(path)?;
        let size = parts.len();

        if size < HEADER_SIZE as u64 {
            return Err(FormatError::Truncated {
                found: size as usize,
                expected: HEADER_SIZE,
            }
            .into());
        }
        let mut buf = [0u8; HEADER_SIZE];
        parts.read_at(0, &mut buf)?;
        let header = Fileheader::parse(&buf)?;
        check_bounds(&header, size)?;

        let mime_list_pos = header.mime_list_pos();
        let mime_end = [
            header.url_ptr_pos(),
            header.title_idx_pos(),
            header.cluster_ptr_pos(),
        ]
        .into_iter()
        .filter(|&pos| pos > mime_list_pos)
        .min()
        .unwrap_or(size)
        .min(size)
        .min(mime_list_pos + MAX_MIME_LIST_LEN);
        let mut raw = vec![0u8; (mime_end - mime_list_pos) as usize];
        parts.read_at(mime_list_pos, &mut raw)?;
        let (mime_types, _) = decode_mime_list(&raw).ok_or(FormatError::MimeList {
            offset: mime_list_pos,
        })?;

        info!(
            path = %path.display(),
            articles = header.article_count(),
            clusters = header.cluster_count(),
            size,
            "Opened archive"
        );
        Ok(Self {
            parts,
            header,
            mime_types,
        })
    }

    pub fn header(&self) -> &Fileheader {
        &self.header
    }

    pub fn mime_types(&self) -> &[String] {
        &self.mime_types
    }

    /// Total archive size across all parts.
    pub fn size(&self) -> u64 {
        self.parts.len()
    }

    pub fn part_count(&self) -> usize {
        self.parts.parts().len()
    }

    pub fn article_count(&self) -> u32 {
        self.header.article_count()
    }

    pub fn cluster_count(&self) -> u32 {
        self.header.cluster_count()
    }

    /// File offset of the directory entry at URL position `index`.
    pub fn url_pointer(&self, index: u32) -> Result<u64> {
        self.check_index("url pointer", index, self.article_count())?;
        self.read_u64(self.header.url_ptr_pos() + 8 * index as u64)
    }

    /// URL position of the entry at title position `index`.
    pub fn title_index(&self, index: u32) -> Result<u32> {
        self.check_index("title index", index, self.article_count())?;
        let mut buf = [0u8; 4];
        self.parts
            .read_at(self.header.title_idx_pos() + 4 * index as u64, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// File offset of cluster `index`.
    pub fn cluster_offset(&self, index: u32) -> Result<u64> {
        self.check_index("cluster pointer", index, self.cluster_count())?;
        self.read_u64(self.header.cluster_ptr_pos() + 8 * index as u64)
    }

    /// Directory entry at URL position `index`.
    pub fn entry(&self, index: u32) -> Result<DirEntry> {
        let start = self.url_pointer(index)?;
        let end = if index + 1 < self.article_count() {
            self.url_pointer(index + 1)?
        } else if self.cluster_count() > 0 {
            self.cluster_offset(0)?
        } else {
            self.body_end()
        };
        let len = self.region_len("directory entry", start, end)?;
        let mut buf = vec![0u8; len];
        self.parts.read_at(start, &mut buf)?;
        DirEntry::decode(&buf).ok_or_else(|| corrupt("directory entry", start))
    }

    /// Directory entry at title position `index`.
    pub fn entry_by_title(&self, index: u32) -> Result<DirEntry> {
        self.entry(self.title_index(index)?)
    }

    /// Binary search the URL index for `namespace`/`url`.
    pub fn find(&self, namespace: char, url: &str) -> Result<Option<u32>> {
        let (mut lo, mut hi) = (0u32, self.article_count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.entry(mid)?;
            match (entry.namespace, entry.url.as_str()).cmp(&(namespace, url)) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Some(mid)),
            }
        }
        Ok(None)
    }

    /// All blobs of cluster `index`, decompressed.
    pub fn cluster_blobs(&self, index: u32) -> Result<Vec<Vec<u8>>> {
        let start = self.cluster_offset(index)?;
        let end = if index + 1 < self.cluster_count() {
            self.cluster_offset(index + 1)?
        } else {
            self.body_end()
        };
        let len = self.region_len("cluster", start, end)?;
        let mut raw = vec![0u8; len];
        self.parts.read_at(start, &mut raw)?;
        debug!(cluster = index, offset = start, bytes = len, "Reading cluster");
        cluster::decode(&raw).map_err(|_| corrupt("cluster", start))
    }

    /// Payload of the entry at URL position `index`, following redirects.
    pub fn content(&self, index: u32) -> Result<Vec<u8>> {
        let mut current = index;
        // A chain longer than the entry count must revisit an entry.
        for _ in 0..=self.article_count() {
            let entry = self.entry(current)?;
            match entry.target {
                Target::Redirect(next) => current = next,
                Target::Blob { cluster, blob } => {
                    let offset = self.url_pointer(current)?;
                    let mut blobs = self.cluster_blobs(cluster)?;
                    let blob = blob as usize;
                    if blob >= blobs.len() {
                        return Err(corrupt("blob number", offset));
                    }
                    return Ok(blobs.swap_remove(blob));
                }
            }
        }
        Err(corrupt("redirect chain", self.url_pointer(index)?))
    }

    /// Mimetype of a content entry.
    pub fn mime_type(&self, entry: &DirEntry) -> Option<&str> {
        if entry.is_redirect() {
            return None;
        }
        self.mime_types
            .get(entry.mime_index as usize)
            .map(String::as_str)
    }

    /// Recompute the SHA-256 of `[HEADER_SIZE, checksumPos)` and compare it
    /// with the stored digest.
    pub fn verify_checksum(&self) -> Result<ChecksumStatus> {
        let Some(checksum_pos) = self.header.checksum_pos() else {
            return Ok(ChecksumStatus::Missing);
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK];
        let mut pos = HEADER_SIZE as u64;
        while pos < checksum_pos {
            let take = ((checksum_pos - pos) as usize).min(HASH_CHUNK);
            self.parts.read_at(pos, &mut buf[..take])?;
            hasher.update(&buf[..take]);
            pos += take as u64;
        }

        let mut stored = [0u8; CHECKSUM_SIZE];
        self.parts.read_at(checksum_pos, &mut stored)?;
        let computed: [u8; CHECKSUM_SIZE] = hasher.finalize().into();
        if computed != stored {
            return Err(FormatError::ChecksumMismatch {
                offset: checksum_pos,
            }
            .into());
        }
        Ok(ChecksumStatus::Valid)
    }

    /// End of the directory and cluster data.
    fn body_end(&self) -> u64 {
        self.header.checksum_pos().unwrap_or(self.size())
    }

    fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.parts.read_at(offset, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    fn check_index(&self, field: &'static str, index: u32, count: u32) -> Result<()> {
        if index >= count {
            return Err(FormatError::OffsetOutOfBounds {
                field,
                offset: index as u64,
                size: count as u64,
            }
            .into());
        }
        Ok(())
    }

    fn region_len(&self, field: &'static str, start: u64, end: u64) -> Result<usize> {
        if start >= end || end > self.size() {
            return Err(FormatError::OffsetOutOfBounds {
                field,
                offset: start,
                size: self.size(),
            }
            .into());
        }
        usize::try_from(end - start).map_err(|_| corrupt(field, start))
    }
}

/// Every table the header points to must fit inside the archive.
fn check_bounds(header: &Fileheader, size: u64) -> std::result::Result<(), FormatError> {
    let articles = header.article_count() as u64;
    let clusters = header.cluster_count() as u64;
    let regions = [
        ("mimeListPos", header.mime_list_pos(), 1),
        ("urlPtrPos", header.url_ptr_pos(), 8 * articles),
        ("titleIdxPos", header.title_idx_pos(), 4 * articles),
        ("clusterPtrPos", header.cluster_ptr_pos(), 8 * clusters),
        (
            "checksumPos",
            header.checksum_pos().unwrap_or(0),
            if header.checksum_pos().is_some() {
                CHECKSUM_SIZE as u64
            } else {
                0
            },
        ),
    ];
    for (field, offset, len) in regions {
        if len > 0 && offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(FormatError::OffsetOutOfBounds {
                field,
                offset,
                size,
            });
        }
    }
    Ok(())
}

fn corrupt(what: &'static str, offset: u64) -> ZimError {
    FormatError::Corrupt { what, offset }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::header::HeaderBuilder;

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_short_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "short.zim", &[0x5A; 40]);
        match Archive::open(&path) {
            Err(ZimError::Format(e)) => {
                assert_eq!(e.rule(), "header-size");
                assert_eq!(
                    e,
                    FormatError::Truncated {
                        found: 40,
                        expected: HEADER_SIZE
                    }
                );
            }
            other => panic!("expected truncated header, got {other:?}"),
        }
    }

    #[test]
    fn test_pointer_past_end_rejected() {
        let header = HeaderBuilder::new()
            .uuid([1; 16])
            .article_count(4)
            .cluster_count(1)
            .mime_list_pos(80)
            .url_ptr_pos(81)
            .title_idx_pos(113)
            .cluster_ptr_pos(129)
            .finalize()
            .unwrap();
        let mut bytes = header.serialize().to_vec();
        bytes.push(0);
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bad.zim", &bytes);
        match Archive::open(&path) {
            Err(ZimError::Format(FormatError::OffsetOutOfBounds { field, .. })) => {
                assert_eq!(field, "urlPtrPos")
            }
            other => panic!("expected bounds error, got {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_mime_list() {
        let header = HeaderBuilder::new()
            .uuid([1; 16])
            .article_count(0)
            .cluster_count(0)
            .mime_list_pos(80)
            .url_ptr_pos(90)
            .title_idx_pos(90)
            .cluster_ptr_pos(90)
            .finalize()
            .unwrap();
        let mut bytes = header.serialize().to_vec();
        bytes.extend_from_slice(b"text/html\0");
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "mime.zim", &bytes);
        assert!(matches!(
            Archive::open(&path),
            Err(ZimError::Format(FormatError::MimeList { offset: 80 }))
        ));
    }
}
