//! Physical file segments of single- and multi-part archives.
//!
//! A split archive `wiki.zim` is stored as `wiki.zimaa`, `wiki.zimab`, ...
//! and read as the concatenation of those parts.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, Result, ZimError};

/// Number of distinct two-letter part suffixes (`aa` through `zz`).
pub const MAX_PARTS: usize = 26 * 26;

/// One opened segment file and its length at open time.
///
/// Opening and being empty are separate outcomes: a missing or unreadable
/// file fails [`FilePart::open`], while an existing zero-byte file opens
/// fine and reports `healthy() == false`.
#[derive(Debug)]
pub struct FilePart {
    path: PathBuf,
    file: File,
    len: u64,
}

impl FilePart {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| ZimError::io(&path, e))?;
        let len = file.metadata().map_err(|e| ZimError::io(&path, e))?.len();
        Ok(Self { path, file, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Same as `!healthy()`.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A segment is usable only if it holds at least one byte.
    pub fn healthy(&self) -> bool {
        self.len > 0
    }
}

/// Two-letter suffix of part number `n`: `aa`, `ab`, ..., `zz`.
pub fn part_suffix(n: usize) -> Option<String> {
    if n >= MAX_PARTS {
        return None;
    }
    let first = (b'a' + (n / 26) as u8) as char;
    let second = (b'a' + (n % 26) as u8) as char;
    Some(format!("{first}{second}"))
}

/// Path of part `n` of the archive at `base`.
pub fn part_path(base: &Path, n: usize) -> Option<PathBuf> {
    let suffix = part_suffix(n)?;
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    Some(PathBuf::from(name))
}

/// An archive seen as one address space over its parts.
#[derive(Debug)]
pub struct MultiPart {
    parts: Vec<FilePart>,
    /// Logical start offset of every part.
    starts: Vec<u64>,
    len: u64,
}

impl MultiPart {
    /// Open `base` directly, or its `aa`, `ab`, ... parts if `base` is absent.
    ///
    /// Every part must be non-empty; an empty segment would make the part
    /// numbering ambiguous.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        let paths: Vec<PathBuf> = if base.is_file() {
            vec![base.to_path_buf()]
        } else {
            (0..MAX_PARTS)
                .map_while(|n| part_path(base, n).filter(|p| p.is_file()))
                .collect()
        };
        if paths.is_empty() {
            return Err(ZimError::io(
                base,
                std::io::Error::new(std::io::ErrorKind::NotFound, "archive not found"),
            ));
        }

        let mut parts = Vec::with_capacity(paths.len());
        let mut starts = Vec::with_capacity(paths.len());
        let mut len = 0u64;
        for path in paths {
            let part = FilePart::open(&path)?;
            if !part.healthy() {
                return Err(ZimError::io(
                    &path,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "empty archive part"),
                ));
            }
            debug!(path = %path.display(), len = part.len(), "Opened part");
            starts.push(len);
            len += part.len();
            parts.push(part);
        }
        Ok(Self { parts, starts, len })
    }

    pub fn parts(&self) -> &[FilePart] {
        &self.parts
    }

    /// Total length of all parts.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill `buf` from logical offset `offset`, crossing part boundaries as needed.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(buf.len() as u64);
        if end.is_none_or(|end| end > self.len) {
            return Err(ZimError::io(
                self.parts[0].path(),
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {offset} past end ({})", buf.len(), self.len),
                ),
            ));
        }

        // Last part starting at or before `offset`.
        let mut index = self.starts.partition_point(|&s| s <= offset).saturating_sub(1);
        let mut pos = offset;
        let mut filled = 0;
        while filled < buf.len() {
            let part = &self.parts[index];
            let within = pos - self.starts[index];
            let take = ((part.len() - within) as usize).min(buf.len() - filled);
            let mut file = part.file();
            file.seek(SeekFrom::Start(within))
                .and_then(|_| file.read_exact(&mut buf[filled..filled + take]))
                .map_err(|e| ZimError::io(part.path(), e))?;
            filled += take;
            pos += take as u64;
            index += 1;
        }
        Ok(())
    }
}

/// Split the archive at `path` into parts of at most `part_size` bytes.
///
/// Returns the paths written. The original file is left untouched.
pub fn split_archive(path: impl AsRef<Path>, part_size: u64) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if part_size == 0 {
        return Err(ConfigError::InvalidSplitSize(part_size).into());
    }
    let source = FilePart::open(path)?;
    let needed = source.len().div_ceil(part_size).max(1);
    if needed > MAX_PARTS as u64 {
        return Err(ConfigError::InvalidSplitSize(part_size).into());
    }

    let mut reader = BufReader::new(source.file());
    let mut written = Vec::with_capacity(needed as usize);
    for n in 0..needed as usize {
        let Some(part) = part_path(path, n) else {
            break;
        };
        let file = File::create(&part).map_err(|e| ZimError::io(&part, e))?;
        let mut out = BufWriter::new(file);
        let copied = std::io::copy(&mut (&mut reader).take(part_size), &mut out)
            .map_err(|e| ZimError::io(path, e))?;
        out.flush().map_err(|e| ZimError::io(&part, e))?;
        debug!(part = %part.display(), bytes = copied, "Wrote part");
        written.push(part);
    }
    info!(path = %path.display(), parts = written.len(), "Archive split");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_suffix() {
        assert_eq!(part_suffix(0).as_deref(), Some("aa"));
        assert_eq!(part_suffix(1).as_deref(), Some("ab"));
        assert_eq!(part_suffix(26).as_deref(), Some("ba"));
        assert_eq!(part_suffix(MAX_PARTS - 1).as_deref(), Some("zz"));
        assert_eq!(part_suffix(MAX_PARTS), None);
    }

    #[test]
    fn test_file_part_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, b"0123456789").unwrap();
        let part = FilePart::open(&path).unwrap();
        assert_eq!(part.len(), 10);
        assert!(part.healthy());
    }

    #[test]
    fn test_empty_part_opens_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        let part = FilePart::open(&path).unwrap();
        assert_eq!(part.len(), 0);
        assert!(!part.healthy());
    }

    #[test]
    fn test_missing_part_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FilePart::open(dir.path().join("nope")),
            Err(ZimError::Io { .. })
        ));
    }

    #[test]
    fn test_split_and_read_across_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zim");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        std::fs::write(&path, &data).unwrap();

        let parts = split_archive(&path, 300).unwrap();
        assert_eq!(parts.len(), 4);
        assert!(parts[3].to_string_lossy().ends_with("a.zimad"));
        assert_eq!(std::fs::metadata(&parts[3]).unwrap().len(), 100);

        // Read through the parts only.
        std::fs::remove_file(&path).unwrap();
        let multi = MultiPart::open(&path).unwrap();
        assert_eq!(multi.parts().len(), 4);
        assert_eq!(multi.len(), 1000);

        let mut buf = vec![0u8; 400];
        multi.read_at(250, &mut buf).unwrap();
        assert_eq!(buf, data[250..650]);

        let mut tail = [0u8; 1];
        assert!(multi.read_at(1000, &mut tail).is_err());
    }

    #[test]
    fn test_split_rejects_zero_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zim");
        std::fs::write(&path, b"abc").unwrap();
        assert!(matches!(
            split_archive(&path, 0),
            Err(ZimError::Config(ConfigError::InvalidSplitSize(0)))
        ));
    }
}
