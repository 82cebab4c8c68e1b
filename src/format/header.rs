//! The fixed 80-byte archive header.
//!
//! ```text
//! ┌────────┬──────────────┬──────────────────────────────────┐
//! │ offset │ field        │ type                             │
//! ├────────┼──────────────┼──────────────────────────────────┤
//! │   0    │ magic        │ u32 = 0x044D495A                 │
//! │   4    │ majorVersion │ u16 (must equal MAJOR_VERSION)   │
//! │   6    │ minorVersion │ u16 (>= MIN_MINOR_VERSION)       │
//! │   8    │ uuid         │ [u8; 16]                         │
//! │  24    │ articleCount │ u32                              │
//! │  28    │ clusterCount │ u32                              │
//! │  32    │ urlPtrPos    │ u64                              │
//! │  40    │ titleIdxPos  │ u64                              │
//! │  48    │ clusterPtrPos│ u64                              │
//! │  56    │ mimeListPos  │ u64 (80, or 72 for old archives) │
//! │  64    │ mainPage     │ u32 (NO_PAGE if none)            │
//! │  68    │ layoutPage   │ u32 (NO_PAGE if none)            │
//! │  72    │ checksumPos  │ u64 (0 if absent)                │
//! └────────┴──────────────┴──────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::error::{ConfigError, FormatError, ZimError};

/// Magic number identifying a ZIM archive ("ZIM\x04").
pub const MAGIC: u32 = 0x044D_495A;

/// The only major version this crate reads and writes.
pub const MAJOR_VERSION: u16 = 5;

/// Lowest accepted minor version.
pub const MIN_MINOR_VERSION: u16 = 0;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 80;

/// `mimeListPos` written by archives that predate the checksum field.
pub const LEGACY_MIME_LIST_POS: u64 = 72;

/// Sentinel for "no main page" / "no layout page".
pub const NO_PAGE: u32 = u32::MAX;

/// Parsed, validated archive header.
///
/// Values only come out of [`Fileheader::parse`] or [`HeaderBuilder::finalize`],
/// both of which run [`Fileheader::sanity_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fileheader {
    major_version: u16,
    minor_version: u16,
    uuid: [u8; 16],
    article_count: u32,
    cluster_count: u32,
    url_ptr_pos: u64,
    title_idx_pos: u64,
    cluster_ptr_pos: u64,
    mime_list_pos: u64,
    main_page: u32,
    layout_page: u32,
    checksum_pos: u64,
}

impl Fileheader {
    /// Decode and validate the first [`HEADER_SIZE`] bytes of an archive.
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                found: buf.len(),
                expected: HEADER_SIZE,
            });
        }

        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != MAGIC {
            debug!(found = magic, expected = MAGIC, "Invalid magic number");
            return Err(FormatError::BadMagic {
                found: magic,
                expected: MAGIC,
            });
        }

        let major_version = LittleEndian::read_u16(&buf[4..6]);
        if major_version != MAJOR_VERSION {
            debug!(found = major_version, "Invalid major version");
            return Err(FormatError::MajorVersion {
                found: major_version,
                expected: MAJOR_VERSION,
            });
        }

        let minor_version = LittleEndian::read_u16(&buf[6..8]);
        if minor_version < MIN_MINOR_VERSION {
            debug!(found = minor_version, "Invalid minor version");
            return Err(FormatError::MinorVersion {
                found: minor_version,
                minimum: MIN_MINOR_VERSION,
            });
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[8..24]);

        let header = Self {
            major_version,
            minor_version,
            uuid,
            article_count: LittleEndian::read_u32(&buf[24..28]),
            cluster_count: LittleEndian::read_u32(&buf[28..32]),
            url_ptr_pos: LittleEndian::read_u64(&buf[32..40]),
            title_idx_pos: LittleEndian::read_u64(&buf[40..48]),
            cluster_ptr_pos: LittleEndian::read_u64(&buf[48..56]),
            mime_list_pos: LittleEndian::read_u64(&buf[56..64]),
            main_page: LittleEndian::read_u32(&buf[64..68]),
            layout_page: LittleEndian::read_u32(&buf[68..72]),
            checksum_pos: LittleEndian::read_u64(&buf[72..80]),
        };
        header.sanity_check()?;
        Ok(header)
    }

    /// Render the header in its wire layout.
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], self.major_version);
        LittleEndian::write_u16(&mut buf[6..8], self.minor_version);
        buf[8..24].copy_from_slice(&self.uuid);
        LittleEndian::write_u32(&mut buf[24..28], self.article_count);
        LittleEndian::write_u32(&mut buf[28..32], self.cluster_count);
        LittleEndian::write_u64(&mut buf[32..40], self.url_ptr_pos);
        LittleEndian::write_u64(&mut buf[40..48], self.title_idx_pos);
        LittleEndian::write_u64(&mut buf[48..56], self.cluster_ptr_pos);
        LittleEndian::write_u64(&mut buf[56..64], self.mime_list_pos);
        LittleEndian::write_u32(&mut buf[64..68], self.main_page);
        LittleEndian::write_u32(&mut buf[68..72], self.layout_page);
        LittleEndian::write_u64(&mut buf[72..80], self.checksum_pos);
        buf
    }

    /// Cross-field structural checks shared by the read and write paths.
    pub fn sanity_check(&self) -> Result<(), FormatError> {
        if (self.article_count == 0) != (self.cluster_count == 0) {
            return Err(FormatError::ArticleClusterMismatch {
                article_count: self.article_count,
                cluster_count: self.cluster_count,
            });
        }

        let mime = self.mime_list_pos;
        if mime != HEADER_SIZE as u64 && mime != LEGACY_MIME_LIST_POS {
            return Err(FormatError::MimeListPos { found: mime });
        }

        if self.url_ptr_pos < mime {
            return Err(FormatError::UrlPtrPos {
                found: self.url_ptr_pos,
                mime_list_pos: mime,
            });
        }
        if self.title_idx_pos < mime {
            return Err(FormatError::TitleIdxPos {
                found: self.title_idx_pos,
                mime_list_pos: mime,
            });
        }
        if self.cluster_ptr_pos < mime {
            return Err(FormatError::ClusterPtrPos {
                found: self.cluster_ptr_pos,
                mime_list_pos: mime,
            });
        }

        if self.cluster_count > self.article_count {
            return Err(FormatError::ClusterCountExceedsArticles {
                article_count: self.article_count,
                cluster_count: self.cluster_count,
            });
        }

        if self.checksum_pos != 0 && self.checksum_pos < mime {
            return Err(FormatError::ChecksumPos {
                found: self.checksum_pos,
                mime_list_pos: mime,
            });
        }

        Ok(())
    }

    pub fn major_version(&self) -> u16 {
        self.major_version
    }

    pub fn minor_version(&self) -> u16 {
        self.minor_version
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    pub fn article_count(&self) -> u32 {
        self.article_count
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn url_ptr_pos(&self) -> u64 {
        self.url_ptr_pos
    }

    pub fn title_idx_pos(&self) -> u64 {
        self.title_idx_pos
    }

    pub fn cluster_ptr_pos(&self) -> u64 {
        self.cluster_ptr_pos
    }

    pub fn mime_list_pos(&self) -> u64 {
        self.mime_list_pos
    }

    /// URL-order index of the main page, if one is designated.
    pub fn main_page(&self) -> Option<u32> {
        (self.main_page != NO_PAGE).then_some(self.main_page)
    }

    /// URL-order index of the layout page, if one is designated.
    pub fn layout_page(&self) -> Option<u32> {
        (self.layout_page != NO_PAGE).then_some(self.layout_page)
    }

    /// Offset of the trailing checksum, if the archive has one.
    pub fn checksum_pos(&self) -> Option<u64> {
        (self.checksum_pos != 0).then_some(self.checksum_pos)
    }
}

/// Accumulates header fields as a build discovers them.
///
/// Counts and the four region offsets are mandatory; `finalize` refuses to
/// produce a header until all of them have been set.
#[derive(Debug, Clone)]
pub struct HeaderBuilder {
    minor_version: u16,
    uuid: [u8; 16],
    article_count: Option<u32>,
    cluster_count: Option<u32>,
    url_ptr_pos: Option<u64>,
    title_idx_pos: Option<u64>,
    cluster_ptr_pos: Option<u64>,
    mime_list_pos: Option<u64>,
    main_page: u32,
    layout_page: u32,
    checksum_pos: u64,
}

impl Default for HeaderBuilder {
    fn default() -> Self {
        Self {
            minor_version: MIN_MINOR_VERSION,
            uuid: [0; 16],
            article_count: None,
            cluster_count: None,
            url_ptr_pos: None,
            title_idx_pos: None,
            cluster_ptr_pos: None,
            mime_list_pos: None,
            main_page: NO_PAGE,
            layout_page: NO_PAGE,
            checksum_pos: 0,
        }
    }
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn minor_version(mut self, minor: u16) -> Self {
        self.minor_version = minor;
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn article_count(mut self, count: u32) -> Self {
        self.article_count = Some(count);
        self
    }

    pub fn cluster_count(mut self, count: u32) -> Self {
        self.cluster_count = Some(count);
        self
    }

    pub fn url_ptr_pos(mut self, pos: u64) -> Self {
        self.url_ptr_pos = Some(pos);
        self
    }

    pub fn title_idx_pos(mut self, pos: u64) -> Self {
        self.title_idx_pos = Some(pos);
        self
    }

    pub fn cluster_ptr_pos(mut self, pos: u64) -> Self {
        self.cluster_ptr_pos = Some(pos);
        self
    }

    pub fn mime_list_pos(mut self, pos: u64) -> Self {
        self.mime_list_pos = Some(pos);
        self
    }

    pub fn main_page(mut self, index: Option<u32>) -> Self {
        self.main_page = index.unwrap_or(NO_PAGE);
        self
    }

    pub fn layout_page(mut self, index: Option<u32>) -> Self {
        self.layout_page = index.unwrap_or(NO_PAGE);
        self
    }

    pub fn checksum_pos(mut self, pos: Option<u64>) -> Self {
        self.checksum_pos = pos.unwrap_or(0);
        self
    }

    /// Produce a validated header, or name the first missing field.
    pub fn finalize(self) -> Result<Fileheader, ZimError> {
        fn require<T>(value: Option<T>, name: &'static str) -> Result<T, ZimError> {
            value.ok_or(ZimError::Config(ConfigError::MissingHeaderField(name)))
        }

        let header = Fileheader {
            major_version: MAJOR_VERSION,
            minor_version: self.minor_version,
            uuid: self.uuid,
            article_count: require(self.article_count, "articleCount")?,
            cluster_count: require(self.cluster_count, "clusterCount")?,
            url_ptr_pos: require(self.url_ptr_pos, "urlPtrPos")?,
            title_idx_pos: require(self.title_idx_pos, "titleIdxPos")?,
            cluster_ptr_pos: require(self.cluster_ptr_pos, "clusterPtrPos")?,
            mime_list_pos: require(self.mime_list_pos, "mimeListPos")?,
            main_page: self.main_page,
            layout_page: self.layout_page,
            checksum_pos: self.checksum_pos,
        };
        header.sanity_check()?;
        Ok(header)
    }
}
