//! Centralized error types for zimwriter.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the zimwriter library.
#[derive(Error, Debug)]
pub enum ZimError {
    /// The archive header (or a region it points to) is malformed.
    #[error("Invalid ZIM archive: {0}")]
    Format(#[from] FormatError),

    /// The content source produced an item that cannot be archived.
    #[error("Invalid content item: {0}")]
    Source(#[from] SourceError),

    /// The writer was misconfigured or misused.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Header and layout violations, one variant per rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("header needs {expected} bytes, got {found}")]
    Truncated { found: usize, expected: usize },

    #[error("invalid magic number {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    #[error("unsupported major version {found}, expected {expected}")]
    MajorVersion { found: u16, expected: u16 },

    #[error("minor version {found} is below the supported minimum {minimum}")]
    MinorVersion { found: u16, minimum: u16 },

    #[error("article count {article_count} and cluster count {cluster_count} disagree on emptiness")]
    ArticleClusterMismatch {
        article_count: u32,
        cluster_count: u32,
    },

    #[error("mimeListPos is {found}, must be 80 or 72")]
    MimeListPos { found: u64 },

    #[error("urlPtrPos {found} lies before mimeListPos {mime_list_pos}")]
    UrlPtrPos { found: u64, mime_list_pos: u64 },

    #[error("titleIdxPos {found} lies before mimeListPos {mime_list_pos}")]
    TitleIdxPos { found: u64, mime_list_pos: u64 },

    #[error("clusterPtrPos {found} lies before mimeListPos {mime_list_pos}")]
    ClusterPtrPos { found: u64, mime_list_pos: u64 },

    #[error("cluster count {cluster_count} exceeds article count {article_count}")]
    ClusterCountExceedsArticles {
        article_count: u32,
        cluster_count: u32,
    },

    #[error("checksumPos {found} lies before mimeListPos {mime_list_pos}")]
    ChecksumPos { found: u64, mime_list_pos: u64 },

    #[error("{field} at offset {offset} lies outside the archive ({size} bytes)")]
    OffsetOutOfBounds {
        field: &'static str,
        offset: u64,
        size: u64,
    },

    #[error("mime list at offset {offset} is unterminated or not UTF-8")]
    MimeList { offset: u64 },

    #[error("checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    #[error("corrupt {what} at offset {offset}")]
    Corrupt { what: &'static str, offset: u64 },
}

impl FormatError {
    /// Stable name of the rule this error reports.
    pub fn rule(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "header-size",
            Self::BadMagic { .. } => "magic",
            Self::MajorVersion { .. } => "major-version",
            Self::MinorVersion { .. } => "minor-version",
            Self::ArticleClusterMismatch { .. } => "no-article-iff-no-cluster",
            Self::MimeListPos { .. } => "mime-list-pos",
            Self::UrlPtrPos { .. } => "url-ptr-pos",
            Self::TitleIdxPos { .. } => "title-idx-pos",
            Self::ClusterPtrPos { .. } => "cluster-ptr-pos",
            Self::ClusterCountExceedsArticles { .. } => "cluster-count",
            Self::ChecksumPos { .. } => "checksum-pos",
            Self::OffsetOutOfBounds { .. } => "offset-bounds",
            Self::MimeList { .. } => "mime-list",
            Self::ChecksumMismatch { .. } => "checksum",
            Self::Corrupt { .. } => "corrupt",
        }
    }
}

/// Problems with items handed over by an [`crate::writer::ArticleSource`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("item #{index} has no {field}")]
    MissingField { index: u64, field: &'static str },

    #[error("item #{index} has namespace {namespace:?}, expected a printable ASCII character")]
    InvalidNamespace { index: u64, namespace: char },

    #[error("item #{index} has a NUL byte in its {field}")]
    InvalidField { index: u64, field: &'static str },

    #[error("duplicate url '{namespace}/{url}'")]
    DuplicateUrl { namespace: char, url: String },

    #[error("redirect '{url}' points to unknown url '{target}'")]
    DanglingRedirect { url: String, target: String },

    #[error("redirect '{url}' is part of a redirect loop")]
    RedirectLoop { url: String },

    #[error("main page '{0}' is not in the archive")]
    UnknownMainPage(String),

    #[error("layout page '{0}' is not in the archive")]
    UnknownLayoutPage(String),

    #[error("more than {max} articles")]
    TooManyArticles { max: u64 },

    #[error("more than {max} distinct mimetypes")]
    TooManyMimeTypes { max: usize },

    #[error("item #{index} payload of {size} bytes does not fit a cluster")]
    BlobTooLarge { index: u64, size: usize },
}

/// Writer misconfiguration or misuse of a build session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("minimum chunk size must be positive, got {0}")]
    InvalidChunkSize(i64),

    #[error("this creator has already been used; create a new one")]
    SessionFinalized,

    #[error("no build has been started yet")]
    NotStarted,

    #[error("header field '{0}' was never set")]
    MissingHeaderField(&'static str),

    #[error("split size must be positive, got {0}")]
    InvalidSplitSize(u64),

    #[error("unknown compression '{0}', expected 'zlib' or 'none'")]
    UnknownCompression(String),
}

/// Convenience alias for `Result<T, ZimError>`.
pub type Result<T> = std::result::Result<T, ZimError>;

/// Helper to convert a bare `std::io::Error` together with a path.
impl ZimError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (prefer `ZimError::io`).
impl From<std::io::Error> for ZimError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
