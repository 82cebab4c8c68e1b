//! Reading finished archives, single-file or split into parts.

pub mod archive;
pub mod part;

pub use archive::{Archive, ChecksumStatus};
pub use part::{part_suffix, split_archive, FilePart, MultiPart};
