//! Archive writer: content source -> clusters -> indexed archive.

pub mod assembler;
pub mod creator;
pub mod source;

pub use assembler::{BlobLocator, ClusterAssembler, ClusterTable};
pub use creator::ZimCreator;
pub use source::{Article, ArticleSource, DirectorySource, IterSource};
