//! `zimwriter` — build ZIM archives from a stream of content items.
//!
//! The library packs item payloads into compressed clusters, writes the
//! sorted directory and index tables, and can read back, verify and split
//! the archives it produces.

pub mod config;
pub mod error;
pub mod format;
pub mod store;
pub mod writer;
