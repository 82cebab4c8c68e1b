//! Cluster wire format.
//!
//! ```text
//! ┌──────────────────┬─────────────────────────────────────────────┐
//! │ compression: u8  │ body (compressed unless compression == 1)   │
//! │                  │  offsets: [u32; n + 1]  (first = 4*(n + 1)) │
//! │                  │  blob 0 | blob 1 | ... | blob n-1           │
//! └──────────────────┴─────────────────────────────────────────────┘
//! ```

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Compression applied to a cluster body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zlib,
}

impl Compression {
    /// Byte stored at the start of every cluster.
    pub fn code(self) -> u8 {
        match self {
            Self::None => 1,
            Self::Zlib => 2,
        }
    }

    /// Inverse of [`Compression::code`]. Code 0 is an older spelling of "none".
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 | 1 => Some(Self::None),
            2 => Some(Self::Zlib),
            _ => None,
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "zlib" => Ok(Self::Zlib),
            _ => Err(ConfigError::UnknownCompression(s.to_string())),
        }
    }
}

/// Build the uncompressed cluster body from blob data and blob end offsets.
///
/// `ends[i]` is the end of blob `i` within `data`.
pub fn encode_body(data: &[u8], ends: &[u32]) -> Vec<u8> {
    let table_len = 4 * (ends.len() as u32 + 1);
    let mut body = Vec::with_capacity(table_len as usize + data.len());
    body.extend_from_slice(&table_len.to_le_bytes());
    for end in ends {
        body.extend_from_slice(&(table_len + end).to_le_bytes());
    }
    body.extend_from_slice(data);
    body
}

/// Produce the full on-disk cluster for an uncompressed body.
pub fn compress(body: &[u8], compression: Compression) -> std::io::Result<Vec<u8>> {
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(body.len() + 1);
            out.push(compression.code());
            out.extend_from_slice(body);
            Ok(out)
        }
        Compression::Zlib => {
            let mut encoder = ZlibEncoder::new(
                vec![compression.code()],
                flate2::Compression::default(),
            );
            encoder.write_all(body)?;
            encoder.finish()
        }
    }
}

/// Decode an on-disk cluster into its blobs.
pub fn decode(raw: &[u8]) -> std::io::Result<Vec<Vec<u8>>> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());

    let (&code, rest) = raw.split_first().ok_or_else(|| invalid("empty cluster"))?;
    let body = match Compression::from_code(code) {
        Some(Compression::None) => rest.to_vec(),
        Some(Compression::Zlib) => {
            let mut out = Vec::new();
            ZlibDecoder::new(rest).read_to_end(&mut out)?;
            out
        }
        None => return Err(invalid("unknown cluster compression")),
    };

    if body.len() < 4 {
        return Err(invalid("cluster offset table truncated"));
    }
    let table_len = LittleEndian::read_u32(&body[0..4]) as usize;
    if table_len < 4 || table_len % 4 != 0 || table_len > body.len() {
        return Err(invalid("cluster offset table malformed"));
    }
    let offsets: Vec<usize> = body[..table_len]
        .chunks_exact(4)
        .map(|c| LittleEndian::read_u32(c) as usize)
        .collect();

    offsets
        .windows(2)
        .map(|w| {
            if w[0] > w[1] || w[1] > body.len() {
                Err(invalid("cluster blob offsets out of range"))
            } else {
                Ok(body[w[0]..w[1]].to_vec())
            }
        })
        .collect()
}
