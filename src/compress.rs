//! Bulk compression families carried in wire-header flag bits 12-15.
//!
//! Family identity is a frozen 4-bit value on the wire (0 = none,
//! 1 = zstd, 2 = lz4, 3 = lzma).  There is no negotiation: a reply's
//! flag bits name the family the payload was stored with and the
//! receiver MUST be able to supply it or fail the transfer.

use std::io::{self, Cursor, Read};

use thiserror::Error;

use crate::wire::{COMP_LZ4, COMP_LZMA, COMP_MASK, COMP_ZSTD};

/// Zstd level used for new chunks.
const ZSTD_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("compression failed: {0}")]
    Compress(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("unknown compression family bits {0:#06x}")]
    UnknownFamily(u16),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Closed set of wire compression families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompFamily {
    None,
    Zstd,
    Lz4,
    Lzma,
}

impl CompFamily {
    /// The flag bits naming this family on the wire.
    #[inline]
    pub fn flag_bits(self) -> u16 {
        match self {
            CompFamily::None => 0,
            CompFamily::Zstd => COMP_ZSTD,
            CompFamily::Lz4  => COMP_LZ4,
            CompFamily::Lzma => COMP_LZMA,
        }
    }

    /// Resolve the family named by a header's flag bits.
    pub fn from_flags(flags: u16) -> Result<Self, CompressError> {
        match flags & COMP_MASK {
            0         => Ok(CompFamily::None),
            COMP_ZSTD => Ok(CompFamily::Zstd),
            COMP_LZ4  => Ok(CompFamily::Lz4),
            COMP_LZMA => Ok(CompFamily::Lzma),
            other     => Err(CompressError::UnknownFamily(other)),
        }
    }

    /// Parse a configuration value.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CompFamily::None),
            "zstd" => Some(CompFamily::Zstd),
            "lz4"  => Some(CompFamily::Lz4),
            "lzma" => Some(CompFamily::Lzma),
            _      => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompFamily::None => "none",
            CompFamily::Zstd => "zstd",
            CompFamily::Lz4  => "lz4",
            CompFamily::Lzma => "lzma",
        }
    }
}

/// Compress one chunk.  `None` passes through verbatim.
pub fn compress(family: CompFamily, data: &[u8]) -> Result<Vec<u8>, CompressError> {
    match family {
        CompFamily::None => Ok(data.to_vec()),
        CompFamily::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
            .map_err(|e| CompressError::Compress(e.to_string())),
        CompFamily::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompFamily::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_compress(&mut Cursor::new(data), &mut out)
                .map_err(|e| CompressError::Compress(e.to_string()))?;
            Ok(out)
        }
    }
}

/// Decompress one chunk, capped at `max` output bytes.
pub fn decompress(family: CompFamily, data: &[u8], max: usize) -> Result<Vec<u8>, CompressError> {
    let out = match family {
        CompFamily::None => data.to_vec(),
        CompFamily::Zstd => {
            let mut out = Vec::new();
            zstd::Decoder::new(data)
                .map_err(|e| CompressError::Decompress(e.to_string()))?
                .take(max as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| CompressError::Decompress(e.to_string()))?;
            out
        }
        CompFamily::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CompressError::Decompress(e.to_string()))?,
        CompFamily::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_decompress(&mut Cursor::new(data), &mut out)
                .map_err(|e| CompressError::Decompress(e.to_string()))?;
            out
        }
    };
    if out.len() > max {
        return Err(CompressError::Decompress(format!(
            "chunk inflates past the {max} byte limit"
        )));
    }
    Ok(out)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::CHUNK_MAX;

    #[test]
    fn every_family_round_trips() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        for fam in [CompFamily::None, CompFamily::Zstd, CompFamily::Lz4, CompFamily::Lzma] {
            let packed = compress(fam, &data).unwrap();
            let unpacked = decompress(fam, &packed, CHUNK_MAX).unwrap();
            assert_eq!(unpacked, data, "family {}", fam.name());
        }
    }

    #[test]
    fn flag_bits_round_trip() {
        for fam in [CompFamily::None, CompFamily::Zstd, CompFamily::Lz4, CompFamily::Lzma] {
            assert_eq!(CompFamily::from_flags(fam.flag_bits()).unwrap(), fam);
        }
        assert!(CompFamily::from_flags(4 << 12).is_err());
    }

    #[test]
    fn oversize_inflation_is_rejected() {
        let data = vec![0u8; 4096];
        let packed = compress(CompFamily::Zstd, &data).unwrap();
        assert!(decompress(CompFamily::Zstd, &packed, 1024).is_err());
    }
}
