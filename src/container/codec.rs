//! Chunk codecs for the compressed container formats.
//!
//! The real compression backends are pluggable black boxes; built in are
//! `NONE` (identity) and `PURGE` (zero-run elision). Selecting one of the
//! other methods is accepted at the command line but fails with a format
//! error once a chunk has to be coded.

use crate::error::{WdError, WdResult};
use crate::SUPERGROUP_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Purge,
    Bzip2,
    Lzma,
    Lzma2,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "NONE",
            Compression::Purge => "PURGE",
            Compression::Bzip2 => "BZIP2",
            Compression::Lzma => "LZMA",
            Compression::Lzma2 => "LZMA2",
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Purge => 1,
            Compression::Bzip2 => 2,
            Compression::Lzma => 3,
            Compression::Lzma2 => 4,
        }
    }

    pub fn from_u32(raw: u32) -> WdResult<Compression> {
        Ok(match raw {
            0 => Compression::None,
            1 => Compression::Purge,
            2 => Compression::Bzip2,
            3 => Compression::Lzma,
            4 => Compression::Lzma2,
            _ => return Err(WdError::Format("unknown compression method")),
        })
    }
}

/// A compression spec `(method, level, chunk size in supergroups)`, written
/// as `METHOD[.level][@factor]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSpec {
    pub method: Compression,
    pub level: u32,
    pub chunk_factor: u32,
}

impl Default for CompressionSpec {
    fn default() -> Self {
        CompressionSpec {
            method: Compression::None,
            level: 0,
            chunk_factor: 1,
        }
    }
}

impl CompressionSpec {
    pub fn chunk_size(&self) -> u64 {
        u64::from(self.chunk_factor.max(1)) * SUPERGROUP_SIZE
    }

    pub fn parse(text: &str) -> WdResult<CompressionSpec> {
        let mut spec = CompressionSpec::default();
        let (head, factor) = match text.split_once('@') {
            Some((h, f)) => (h, Some(f)),
            None => (text, None),
        };
        if let Some(f) = factor {
            spec.chunk_factor = f
                .parse()
                .map_err(|_| WdError::Syntax(format!("bad chunk factor in '{text}'")))?;
        }
        let (name, level) = match head.split_once('.') {
            Some((n, l)) => (n, Some(l)),
            None => (head, None),
        };
        if let Some(l) = level {
            spec.level = l
                .parse()
                .map_err(|_| WdError::Syntax(format!("bad compression level in '{text}'")))?;
            if spec.level > 9 {
                spec.level = 9;
            }
        }
        spec.method = match name.to_ascii_uppercase().as_str() {
            "NONE" => Compression::None,
            "PURGE" => Compression::Purge,
            "BZIP2" | "BZ2" => Compression::Bzip2,
            "LZMA" => Compression::Lzma,
            "LZMA2" => Compression::Lzma2,
            other => {
                return Err(WdError::Syntax(format!(
                    "unknown compression method '{other}'"
                )))
            }
        };
        Ok(spec)
    }
}

impl std::fmt::Display for CompressionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.method.name())?;
        if self.level > 0 {
            write!(f, ".{}", self.level)?;
        }
        if self.chunk_factor > 1 {
            write!(f, "@{}", self.chunk_factor)?;
        }
        Ok(())
    }
}

pub trait Codec {
    fn compress(&mut self, data: &[u8]) -> WdResult<Vec<u8>>;
    fn decompress(&mut self, data: &[u8], out_len: usize) -> WdResult<Vec<u8>>;
}

struct NoneCodec;

impl Codec for NoneCodec {
    fn compress(&mut self, data: &[u8]) -> WdResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&mut self, data: &[u8], out_len: usize) -> WdResult<Vec<u8>> {
        if data.len() != out_len {
            return Err(WdError::Format("stored chunk has wrong size"));
        }
        Ok(data.to_vec())
    }
}

/// Zero-run elision: the stream is a list of `(offset u32, length u32,
/// bytes)` segments holding the non-zero ranges, terminated by an offset of
/// `u32::MAX`.
struct PurgeCodec;

const PURGE_END: u32 = u32::MAX;

impl Codec for PurgeCodec {
    fn compress(&mut self, data: &[u8]) -> WdResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            // find the next non-zero run, merging runs separated by short
            // zero gaps to keep the segment count low
            match data[pos..].iter().position(|&b| b != 0) {
                None => break,
                Some(skip) => pos += skip,
            }
            let start = pos;
            let mut end = pos;
            let mut zeros = 0usize;
            while end < data.len() && zeros < 16 {
                if data[end] == 0 {
                    zeros += 1;
                } else {
                    zeros = 0;
                }
                end += 1;
            }
            let end = end - zeros;
            out.extend_from_slice(&(start as u32).to_be_bytes());
            out.extend_from_slice(&((end - start) as u32).to_be_bytes());
            out.extend_from_slice(&data[start..end]);
            pos = end;
        }
        out.extend_from_slice(&PURGE_END.to_be_bytes());
        Ok(out)
    }

    fn decompress(&mut self, data: &[u8], out_len: usize) -> WdResult<Vec<u8>> {
        let mut out = vec![0u8; out_len];
        let mut pos = 0usize;
        loop {
            let off = data
                .get(pos..pos + 4)
                .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
                .ok_or(WdError::Format("purge stream truncated"))?;
            pos += 4;
            if off == PURGE_END {
                break;
            }
            let len = data
                .get(pos..pos + 4)
                .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
                .ok_or(WdError::Format("purge stream truncated"))?;
            pos += 4;
            let (off, len) = (off as usize, len as usize);
            if off + len > out_len || pos + len > data.len() {
                return Err(WdError::Format("purge segment out of range"));
            }
            out[off..off + len].copy_from_slice(&data[pos..pos + len]);
            pos += len;
        }
        Ok(out)
    }
}

pub fn codec_for(method: Compression) -> WdResult<Box<dyn Codec>> {
    match method {
        Compression::None => Ok(Box::new(NoneCodec)),
        Compression::Purge => Ok(Box::new(PurgeCodec)),
        Compression::Bzip2 | Compression::Lzma | Compression::Lzma2 => {
            Err(WdError::Format("codec not available"))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn purge_round_trip() {
        let mut data = vec![0u8; 4096];
        data[10..20].fill(7);
        data[1000] = 1;
        data[4095] = 0xFF;
        let mut codec = codec_for(Compression::Purge).unwrap();
        let packed = codec.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(codec.decompress(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn purge_all_zero() {
        let data = vec![0u8; 512];
        let mut codec = codec_for(Compression::Purge).unwrap();
        let packed = codec.compress(&data).unwrap();
        assert_eq!(packed.len(), 4);
        assert_eq!(codec.decompress(&packed, 512).unwrap(), data);
    }

    #[test]
    fn spec_parsing() {
        let spec = CompressionSpec::parse("purge@4").unwrap();
        assert_eq!(spec.method, Compression::Purge);
        assert_eq!(spec.chunk_factor, 4);
        assert_eq!(spec.chunk_size(), 4 * SUPERGROUP_SIZE);
        let spec = CompressionSpec::parse("LZMA.9").unwrap();
        assert_eq!(spec.method, Compression::Lzma);
        assert_eq!(spec.level, 9);
        assert!(CompressionSpec::parse("zip").is_err());
        assert!(codec_for(Compression::Lzma).is_err());
    }
}
