//! WIA: chunked image with a per-chunk codec choice.
//!
//! The header records the compression spec `(method, level, chunk size)`;
//! the chunk table maps every virtual chunk to a stored range and the
//! method it was coded with (a chunk that compresses badly is stored with
//! `NONE`). Absent chunks read as zeros.

use std::io::Cursor;
use std::path::Path;

use binrw::{binrw, BinReaderExt, BinWriterExt};

use crate::container::codec::{codec_for, Compression, CompressionSpec};
use crate::container::split::SplitFile;
use crate::error::{WdError, WdResult};

pub const WIA_MAGIC: [u8; 4] = *b"WIA\x01";

#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiaHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub method: u32,
    pub level: u32,
    pub chunk_size: u32,
    pub file_size: u64,
    pub chunk_table_off: u64,
    pub chunk_count: u32,
}

pub const WIA_HEADER_SIZE: u64 = 0x28;

#[binrw]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WiaChunk {
    pub phys_off: u64,
    pub stored_size: u32,
    pub method: u32,
}

#[derive(Debug)]
pub struct WiaFile {
    file: SplitFile,
    spec: CompressionSpec,
    chunk_size: u64,
    file_size: u64,
    chunks: Vec<WiaChunk>,
    data_end: u64,
    // write staging for the chunk currently being filled
    staged: Option<(u64, Vec<u8>)>,
    dirty: bool,
}

impl WiaFile {
    pub fn open(path: &Path, writable: bool) -> WdResult<WiaFile> {
        let mut file = SplitFile::open(path, writable)?;
        let mut head_buf = vec![0u8; WIA_HEADER_SIZE as usize];
        file.read_at(0, &mut head_buf)?;
        let header: WiaHeader = Cursor::new(&head_buf).read_be()?;
        if header.magic != WIA_MAGIC {
            return Err(WdError::Format("wia: bad magic"));
        }
        if header.chunk_size == 0 {
            return Err(WdError::Format("wia: bad chunk size"));
        }
        let mut table = vec![0u8; header.chunk_count as usize * 16];
        file.read_at(header.chunk_table_off, &mut table)?;
        let mut cur = Cursor::new(&table);
        let mut chunks = Vec::with_capacity(header.chunk_count as usize);
        let mut data_end = WIA_HEADER_SIZE;
        for _ in 0..header.chunk_count {
            let chunk: WiaChunk = cur.read_be()?;
            data_end = data_end.max(chunk.phys_off + u64::from(chunk.stored_size));
            chunks.push(chunk);
        }
        Ok(WiaFile {
            file,
            spec: CompressionSpec {
                method: Compression::from_u32(header.method)?,
                level: header.level,
                chunk_factor: 1,
            },
            chunk_size: u64::from(header.chunk_size),
            file_size: header.file_size,
            chunks,
            data_end,
            staged: None,
            dirty: false,
        })
    }

    pub fn create(path: &Path, spec: CompressionSpec, overwrite: bool) -> WdResult<WiaFile> {
        // fail early when the chosen backend is not linked in
        codec_for(spec.method)?;
        let file = SplitFile::create(path, overwrite)?;
        Ok(WiaFile {
            file,
            spec,
            chunk_size: spec.chunk_size(),
            file_size: 0,
            chunks: Vec::new(),
            data_end: WIA_HEADER_SIZE,
            staged: None,
            dirty: true,
        })
    }

    pub fn size(&self) -> u64 {
        self.file_size
    }

    pub fn set_size(&mut self, size: u64) -> WdResult<()> {
        self.file_size = self.file_size.max(size);
        self.dirty = true;
        Ok(())
    }

    pub fn spec(&self) -> CompressionSpec {
        self.spec
    }

    fn load_chunk(&mut self, index: usize) -> WdResult<Vec<u8>> {
        let out_len = self.chunk_size as usize;
        match self.chunks.get(index) {
            None => Ok(vec![0u8; out_len]),
            Some(chunk) if chunk.stored_size == 0 => Ok(vec![0u8; out_len]),
            Some(chunk) => {
                let mut stored = vec![0u8; chunk.stored_size as usize];
                let (phys, method) = (chunk.phys_off, chunk.method);
                self.file.read_at(phys, &mut stored)?;
                let mut codec = codec_for(Compression::from_u32(method)?)?;
                codec.decompress(&stored, out_len)
            }
        }
    }

    fn flush_staged(&mut self) -> WdResult<()> {
        let Some((index, data)) = self.staged.take() else {
            return Ok(());
        };
        let index = index as usize;
        let mut method = self.spec.method;
        let mut codec = codec_for(method)?;
        let mut stored = codec.compress(&data)?;
        if stored.len() >= data.len() && method != Compression::None {
            // store raw when compression enlarges the chunk
            method = Compression::None;
            stored = data;
        }
        if self.chunks.len() <= index {
            self.chunks.resize(index + 1, WiaChunk::default());
        }
        self.chunks[index] = WiaChunk {
            phys_off: self.data_end,
            stored_size: stored.len() as u32,
            method: method.to_u32(),
        };
        self.file.write_at(self.data_end, &stored)?;
        self.data_end += stored.len() as u64;
        Ok(())
    }

    fn stage_chunk(&mut self, index: u64) -> WdResult<&mut Vec<u8>> {
        if self.staged.as_ref().map(|(i, _)| *i) != Some(index) {
            self.flush_staged()?;
            let data = self.load_chunk(index as usize)?;
            self.staged = Some((index, data));
        }
        Ok(&mut self.staged.as_mut().unwrap().1)
    }

    pub fn read_at(&mut self, mut off: u64, mut buf: &mut [u8]) -> WdResult<()> {
        while !buf.is_empty() {
            let index = off / self.chunk_size;
            let within = (off % self.chunk_size) as usize;
            let chunk_len = ((self.chunk_size as usize) - within).min(buf.len());
            let (head, tail) = buf.split_at_mut(chunk_len);
            if self.staged.as_ref().map(|(i, _)| *i) == Some(index) {
                let data = &self.staged.as_ref().unwrap().1;
                head.copy_from_slice(&data[within..within + chunk_len]);
            } else {
                let data = self.load_chunk(index as usize)?;
                head.copy_from_slice(&data[within..within + chunk_len]);
            }
            buf = tail;
            off += chunk_len as u64;
        }
        Ok(())
    }

    pub fn write_at(&mut self, mut off: u64, mut buf: &[u8]) -> WdResult<()> {
        let end = off + buf.len() as u64;
        self.dirty = true;
        while !buf.is_empty() {
            let index = off / self.chunk_size;
            let within = (off % self.chunk_size) as usize;
            let chunk_len = ((self.chunk_size as usize) - within).min(buf.len());
            // rewriting an already flushed chunk re-stages it; the old
            // stored bytes become dead space in the file
            let data = self.stage_chunk(index)?;
            data[within..within + chunk_len].copy_from_slice(&buf[..chunk_len]);
            buf = &buf[chunk_len..];
            off += chunk_len as u64;
        }
        self.file_size = self.file_size.max(end);
        Ok(())
    }

    pub fn sync(&mut self) -> WdResult<()> {
        self.flush_staged()?;
        if self.dirty {
            let header = WiaHeader {
                magic: WIA_MAGIC,
                version: 1,
                method: self.spec.method.to_u32(),
                level: self.spec.level,
                chunk_size: self.chunk_size as u32,
                file_size: self.file_size,
                chunk_table_off: self.data_end,
                chunk_count: self.chunks.len() as u32,
            };
            let mut table = Cursor::new(Vec::new());
            for chunk in &self.chunks {
                table.write_be(chunk)?;
            }
            self.file.write_at(self.data_end, &table.into_inner())?;
            let mut head = Cursor::new(Vec::new());
            head.write_be(&header)?;
            self.file.write_at(0, &head.into_inner())?;
            self.dirty = false;
        }
        self.file.sync()
    }
}

impl Drop for WiaFile {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SUPERGROUP_SIZE;

    #[test]
    fn purge_chunks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.wia");
        let spec = CompressionSpec::parse("purge").unwrap();
        {
            let mut wia = WiaFile::create(&path, spec, false).unwrap();
            wia.write_at(0x1000, &[7u8; 0x100]).unwrap();
            wia.write_at(SUPERGROUP_SIZE + 5, b"second chunk").unwrap();
            wia.set_size(4 * SUPERGROUP_SIZE).unwrap();
            wia.sync().unwrap();
        }
        let mut wia = WiaFile::open(&path, false).unwrap();
        assert_eq!(wia.size(), 4 * SUPERGROUP_SIZE);
        assert_eq!(wia.spec().method, Compression::Purge);
        let mut buf = [0u8; 0x100];
        wia.read_at(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 0x100]);
        let mut buf = [0u8; 12];
        wia.read_at(SUPERGROUP_SIZE + 5, &mut buf).unwrap();
        assert_eq!(&buf, b"second chunk");
        // hole chunk
        let mut buf = [0xAAu8; 64];
        wia.read_at(2 * SUPERGROUP_SIZE, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn refuses_unavailable_codecs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.wia");
        let spec = CompressionSpec::parse("bzip2.9").unwrap();
        assert!(matches!(
            WiaFile::create(&path, spec, false),
            Err(WdError::Format(_))
        ));
    }
}
