//! WDF: write-once dense format.
//!
//! Layout: header, payload chunks, trailing chunk table (rewritten on
//! close). Each chunk descriptor maps a virtual range onto a physical file
//! range; ranges never stored read as zero. Version 1 and 2 share the
//! layout; version 2 adds the alignment flag byte in the header.

use std::io::{Cursor, Write};
use std::path::Path;

use binrw::{binrw, BinReaderExt, BinWriterExt};

use crate::container::split::SplitFile;
use crate::error::{WdError, WdResult};

pub const WDF_MAGIC: [u8; 8] = *b"WII\x01DISC";
const TABLE_MAGIC: [u8; 4] = *b"wdf\0";

#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WdfHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub split_index: u32,
    pub split_count: u32,
    pub file_size: u64,
    pub data_size: u64,
    pub chunk_table_off: u64,
    pub chunk_count: u32,
    pub align_flag: u8,
    pub reserved: [u8; 3],
}

pub const WDF_HEADER_SIZE: u64 = 0x34;

impl Default for WdfHeader {
    fn default() -> Self {
        WdfHeader {
            magic: WDF_MAGIC,
            version: 1,
            split_index: 0,
            split_count: 1,
            file_size: 0,
            data_size: 0,
            chunk_table_off: 0,
            chunk_count: 0,
            align_flag: 0,
            reserved: [0; 3],
        }
    }
}

#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WdfChunk {
    pub virtual_off: u64,
    pub phys_off: u64,
    pub size: u64,
}

impl WdfChunk {
    fn virtual_end(&self) -> u64 {
        self.virtual_off + self.size
    }
}

#[derive(Debug)]
pub struct WdfFile {
    file: SplitFile,
    header: WdfHeader,
    chunks: Vec<WdfChunk>,
    data_end: u64,
    dirty: bool,
}

impl WdfFile {
    pub fn open(path: &Path, writable: bool) -> WdResult<WdfFile> {
        let mut file = SplitFile::open(path, writable)?;
        let mut head_buf = vec![0u8; WDF_HEADER_SIZE as usize];
        file.read_at(0, &mut head_buf)?;
        let header: WdfHeader = Cursor::new(&head_buf).read_be()?;
        if header.magic != WDF_MAGIC {
            return Err(WdError::Format("wdf: bad magic"));
        }
        if header.version != 1 && header.version != 2 {
            return Err(WdError::Format("wdf: unsupported version"));
        }
        let mut table = vec![0u8; 4 + header.chunk_count as usize * 24];
        file.read_at(header.chunk_table_off, &mut table)?;
        if table[..4] != TABLE_MAGIC {
            return Err(WdError::Format("wdf: bad chunk table"));
        }
        let mut cur = Cursor::new(&table[4..]);
        let mut chunks = Vec::with_capacity(header.chunk_count as usize);
        let mut data_end = WDF_HEADER_SIZE;
        for _ in 0..header.chunk_count {
            let chunk: WdfChunk = cur.read_be()?;
            data_end = data_end.max(chunk.phys_off + chunk.size);
            chunks.push(chunk);
        }
        chunks.sort_by_key(|c| c.virtual_off);
        Ok(WdfFile {
            file,
            header,
            chunks,
            data_end,
            dirty: false,
        })
    }

    pub fn create(path: &Path, version: u32, overwrite: bool) -> WdResult<WdfFile> {
        let file = SplitFile::create(path, overwrite)?;
        let header = WdfHeader {
            version,
            align_flag: u8::from(version >= 2),
            ..WdfHeader::default()
        };
        Ok(WdfFile {
            file,
            header,
            chunks: Vec::new(),
            data_end: WDF_HEADER_SIZE,
            dirty: true,
        })
    }

    pub fn size(&self) -> u64 {
        self.header.file_size
    }

    pub fn set_size(&mut self, size: u64) -> WdResult<()> {
        self.header.file_size = self.header.file_size.max(size);
        self.dirty = true;
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn read_at(&mut self, off: u64, buf: &mut [u8]) -> WdResult<()> {
        buf.fill(0);
        let end = off + buf.len() as u64;
        // the list is sorted; a binary search keeps long reads cheap
        let start = self
            .chunks
            .partition_point(|c| c.virtual_end() <= off);
        for chunk in &self.chunks[start..] {
            if chunk.virtual_off >= end {
                break;
            }
            let lo = chunk.virtual_off.max(off);
            let hi = chunk.virtual_end().min(end);
            let mut piece = vec![0u8; (hi - lo) as usize];
            self.file
                .read_at(chunk.phys_off + (lo - chunk.virtual_off), &mut piece)?;
            let dst = (lo - off) as usize;
            buf[dst..dst + piece.len()].copy_from_slice(&piece);
        }
        Ok(())
    }

    pub fn write_at(&mut self, off: u64, buf: &[u8]) -> WdResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.dirty = true;
        let mut pos = off;
        let end = off + buf.len() as u64;
        while pos < end {
            // find the chunk covering `pos`, or the gap up to the next one
            let covering = self
                .chunks
                .iter()
                .position(|c| c.virtual_off <= pos && pos < c.virtual_end());
            match covering {
                Some(index) => {
                    let chunk = self.chunks[index];
                    let hi = chunk.virtual_end().min(end);
                    let src = (pos - off) as usize;
                    let len = (hi - pos) as usize;
                    self.file.write_at(
                        chunk.phys_off + (pos - chunk.virtual_off),
                        &buf[src..src + len],
                    )?;
                    pos = hi;
                }
                None => {
                    let next_virtual = self
                        .chunks
                        .iter()
                        .map(|c| c.virtual_off)
                        .filter(|&v| v > pos)
                        .min()
                        .unwrap_or(u64::MAX);
                    let hi = next_virtual.min(end);
                    let src = (pos - off) as usize;
                    let len = (hi - pos) as usize;
                    let phys = self.data_end;
                    self.file.write_at(phys, &buf[src..src + len])?;
                    self.data_end += len as u64;
                    self.header.data_size += len as u64;
                    // coalesce an append that directly continues the last chunk
                    let coalesced = self.chunks.last_mut().is_some_and(|last| {
                        if last.virtual_end() == pos && last.phys_off + last.size == phys {
                            last.size += len as u64;
                            true
                        } else {
                            false
                        }
                    });
                    if !coalesced {
                        self.chunks.push(WdfChunk {
                            virtual_off: pos,
                            phys_off: phys,
                            size: len as u64,
                        });
                        self.chunks.sort_by_key(|c| c.virtual_off);
                    }
                    pos = hi;
                }
            }
        }
        self.header.file_size = self.header.file_size.max(end);
        Ok(())
    }

    pub fn sync(&mut self) -> WdResult<()> {
        if !self.dirty {
            return self.file.sync();
        }
        self.header.chunk_table_off = self.data_end;
        self.header.chunk_count = self.chunks.len() as u32;
        let mut table = Cursor::new(Vec::new());
        table.write_all(&TABLE_MAGIC)?;
        for chunk in &self.chunks {
            table.write_be(chunk)?;
        }
        self.file.write_at(self.data_end, &table.into_inner())?;
        let mut head = Cursor::new(Vec::new());
        head.write_be(&self.header)?;
        self.file.write_at(0, &head.into_inner())?;
        self.file.sync()?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for WdfFile {
    fn drop(&mut self) {
        if self.dirty {
            let _ = self.sync();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_read_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.wdf");
        {
            let mut wdf = WdfFile::create(&path, 1, false).unwrap();
            wdf.write_at(0x100, b"abcdef").unwrap();
            wdf.write_at(0x106, b"ghij").unwrap(); // coalesces
            wdf.write_at(0x10_0000, &[9u8; 32]).unwrap();
            wdf.set_size(0x20_0000).unwrap();
            assert_eq!(wdf.chunk_count(), 2);
            wdf.sync().unwrap();
        }
        let mut wdf = WdfFile::open(&path, false).unwrap();
        assert_eq!(wdf.size(), 0x20_0000);
        let mut buf = [0u8; 12];
        wdf.read_at(0xFE, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0abcdefghij");
        let mut hole = [0xAAu8; 16];
        wdf.read_at(0x8000, &mut hole).unwrap();
        assert_eq!(hole, [0u8; 16]);
        let mut far = [0u8; 32];
        wdf.read_at(0x10_0000, &mut far).unwrap();
        assert_eq!(far, [9u8; 32]);
    }

    #[test]
    fn overwrite_goes_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.wdf");
        let mut wdf = WdfFile::create(&path, 2, false).unwrap();
        wdf.write_at(0, &[1u8; 64]).unwrap();
        let stored = wdf.header.data_size;
        wdf.write_at(10, &[2u8; 16]).unwrap();
        assert_eq!(wdf.header.data_size, stored);
        let mut buf = [0u8; 64];
        wdf.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..10], &[1u8; 10]);
        assert_eq!(&buf[10..26], &[2u8; 16]);
        assert_eq!(&buf[26..], &[1u8; 38]);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.wdf");
        std::fs::write(&path, b"NOTWDF\0\0more bytes here to fill").unwrap();
        assert!(matches!(
            WdfFile::open(&path, false),
            Err(WdError::Format(_))
        ));
    }
}
