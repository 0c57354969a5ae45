//! GCZ: block-compressed image with a pointer table and per-block CRC.
//!
//! All header fields are little-endian. A block pointer with the top bit
//! set references raw (uncompressed) data; without the deflate backend this
//! writer always stores raw blocks, and reading a deflated block reports
//! the codec as unavailable. Blocks never written alias one shared zero
//! block.

use std::io::Cursor;
use std::path::Path;

use binrw::{binrw, BinReaderExt, BinWriterExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::container::split::SplitFile;
use crate::error::{WdError, WdResult};

pub const GCZ_MAGIC: u32 = 0xB10B_C001;
const RAW_FLAG: u64 = 1 << 63;
const UNWRITTEN: u64 = u64::MAX;
pub const GCZ_DEFAULT_BLOCK_SIZE: u32 = 0x8000;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GczHeader {
    pub magic: u32,
    pub sub_type: u32,
    pub compressed_size: u64,
    pub data_size: u64,
    pub block_size: u32,
    pub num_blocks: u32,
}

pub const GCZ_HEADER_SIZE: u64 = 0x20;

#[derive(Debug)]
pub struct GczFile {
    file: SplitFile,
    header: GczHeader,
    pointers: Vec<u64>,
    hashes: Vec<u32>,
    data_start: u64,
    data_end: u64,
    zero_block: Option<u64>,
    dirty: bool,
}

impl GczFile {
    fn table_size(num_blocks: u32) -> u64 {
        u64::from(num_blocks) * 12
    }

    pub fn open(path: &Path, writable: bool) -> WdResult<GczFile> {
        let mut file = SplitFile::open(path, writable)?;
        let mut head_buf = vec![0u8; GCZ_HEADER_SIZE as usize];
        file.read_at(0, &mut head_buf)?;
        let header: GczHeader = Cursor::new(&head_buf).read_le()?;
        if header.magic != GCZ_MAGIC {
            return Err(WdError::Format("gcz: bad magic"));
        }
        if header.block_size == 0 {
            return Err(WdError::Format("gcz: bad block size"));
        }
        let n = header.num_blocks as usize;
        let mut table = vec![0u8; Self::table_size(header.num_blocks) as usize];
        file.read_at(GCZ_HEADER_SIZE, &mut table)?;
        let mut cur = Cursor::new(&table);
        let mut pointers = Vec::with_capacity(n);
        for _ in 0..n {
            pointers.push(cur.read_le::<u64>()?);
        }
        let mut hashes = Vec::with_capacity(n);
        for _ in 0..n {
            hashes.push(cur.read_le::<u32>()?);
        }
        let data_start = GCZ_HEADER_SIZE + Self::table_size(header.num_blocks);
        let mut data_end = data_start;
        for &ptr in &pointers {
            if ptr != UNWRITTEN {
                data_end = data_end.max(data_start + (ptr & !RAW_FLAG) + u64::from(header.block_size));
            }
        }
        Ok(GczFile {
            file,
            header,
            pointers,
            hashes,
            data_start,
            data_end,
            zero_block: None,
            dirty: false,
        })
    }

    /// Create a GCZ image. The block count is fixed by the logical size, so
    /// it must be known up front.
    pub fn create(
        path: &Path,
        data_size: u64,
        block_size: u32,
        overwrite: bool,
    ) -> WdResult<GczFile> {
        let file = SplitFile::create(path, overwrite)?;
        let num_blocks = data_size.div_ceil(u64::from(block_size)) as u32;
        let header = GczHeader {
            magic: GCZ_MAGIC,
            sub_type: 1,
            compressed_size: 0,
            data_size,
            block_size,
            num_blocks,
        };
        let data_start = GCZ_HEADER_SIZE + Self::table_size(num_blocks);
        Ok(GczFile {
            file,
            header,
            pointers: vec![UNWRITTEN; num_blocks as usize],
            hashes: vec![0; num_blocks as usize],
            data_start,
            data_end: data_start,
            zero_block: None,
            dirty: true,
        })
    }

    pub fn size(&self) -> u64 {
        self.header.data_size
    }

    pub fn set_size(&mut self, size: u64) -> WdResult<()> {
        if size > self.size() {
            let num_blocks = size.div_ceil(u64::from(self.header.block_size)) as u32;
            if self.data_end != self.data_start {
                // the table sits in front of the data, it cannot grow late
                return Err(WdError::Format("gcz: size fixed after first write"));
            }
            self.header.data_size = size;
            self.header.num_blocks = num_blocks;
            self.pointers = vec![UNWRITTEN; num_blocks as usize];
            self.hashes = vec![0; num_blocks as usize];
            self.data_start = GCZ_HEADER_SIZE + Self::table_size(num_blocks);
            self.data_end = self.data_start;
            self.dirty = true;
        }
        Ok(())
    }

    fn read_block(&mut self, block: usize) -> WdResult<Vec<u8>> {
        let bs = self.header.block_size as usize;
        let ptr = *self
            .pointers
            .get(block)
            .ok_or(WdError::Format("gcz: block out of range"))?;
        if ptr == UNWRITTEN {
            return Ok(vec![0u8; bs]);
        }
        if ptr & RAW_FLAG == 0 {
            return Err(WdError::Format("codec not available"));
        }
        let mut data = vec![0u8; bs];
        self.file
            .read_at(self.data_start + (ptr & !RAW_FLAG), &mut data)?;
        if CRC32.checksum(&data) != self.hashes[block] {
            return Err(WdError::Crypto(format!("gcz: crc mismatch in block {block}")));
        }
        Ok(data)
    }

    fn write_block(&mut self, block: usize, data: &[u8]) -> WdResult<()> {
        debug_assert_eq!(data.len(), self.header.block_size as usize);
        self.dirty = true;
        let crc = CRC32.checksum(data);
        if data.iter().all(|&b| b == 0) {
            // all-zero blocks share one stored copy
            let phys = match self.zero_block {
                Some(phys) => phys,
                None => {
                    let phys = self.data_end - self.data_start;
                    self.file.write_at(self.data_end, data)?;
                    self.data_end += data.len() as u64;
                    self.zero_block = Some(phys);
                    phys
                }
            };
            self.pointers[block] = phys | RAW_FLAG;
            self.hashes[block] = crc;
            return Ok(());
        }
        let ptr = self.pointers[block];
        let phys = if ptr == UNWRITTEN || Some(ptr & !RAW_FLAG) == self.zero_block {
            let phys = self.data_end - self.data_start;
            self.data_end += data.len() as u64;
            phys
        } else {
            ptr & !RAW_FLAG
        };
        self.file.write_at(self.data_start + phys, data)?;
        self.pointers[block] = phys | RAW_FLAG;
        self.hashes[block] = crc;
        Ok(())
    }

    pub fn read_at(&mut self, mut off: u64, mut buf: &mut [u8]) -> WdResult<()> {
        let bs = u64::from(self.header.block_size);
        while !buf.is_empty() {
            let block = (off / bs) as usize;
            let within = (off % bs) as usize;
            let chunk = (bs as usize - within).min(buf.len());
            let (head, tail) = buf.split_at_mut(chunk);
            if block >= self.pointers.len() {
                head.fill(0);
            } else {
                let data = self.read_block(block)?;
                head.copy_from_slice(&data[within..within + chunk]);
            }
            buf = tail;
            off += chunk as u64;
        }
        Ok(())
    }

    pub fn write_at(&mut self, mut off: u64, mut buf: &[u8]) -> WdResult<()> {
        let bs = u64::from(self.header.block_size);
        while !buf.is_empty() {
            let block = (off / bs) as usize;
            let within = (off % bs) as usize;
            let chunk = (bs as usize - within).min(buf.len());
            if block >= self.pointers.len() {
                return Err(WdError::Format("gcz: write beyond image size"));
            }
            let mut data = if within == 0 && chunk == bs as usize {
                Vec::new()
            } else {
                self.read_block(block)?
            };
            if data.is_empty() {
                data = buf[..chunk].to_vec();
            } else {
                data[within..within + chunk].copy_from_slice(&buf[..chunk]);
            }
            self.write_block(block, &data)?;
            buf = &buf[chunk..];
            off += chunk as u64;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> WdResult<()> {
        if self.dirty {
            self.header.compressed_size = self.data_end - self.data_start;
            let mut table = Cursor::new(Vec::new());
            for &ptr in &self.pointers {
                table.write_le(&ptr)?;
            }
            for &hash in &self.hashes {
                table.write_le(&hash)?;
            }
            self.file.write_at(GCZ_HEADER_SIZE, &table.into_inner())?;
            let mut head = Cursor::new(Vec::new());
            head.write_le(&self.header)?;
            self.file.write_at(0, &head.into_inner())?;
            self.dirty = false;
        }
        self.file.sync()
    }
}

impl Drop for GczFile {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blocks_round_trip_with_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.gcz");
        {
            let mut gcz = GczFile::create(&path, 4 * 0x8000, 0x8000, false).unwrap();
            gcz.write_at(0, &[1u8; 0x8000]).unwrap();
            gcz.write_at(2 * 0x8000 + 100, b"hello").unwrap();
            gcz.sync().unwrap();
        }
        let mut gcz = GczFile::open(&path, false).unwrap();
        assert_eq!(gcz.size(), 4 * 0x8000);
        let mut buf = [0u8; 8];
        gcz.read_at(0x100, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 8]);
        gcz.read_at(2 * 0x8000 + 98, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0hello\0");
        // untouched block reads zero
        gcz.read_at(3 * 0x8000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn crc_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.gcz");
        {
            let mut gcz = GczFile::create(&path, 0x8000, 0x8000, false).unwrap();
            gcz.write_at(0, &[7u8; 0x8000]).unwrap();
            gcz.sync().unwrap();
        }
        // flip a payload byte behind the table
        let mut raw = std::fs::read(&path).unwrap();
        let len = raw.len();
        raw[len - 1] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();
        let mut gcz = GczFile::open(&path, false).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            gcz.read_at(0x7FF0, &mut buf),
            Err(WdError::Crypto(_))
        ));
    }
}
