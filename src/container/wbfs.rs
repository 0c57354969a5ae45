//! WBFS shelf: a multi-slot container storing whole disc images sparsely.
//!
//! Shelf block 0 holds the head (magic, sector-shift pair, slot table) and
//! the per-slot disc infos: a 0x100 copy of the disc header followed by the
//! big-endian block-index table mapping logical disc blocks to shelf
//! blocks. Index 0 means unallocated and reads as zero. Allocation state is
//! derived from the block-index tables, so no free table is persisted.

use std::path::Path;

use crate::container::split::SplitFile;
use crate::error::{WdError, WdResult};
use crate::structs::DISC_HEADER_SIZE;
use crate::CLUSTER_SIZE;

pub const WBFS_MAGIC: [u8; 4] = *b"WBFS";

/// Single-layer Wii disc: 143432 clusters.
pub const WII_DISC_SIZE: u64 = 143432 * CLUSTER_SIZE;

const HD_SEC_SZ_S: u8 = 9; // 512
const WBFS_SEC_SZ_S: u8 = 21; // 2 MiB
const HEAD_FIXED: usize = 12;

#[derive(Debug)]
pub struct WbfsShelf {
    file: SplitFile,
    hd_sec_sz: u64,
    wbfs_sec_sz: u64,
    disc_table: Vec<u8>,
    used_blocks: Vec<bool>,
    dirty: bool,
}

impl WbfsShelf {
    fn blocks_per_disc(&self) -> usize {
        WII_DISC_SIZE.div_ceil(self.wbfs_sec_sz) as usize
    }

    fn disc_info_size(&self) -> u64 {
        let raw = DISC_HEADER_SIZE as u64 + 2 * self.blocks_per_disc() as u64;
        raw.div_ceil(self.hd_sec_sz) * self.hd_sec_sz
    }

    fn max_discs(hd_sec_sz: u64, wbfs_sec_sz: u64) -> usize {
        let info = (DISC_HEADER_SIZE as u64 + 2 * WII_DISC_SIZE.div_ceil(wbfs_sec_sz))
            .div_ceil(hd_sec_sz)
            * hd_sec_sz;
        let by_space = (wbfs_sec_sz - hd_sec_sz) / info;
        (hd_sec_sz as usize - HEAD_FIXED).min(by_space as usize)
    }

    fn disc_info_off(&self, slot: usize) -> u64 {
        self.hd_sec_sz + slot as u64 * self.disc_info_size()
    }

    pub fn create(path: &Path, overwrite: bool) -> WdResult<WbfsShelf> {
        let file = SplitFile::create(path, overwrite)?;
        let hd_sec_sz = 1u64 << HD_SEC_SZ_S;
        let wbfs_sec_sz = 1u64 << WBFS_SEC_SZ_S;
        let mut shelf = WbfsShelf {
            file,
            hd_sec_sz,
            wbfs_sec_sz,
            disc_table: vec![0u8; Self::max_discs(hd_sec_sz, wbfs_sec_sz)],
            used_blocks: vec![true], // block 0 is metadata
            dirty: true,
        };
        shelf.sync()?;
        Ok(shelf)
    }

    pub fn open(path: &Path, writable: bool) -> WdResult<WbfsShelf> {
        let mut file = SplitFile::open(path, writable)?;
        let mut head = vec![0u8; 0x200];
        file.read_at(0, &mut head)?;
        if head[..4] != WBFS_MAGIC {
            return Err(WdError::Format("wbfs: bad magic"));
        }
        let hd_sec_sz = 1u64 << head[8];
        let wbfs_sec_sz = 1u64 << head[9];
        if hd_sec_sz < 0x200 || wbfs_sec_sz <= hd_sec_sz {
            return Err(WdError::Format("wbfs: bad sector shifts"));
        }
        let max_discs = Self::max_discs(hd_sec_sz, wbfs_sec_sz);
        let mut head = vec![0u8; HEAD_FIXED + max_discs];
        file.read_at(0, &mut head)?;
        let disc_table = head[HEAD_FIXED..].to_vec();
        let mut shelf = WbfsShelf {
            file,
            hd_sec_sz,
            wbfs_sec_sz,
            disc_table,
            used_blocks: vec![true],
            dirty: false,
        };
        // rebuild allocation state from every slot's block-index table
        for slot in 0..shelf.disc_table.len() {
            if shelf.disc_table[slot] == 0 {
                continue;
            }
            for block in shelf.read_wlba(slot)? {
                if block != 0 {
                    shelf.mark_used(block as usize);
                }
            }
        }
        Ok(shelf)
    }

    fn mark_used(&mut self, block: usize) {
        if self.used_blocks.len() <= block {
            self.used_blocks.resize(block + 1, false);
        }
        self.used_blocks[block] = true;
    }

    fn alloc_block(&mut self) -> u16 {
        let block = (1..self.used_blocks.len())
            .find(|&i| !self.used_blocks[i])
            .unwrap_or(self.used_blocks.len());
        self.mark_used(block);
        block as u16
    }

    fn read_wlba(&mut self, slot: usize) -> WdResult<Vec<u16>> {
        let n = self.blocks_per_disc();
        let mut raw = vec![0u8; 2 * n];
        let off = self.disc_info_off(slot) + DISC_HEADER_SIZE as u64;
        self.file.read_at(off, &mut raw)?;
        Ok(raw
            .chunks_exact(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .collect())
    }

    fn write_wlba(&mut self, slot: usize, wlba: &[u16]) -> WdResult<()> {
        let mut raw = Vec::with_capacity(wlba.len() * 2);
        for &b in wlba {
            raw.extend_from_slice(&b.to_be_bytes());
        }
        let off = self.disc_info_off(slot) + DISC_HEADER_SIZE as u64;
        self.file.write_at(off, &raw)
    }

    pub fn slot_header(&mut self, slot: usize) -> WdResult<Vec<u8>> {
        let mut header = vec![0u8; DISC_HEADER_SIZE];
        self.file.read_at(self.disc_info_off(slot), &mut header)?;
        Ok(header)
    }

    pub fn slot_count(&self) -> usize {
        self.disc_table.iter().filter(|&&b| b != 0).count()
    }

    /// All occupied slots with their id6.
    pub fn list_slots(&mut self) -> WdResult<Vec<(usize, String)>> {
        let mut out = Vec::new();
        for slot in 0..self.disc_table.len() {
            if self.disc_table[slot] == 0 {
                continue;
            }
            let header = self.slot_header(slot)?;
            out.push((slot, String::from_utf8_lossy(&header[..6]).into_owned()));
        }
        Ok(out)
    }

    pub fn find_slot(&mut self, id6: &str) -> WdResult<Option<usize>> {
        Ok(self
            .list_slots()?
            .into_iter()
            .find(|(_, id)| id == id6)
            .map(|(slot, _)| slot))
    }

    /// Add an empty disc with the given 0x100 header. Returns the slot.
    pub fn create_slot(&mut self, header: &[u8]) -> WdResult<usize> {
        if header.len() != DISC_HEADER_SIZE {
            return Err(WdError::Format("wbfs: disc header size"));
        }
        let slot = self
            .disc_table
            .iter()
            .position(|&b| b == 0)
            .ok_or(WdError::Format("wbfs: shelf full"))?;
        self.disc_table[slot] = 1;
        self.file.write_at(self.disc_info_off(slot), header)?;
        let wlba = vec![0u16; self.blocks_per_disc()];
        self.write_wlba(slot, &wlba)?;
        self.dirty = true;
        Ok(slot)
    }

    pub fn remove_slot(&mut self, id6: &str) -> WdResult<()> {
        let slot = self
            .find_slot(id6)?
            .ok_or_else(|| WdError::Missing(format!("wbfs slot {id6}")))?;
        for block in self.read_wlba(slot)? {
            if (block as usize) < self.used_blocks.len() {
                self.used_blocks[block as usize] = false;
            }
        }
        self.used_blocks[0] = true;
        self.disc_table[slot] = 0;
        self.dirty = true;
        self.sync()
    }

    /// Number of fragments (runs of non-contiguous shelf blocks) of a slot.
    pub fn fragments(&mut self, slot: usize) -> WdResult<usize> {
        let wlba = self.read_wlba(slot)?;
        let mut fragments = 0;
        let mut prev = 0u16;
        for &block in &wlba {
            if block != 0 {
                if prev == 0 || block != prev + 1 {
                    fragments += 1;
                }
            }
            prev = block;
        }
        Ok(fragments)
    }

    /// Rewrite a slot's id6 (and optionally its title) in the shelf copy of
    /// the disc header.
    pub fn rename_slot(&mut self, slot: usize, id6: &str, title: Option<&str>) -> WdResult<()> {
        let mut header = self.slot_header(slot)?;
        let id = id6.as_bytes();
        if id.len() != 6 {
            return Err(WdError::Syntax(format!("'{id6}' is not a valid id6")));
        }
        header[..6].copy_from_slice(id);
        if let Some(title) = title {
            let field = &mut header[0x20..0x60];
            field.fill(0);
            let n = title.len().min(field.len() - 1);
            field[..n].copy_from_slice(&title.as_bytes()[..n]);
        }
        self.file.write_at(self.disc_info_off(slot), &header)?;
        self.dirty = true;
        Ok(())
    }

    pub fn open_slot(mut self, slot: usize) -> WdResult<WbfsDisc> {
        if self.disc_table.get(slot).copied().unwrap_or(0) == 0 {
            return Err(WdError::Missing(format!("wbfs slot {slot}")));
        }
        let wlba = self.read_wlba(slot)?;
        Ok(WbfsDisc {
            shelf: self,
            slot,
            wlba,
            dirty: false,
        })
    }

    pub fn sync(&mut self) -> WdResult<()> {
        if self.dirty {
            let total = self.used_blocks.len() as u64 * self.wbfs_sec_sz;
            let mut head = vec![0u8; HEAD_FIXED + self.disc_table.len()];
            head[..4].copy_from_slice(&WBFS_MAGIC);
            head[4..8].copy_from_slice(&((total / self.hd_sec_sz) as u32).to_be_bytes());
            head[8] = self.hd_sec_sz.trailing_zeros() as u8;
            head[9] = self.wbfs_sec_sz.trailing_zeros() as u8;
            head[HEAD_FIXED..].copy_from_slice(&self.disc_table);
            self.file.write_at(0, &head)?;
            self.dirty = false;
        }
        self.file.sync()
    }
}

/// A disc-shaped virtual view into one shelf slot.
#[derive(Debug)]
pub struct WbfsDisc {
    shelf: WbfsShelf,
    slot: usize,
    wlba: Vec<u16>,
    dirty: bool,
}

impl WbfsDisc {
    pub fn size(&self) -> u64 {
        self.wlba.len() as u64 * self.shelf.wbfs_sec_sz
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn shelf_mut(&mut self) -> &mut WbfsShelf {
        &mut self.shelf
    }

    pub fn read_at(&mut self, mut off: u64, mut buf: &mut [u8]) -> WdResult<()> {
        let bs = self.shelf.wbfs_sec_sz;
        while !buf.is_empty() {
            let block = (off / bs) as usize;
            let within = off % bs;
            let chunk = ((bs - within) as usize).min(buf.len());
            let (head, tail) = buf.split_at_mut(chunk);
            match self.wlba.get(block).copied().unwrap_or(0) {
                0 => head.fill(0),
                shelf_block => {
                    self.shelf
                        .file
                        .read_at(u64::from(shelf_block) * bs + within, head)?;
                }
            }
            buf = tail;
            off += chunk as u64;
        }
        Ok(())
    }

    pub fn write_at(&mut self, mut off: u64, mut buf: &[u8]) -> WdResult<()> {
        let bs = self.shelf.wbfs_sec_sz;
        while !buf.is_empty() {
            let block = (off / bs) as usize;
            let within = off % bs;
            let chunk = ((bs - within) as usize).min(buf.len());
            if block >= self.wlba.len() {
                return Err(WdError::Format("wbfs: write beyond disc size"));
            }
            let mut shelf_block = self.wlba[block];
            if shelf_block == 0 {
                shelf_block = self.shelf.alloc_block();
                self.wlba[block] = shelf_block;
                self.dirty = true;
                if within != 0 || chunk < bs as usize {
                    let zero = vec![0u8; bs as usize];
                    self.shelf
                        .file
                        .write_at(u64::from(shelf_block) * bs, &zero)?;
                }
            }
            self.shelf
                .file
                .write_at(u64::from(shelf_block) * bs + within, &buf[..chunk])?;
            buf = &buf[chunk..];
            off += chunk as u64;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> WdResult<()> {
        if self.dirty {
            let wlba = self.wlba.clone();
            self.shelf.write_wlba(self.slot, &wlba)?;
            self.shelf.dirty = true;
            self.dirty = false;
        }
        self.shelf.sync()
    }
}

impl Drop for WbfsDisc {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shelf_slots_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shelf.wbfs");
        let mut shelf = WbfsShelf::create(&path, false).unwrap();
        let mut header = vec![0u8; DISC_HEADER_SIZE];
        header[..6].copy_from_slice(b"RMCP01");
        let slot = shelf.create_slot(&header).unwrap();
        assert_eq!(shelf.list_slots().unwrap(), vec![(slot, "RMCP01".into())]);

        let mut disc = shelf.open_slot(slot).unwrap();
        disc.write_at(0, &header).unwrap();
        disc.write_at(0x10_0000, b"deep data").unwrap();
        disc.sync().unwrap();
        drop(disc);

        let shelf = WbfsShelf::open(&path, true).unwrap();
        let mut disc = shelf.open_slot(slot).unwrap();
        let mut buf = [0u8; 9];
        disc.read_at(0x10_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"deep data");
        // unallocated block reads zero
        let mut buf = [0xAAu8; 16];
        disc.read_at(WII_DISC_SIZE - 0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn remove_and_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shelf.wbfs");
        let mut shelf = WbfsShelf::create(&path, false).unwrap();
        let mut header = vec![0u8; DISC_HEADER_SIZE];
        header[..6].copy_from_slice(b"RSPE01");
        let slot = shelf.create_slot(&header).unwrap();
        let mut disc = shelf.open_slot(slot).unwrap();
        // two non-adjacent logical blocks get adjacent shelf blocks
        disc.write_at(0, b"a").unwrap();
        disc.write_at(5 * 0x20_0000, b"b").unwrap();
        disc.sync().unwrap();
        let shelf = disc.shelf_mut();
        assert_eq!(shelf.fragments(slot).unwrap(), 2);
        shelf.remove_slot("RSPE01").unwrap();
        assert_eq!(shelf.slot_count(), 0);
    }

    #[test]
    fn rename_updates_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shelf.wbfs");
        let mut shelf = WbfsShelf::create(&path, false).unwrap();
        let mut header = vec![0u8; DISC_HEADER_SIZE];
        header[..6].copy_from_slice(b"RMCP01");
        let slot = shelf.create_slot(&header).unwrap();
        shelf.rename_slot(slot, "RMCJ01", Some("new title")).unwrap();
        assert_eq!(shelf.find_slot("RMCJ01").unwrap(), Some(slot));
        let header = shelf.slot_header(slot).unwrap();
        assert_eq!(&header[0x20..0x29], b"new title");
    }
}
