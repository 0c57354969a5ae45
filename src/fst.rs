//! File-system table.
//!
//! The FST is a flat sequence of 12-byte records followed by a name pool.
//! Record 0 is the root directory and holds the total record count in its
//! size field. Directory records store their parent index in `offset` and
//! the index just past their subtree in `size`, so the tree stays index
//! based; names are NUL-terminated strings in the pool.

use std::io::Cursor;

use binrw::{BinReaderExt, BinWriterExt};

use crate::error::{WdError, WdResult};
use crate::structs::{FstItem, FST_ITEM_SIZE};

/// Result of a visitor invocation; `SkipSubtree` prunes a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitAction {
    Continue,
    Stop,
    SkipSubtree,
}

/// One visitor event during an FST walk. `offset` is already scaled to
/// bytes within the partition's cleartext view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FstVisit<'a> {
    EnterDir { path: &'a str },
    LeaveDir { path: &'a str },
    File { path: &'a str, offset: u64, size: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fst {
    items: Vec<FstItem>,
    names: Vec<u8>,
    /// 4 for Wii partitions (offsets stored as off4), 1 for GameCube.
    scale: u64,
}

impl Fst {
    /// Parse an FST blob. `scale` is 4 on Wii and 1 on GameCube.
    pub fn parse(bytes: &[u8], scale: u64) -> WdResult<Fst> {
        if bytes.len() < FST_ITEM_SIZE {
            return Err(WdError::Format("fst: truncated"));
        }
        let mut cur = Cursor::new(bytes);
        let root: FstItem = cur.read_be()?;
        if !root.is_dir() {
            return Err(WdError::Format("fst: root is not a directory"));
        }
        let count = root.size as usize;
        if count == 0 || count.saturating_mul(FST_ITEM_SIZE) > bytes.len() {
            return Err(WdError::Format("fst: record count exceeds file"));
        }
        let mut items = Vec::with_capacity(count);
        items.push(root);
        for _ in 1..count {
            let item: FstItem = cur.read_be()?;
            items.push(item);
        }
        let names = bytes[count * FST_ITEM_SIZE..].to_vec();
        let fst = Fst {
            items,
            names,
            scale,
        };
        fst.validate()?;
        Ok(fst)
    }

    fn validate(&self) -> WdResult<()> {
        let count = self.items.len();
        for (idx, item) in self.items.iter().enumerate().skip(1) {
            if item.name_off() as usize >= self.names.len() {
                return Err(WdError::Format("fst: name offset out of range"));
            }
            if item.is_dir() {
                let end = item.size as usize;
                if end <= idx || end > count {
                    return Err(WdError::Format("fst: directory end out of range"));
                }
                if item.offset as usize >= idx {
                    return Err(WdError::Format("fst: directory parent out of range"));
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> WdResult<Vec<u8>> {
        let mut cur = Cursor::new(Vec::with_capacity(
            self.items.len() * FST_ITEM_SIZE + self.names.len(),
        ));
        for item in &self.items {
            cur.write_be(item)?;
        }
        let mut bytes = cur.into_inner();
        bytes.extend_from_slice(&self.names);
        Ok(bytes)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.len() <= 1
    }

    pub fn scale(&self) -> u64 {
        self.scale
    }

    pub fn item(&self, index: usize) -> Option<&FstItem> {
        self.items.get(index)
    }

    /// Name of a record. A path separator inside a name is a literal
    /// character, not structure.
    pub fn name(&self, index: usize) -> String {
        if index == 0 {
            return String::new();
        }
        let Some(item) = self.items.get(index) else {
            return String::new();
        };
        let off = item.name_off() as usize;
        let tail = &self.names[off.min(self.names.len())..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..end]).into_owned()
    }

    /// Byte offset of a file record within the partition's cleartext view.
    pub fn file_offset(&self, index: usize) -> u64 {
        self.items
            .get(index)
            .map(|item| u64::from(item.offset) * self.scale)
            .unwrap_or(0)
    }

    pub fn set_file_offset(&mut self, index: usize, offset: u64) {
        if let Some(item) = self.items.get_mut(index) {
            item.offset = (offset / self.scale) as u32;
        }
    }

    pub fn set_file_size(&mut self, index: usize, size: u32) {
        if let Some(item) = self.items.get_mut(index) {
            item.size = size;
        }
    }

    /// Walk the tree in record order, invoking `visitor` for directories
    /// (enter and leave) and files. Paths are rooted with '/' and joined
    /// explicitly.
    pub fn visit<V>(&self, visitor: &mut V) -> WdResult<()>
    where
        V: FnMut(FstVisit<'_>) -> VisitAction,
    {
        // stack of (subtree end, path length before entering)
        let mut stack: Vec<(usize, usize)> = Vec::new();
        let mut path = String::from("/");
        let mut idx = 1usize;
        while idx < self.items.len() {
            while let Some(&(end, path_len)) = stack.last() {
                if idx < end {
                    break;
                }
                if visitor(FstVisit::LeaveDir { path: &path }) == VisitAction::Stop {
                    return Ok(());
                }
                path.truncate(path_len);
                stack.pop();
            }
            let item = self.items[idx];
            let name = self.name(idx);
            if item.is_dir() {
                let prev_len = path.len();
                path.push_str(&name);
                path.push('/');
                let action = visitor(FstVisit::EnterDir { path: &path });
                match action {
                    VisitAction::Stop => return Ok(()),
                    VisitAction::SkipSubtree => {
                        path.truncate(prev_len);
                        idx = item.size as usize;
                        continue;
                    }
                    VisitAction::Continue => {
                        stack.push((item.size as usize, prev_len));
                        idx += 1;
                    }
                }
            } else {
                let prev_len = path.len();
                path.push_str(&name);
                let action = visitor(FstVisit::File {
                    path: &path,
                    offset: u64::from(item.offset) * self.scale,
                    size: item.size,
                });
                path.truncate(prev_len);
                match action {
                    VisitAction::Stop => return Ok(()),
                    _ => idx += 1,
                }
            }
        }
        // close directories still open at the end
        while let Some((_, path_len)) = stack.pop() {
            if visitor(FstVisit::LeaveDir { path: &path }) == VisitAction::Stop {
                return Ok(());
            }
            path.truncate(path_len);
        }
        Ok(())
    }

    /// Find a file record by its rooted path (e.g. `/a/b.bin`).
    pub fn find_file(&self, wanted: &str) -> Option<usize> {
        let mut stack: Vec<(usize, usize)> = Vec::new();
        let mut path = String::from("/");
        let mut idx = 1usize;
        while idx < self.items.len() {
            while let Some(&(end, path_len)) = stack.last() {
                if idx < end {
                    break;
                }
                path.truncate(path_len);
                stack.pop();
            }
            let item = self.items[idx];
            let name = self.name(idx);
            if item.is_dir() {
                stack.push((item.size as usize, path.len()));
                path.push_str(&name);
                path.push('/');
            } else {
                let prev_len = path.len();
                path.push_str(&name);
                if path == wanted {
                    return Some(idx);
                }
                path.truncate(prev_len);
            }
            idx += 1;
        }
        None
    }

    /// Number of file records.
    pub fn count_files(&self) -> usize {
        self.items.iter().skip(1).filter(|i| !i.is_dir()).count()
    }
}

/// Incremental FST construction in depth-first order.
#[derive(Debug, Default)]
pub struct FstBuilder {
    items: Vec<FstItem>,
    names: Vec<u8>,
    open_dirs: Vec<usize>,
    scale: u64,
}

impl FstBuilder {
    pub fn new(scale: u64) -> Self {
        FstBuilder {
            items: vec![FstItem::new(true, 0, 0, 0)],
            names: Vec::new(),
            open_dirs: Vec::new(),
            scale,
        }
    }

    fn push_name(&mut self, name: &str) -> u32 {
        let off = self.names.len() as u32;
        self.names.extend_from_slice(name.as_bytes());
        self.names.push(0);
        off
    }

    pub fn begin_dir(&mut self, name: &str) {
        let name_off = self.push_name(name);
        let parent = self.open_dirs.last().copied().unwrap_or(0);
        let index = self.items.len();
        self.items
            .push(FstItem::new(true, name_off, parent as u32, 0));
        self.open_dirs.push(index);
    }

    pub fn end_dir(&mut self) {
        if let Some(index) = self.open_dirs.pop() {
            self.items[index].size = self.items.len() as u32;
        }
    }

    /// Add a file; returns its record index so the caller can patch the
    /// offset once data is laid out.
    pub fn add_file(&mut self, name: &str, offset: u64, size: u32) -> usize {
        let name_off = self.push_name(name);
        let index = self.items.len();
        self.items.push(FstItem::new(
            false,
            name_off,
            (offset / self.scale) as u32,
            size,
        ));
        index
    }

    pub fn finish(mut self) -> Fst {
        while !self.open_dirs.is_empty() {
            self.end_dir();
        }
        self.items[0] = FstItem::new(true, 0, 0, self.items.len() as u32);
        Fst {
            items: self.items,
            names: self.names,
            scale: self.scale,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Fst {
        let mut b = FstBuilder::new(4);
        b.add_file("opening.bnr", 0x100, 0x40);
        b.begin_dir("sound");
        b.add_file("bgm.brstm", 0x200, 0x80);
        b.begin_dir("se");
        b.add_file("hit.wav", 0x400, 0x10);
        b.end_dir();
        b.end_dir();
        b.add_file("last.bin", 0x800, 0x20);
        b.finish()
    }

    #[test]
    fn builds_and_walks() {
        let fst = sample();
        assert_eq!(fst.count_files(), 4);
        let mut events = Vec::new();
        fst.visit(&mut |v| {
            events.push(match v {
                FstVisit::EnterDir { path } => format!("+{path}"),
                FstVisit::LeaveDir { path } => format!("-{path}"),
                FstVisit::File { path, .. } => path.to_owned(),
            });
            VisitAction::Continue
        })
        .unwrap();
        assert_eq!(
            events,
            vec![
                "/opening.bnr",
                "+/sound/",
                "/sound/bgm.brstm",
                "+/sound/se/",
                "/sound/se/hit.wav",
                "-/sound/se/",
                "-/sound/",
                "/last.bin",
            ]
        );
    }

    #[test]
    fn round_trips_through_bytes() {
        let fst = sample();
        let bytes = fst.to_bytes().unwrap();
        let back = Fst::parse(&bytes, 4).unwrap();
        assert_eq!(fst, back);
        assert_eq!(back.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn skip_subtree_prunes() {
        let fst = sample();
        let mut files = Vec::new();
        fst.visit(&mut |v| match v {
            FstVisit::EnterDir { path } if path == "/sound/" => VisitAction::SkipSubtree,
            FstVisit::File { path, .. } => {
                files.push(path.to_owned());
                VisitAction::Continue
            }
            _ => VisitAction::Continue,
        })
        .unwrap();
        assert_eq!(files, vec!["/opening.bnr", "/last.bin"]);
    }

    #[test]
    fn rejects_corrupt_tables() {
        let fst = sample();
        let mut bytes = fst.to_bytes().unwrap();
        // record count larger than the blob
        bytes[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(Fst::parse(&bytes, 4).is_err());
    }

    #[test]
    fn scaled_offsets() {
        let fst = sample();
        // /opening.bnr is record 1
        assert_eq!(fst.file_offset(1), 0x100);
        let bytes = fst.to_bytes().unwrap();
        // stored offset is >>2 for wii
        assert_eq!(
            u32::from_be_bytes(bytes[16..20].try_into().unwrap()),
            0x100 / 4
        );
    }
}
