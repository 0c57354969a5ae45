//! Extracted FST trees as image sources.
//!
//! Opening a tree synthesizes the complete (encrypted, for Wii) disc image
//! into a spill file; reads then serve the synthesized bytes. Writing goes
//! through extraction, not through `write_at`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::builder;
use crate::error::WdResult;
use crate::keys::CommonKeys;
use crate::settings::Settings;

static SPILL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn spill_path() -> PathBuf {
    let n = SPILL_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("wd-fst-{}-{}.img", std::process::id(), n))
}

#[derive(Debug)]
pub struct FstTreeImage {
    spill: File,
    spill_path: PathBuf,
    size: u64,
}

impl FstTreeImage {
    pub fn open(dir: &Path) -> WdResult<FstTreeImage> {
        let keys = CommonKeys::load(Settings::get().key_dir.as_deref());
        Self::open_with_keys(dir, &keys)
    }

    pub fn open_with_keys(dir: &Path, keys: &CommonKeys) -> WdResult<FstTreeImage> {
        let spill_path = spill_path();
        let mut spill = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&spill_path)?;
        let built = builder::build_from_fst_tree(dir, &mut spill, keys);
        if let Err(err) = built {
            let _ = std::fs::remove_file(&spill_path);
            return Err(err);
        }
        let size = spill.seek(SeekFrom::End(0))?;
        Ok(FstTreeImage {
            spill,
            spill_path,
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_at(&mut self, off: u64, buf: &mut [u8]) -> WdResult<()> {
        if off >= self.size {
            buf.fill(0);
            return Ok(());
        }
        self.spill.seek(SeekFrom::Start(off))?;
        let avail = ((self.size - off) as usize).min(buf.len());
        self.spill.read_exact(&mut buf[..avail])?;
        buf[avail..].fill(0);
        Ok(())
    }
}

impl Drop for FstTreeImage {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.spill_path);
    }
}
