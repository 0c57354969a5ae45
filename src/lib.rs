//! Core of a toolkit for reading, authenticating, transforming and rewriting
//! GameCube and Wii optical-disc images.
//!
//! The crate is layered: [`structs`] decodes the fixed-offset on-disc
//! structures, [`container`] provides uniform random access over the image
//! container formats, [`disc`] exposes partitions and the decrypted view,
//! [`crypto`] implements the per-cluster AES/SHA-1 hash tree, and
//! [`pipeline`] drives copy, diff and verify over the sector usage map.

use std::sync::atomic::{AtomicU32, Ordering};

pub mod builder;
pub mod cert;
pub mod container;
pub mod crypto;
pub mod disc;
pub mod dol;
pub mod error;
pub mod fst;
pub mod keys;
pub mod patch;
pub mod pattern;
pub mod pipeline;
pub mod settings;
pub mod sign;
pub mod structs;

pub use error::{WdError, WdResult};

// Disc geometry. The physical DVD sector is 2 KiB; the Wii encryption unit
// is a 32 KiB cluster of 0x400 hash bytes followed by 0x7C00 payload bytes.
pub const SECTOR_SIZE: u64 = 0x800;
pub const CLUSTER_SIZE: u64 = 0x8000;
pub const CLUSTER_HASH_SIZE: u64 = 0x400;
pub const CLUSTER_DATA_OFF: u64 = 0x400;
pub const CLUSTER_DATA_SIZE: u64 = 0x7C00;
pub const SECTORS_PER_CLUSTER: u64 = CLUSTER_SIZE / SECTOR_SIZE;

// H1 covers 8 sibling clusters (a group), H2 covers 8 groups (a supergroup),
// H3 holds one digest per supergroup.
pub const GROUP_CLUSTERS: u64 = 8;
pub const SUPERGROUP_CLUSTERS: u64 = 64;
pub const SUPERGROUP_SIZE: u64 = SUPERGROUP_CLUSTERS * CLUSTER_SIZE;
pub const SUPERGROUP_DATA_SIZE: u64 = SUPERGROUP_CLUSTERS * CLUSTER_DATA_SIZE;

pub const HASH_SIZE: usize = 20;
pub const H3_SIZE: usize = 0x18000;
pub const H3_ENTRIES: usize = 4096;

// Fixed disc-level offsets.
pub const PTAB_OFF: u64 = 0x40000;
pub const REGION_OFF: u64 = 0x4E000;
pub const MAGIC2_OFF: u64 = 0x4FFFC;

/// Size of the partition control area: partition header, TMD, certificate
/// chain and H3 table all live below this offset; encrypted data follows.
pub const PART_CONTROL_SIZE: u64 = 0x20000;

pub const WII_MAGIC: u32 = 0x5D1C_9EA3;
pub const GC_MAGIC: u32 = 0xC233_9F3D;

/// Largest size of a single split part on filesystems without large-file
/// support.
pub const SPLIT_PART_SIZE: u64 = 0x1_0000_0000;

// Process-wide interrupt counter. The OS signal handler (wired up by the
// command layer) bumps it; long running loops poll it between sector groups
// and abort with `WdError::Interrupted`.
static INTERRUPT: AtomicU32 = AtomicU32::new(0);

pub fn request_interrupt() {
    INTERRUPT.fetch_add(1, Ordering::Relaxed);
}

pub fn interrupt_count() -> u32 {
    INTERRUPT.load(Ordering::Relaxed)
}

/// Returns `Err(WdError::Interrupted)` once an interrupt was requested.
pub fn check_interrupt() -> WdResult<()> {
    if interrupt_count() > 0 {
        Err(WdError::Interrupted)
    } else {
        Ok(())
    }
}

#[inline]
pub(crate) fn align_next(num: u64, alignment: u64) -> u64 {
    // only works with a power of 2
    num.wrapping_add(alignment - 1) & !(alignment - 1)
}
