//! Common-key slot set.
//!
//! The ticket's `common_key_index` byte selects one of a fixed set of AES
//! common keys. Key material is never part of this crate; the slots are
//! filled once from the configured key directory. A slot that was never
//! loaded stays zero and is rejected when a title key unwrap asks for it.

use std::fs;
use std::path::Path;

use crate::error::{WdError, WdResult};

pub const KEY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Standard,
    Korean,
    Debug,
}

impl KeySlot {
    pub const ALL: [KeySlot; 3] = [KeySlot::Standard, KeySlot::Korean, KeySlot::Debug];

    pub fn index(&self) -> usize {
        match self {
            KeySlot::Standard => 0,
            KeySlot::Korean => 1,
            KeySlot::Debug => 2,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            KeySlot::Standard => "common-key.bin",
            KeySlot::Korean => "korean-key.bin",
            KeySlot::Debug => "debug-key.bin",
        }
    }

    pub fn from_index(index: u8) -> Option<KeySlot> {
        KeySlot::ALL.get(usize::from(index)).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommonKeys {
    keys: [[u8; KEY_SIZE]; 3],
    loaded: [bool; 3],
}

impl CommonKeys {
    /// Load all available key files from `dir`. Missing files leave their
    /// slot empty; that is only an error once a ticket references the slot.
    pub fn load(dir: Option<&Path>) -> Self {
        let mut keys = CommonKeys::default();
        let Some(dir) = dir else {
            return keys;
        };
        for slot in KeySlot::ALL {
            let path = dir.join(slot.file_name());
            match fs::read(&path) {
                Ok(data) if data.len() == KEY_SIZE => {
                    keys.keys[slot.index()].copy_from_slice(&data);
                    keys.loaded[slot.index()] = true;
                }
                Ok(_) => {
                    tracing::warn!(path = %path.display(), "ignoring key file with bad size");
                }
                Err(_) => {}
            }
        }
        keys
    }

    /// Install key material directly (tests, embedders with their own
    /// key source).
    pub fn set(&mut self, slot: KeySlot, key: [u8; KEY_SIZE]) {
        self.keys[slot.index()] = key;
        self.loaded[slot.index()] = true;
    }

    pub fn is_loaded(&self, slot: KeySlot) -> bool {
        self.loaded[slot.index()]
    }

    /// Key for a ticket's `common_key_index` byte.
    pub fn for_index(&self, index: u8) -> WdResult<&[u8; KEY_SIZE]> {
        let slot = KeySlot::from_index(index)
            .ok_or_else(|| WdError::Crypto(format!("unknown common key index {index}")))?;
        if !self.loaded[slot.index()] {
            return Err(WdError::Crypto(format!(
                "common key slot {index} not loaded (missing {})",
                slot.file_name()
            )));
        }
        Ok(&self.keys[slot.index()])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unloaded_slot_is_rejected() {
        let keys = CommonKeys::default();
        assert!(keys.for_index(0).is_err());
        assert!(keys.for_index(9).is_err());
    }

    #[test]
    fn set_and_get() {
        let mut keys = CommonKeys::default();
        keys.set(KeySlot::Korean, [7; KEY_SIZE]);
        assert!(!keys.is_loaded(KeySlot::Standard));
        assert_eq!(keys.for_index(1).unwrap(), &[7; KEY_SIZE]);
    }
}
