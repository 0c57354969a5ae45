//! Cluster cryptography and the SHA-1 hash tree.
//!
//! Every 32 KiB cluster is AES-128-CBC encrypted with the partition's title
//! key. The hash area (first 0x400 bytes) uses an all-zero IV; the payload IV
//! is taken from bytes 0x3D0..0x3E0 of the *encrypted* hash area. The hash
//! tree has four levels: H0 digests of the 31 payload sub-blocks live in the
//! cluster, H1 spans the 8 clusters of a group, H2 the 8 groups of a
//! supergroup, and H3 (one digest per supergroup) lives in the partition's
//! H3 table whose own digest is pinned by the first TMD content record.

use std::collections::BTreeSet;

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use sha1::{Digest, Sha1};

use crate::error::{WdError, WdResult};
use crate::keys::CommonKeys;
use crate::structs::{Ticket, Tmd};
use crate::{
    CLUSTER_SIZE, GROUP_CLUSTERS, HASH_SIZE, H3_SIZE, SUPERGROUP_CLUSTERS, SUPERGROUP_SIZE,
};

pub type Aes128CbcEnc = cbc::Encryptor<Aes128>;
pub type Aes128CbcDec = cbc::Decryptor<Aes128>;

const H0_OFF: usize = 0x000;
const H0_LEN: usize = 31 * HASH_SIZE; // 0x26C
const H1_OFF: usize = 0x280;
const H1_LEN: usize = 8 * HASH_SIZE;
const H2_OFF: usize = 0x340;
const H2_LEN: usize = 8 * HASH_SIZE;
const HASH_AREA: usize = 0x400;
const PAYLOAD_IV_OFF: usize = 0x3D0;
const SUB_BLOCK: usize = 0x400;

pub const TITLE_KEY_SIZE: usize = 16;

fn sha1(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// AES-CBC IV used to wrap the title key: the 8-byte title id padded with
/// zeros.
pub fn title_key_iv(ticket: &Ticket) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&ticket.title_id);
    iv
}

/// Decrypt the 16-byte title-key field under the common key selected by the
/// ticket's common-key-index byte.
pub fn unwrap_title_key(ticket: &Ticket, keys: &CommonKeys) -> WdResult<[u8; TITLE_KEY_SIZE]> {
    let common = keys.for_index(ticket.common_key_index)?;
    let iv = title_key_iv(ticket);
    let mut buf = ticket.title_key;
    Aes128CbcDec::new(common.into(), iv.as_ref().into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| WdError::Crypto("title key unwrap failed".into()))?;
    Ok(buf)
}

/// Decrypt one cluster in place: payload first (its IV is part of the still
/// encrypted hash area), then the hash area with a zero IV.
pub fn decrypt_cluster(cluster: &mut [u8], key: &[u8; TITLE_KEY_SIZE]) -> WdResult<()> {
    debug_assert_eq!(cluster.len(), CLUSTER_SIZE as usize);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&cluster[PAYLOAD_IV_OFF..PAYLOAD_IV_OFF + 16]);
    Aes128CbcDec::new(key.into(), iv.as_ref().into())
        .decrypt_padded_mut::<NoPadding>(&mut cluster[HASH_AREA..])
        .map_err(|_| WdError::Crypto("cluster payload decrypt failed".into()))?;
    Aes128CbcDec::new(key.into(), [0u8; 16].as_ref().into())
        .decrypt_padded_mut::<NoPadding>(&mut cluster[..HASH_AREA])
        .map_err(|_| WdError::Crypto("cluster hash decrypt failed".into()))?;
    Ok(())
}

/// Decrypt only the payload of a cluster, leaving the hash area encrypted.
pub fn decrypt_cluster_data(cluster: &mut [u8], key: &[u8; TITLE_KEY_SIZE]) -> WdResult<()> {
    debug_assert_eq!(cluster.len(), CLUSTER_SIZE as usize);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&cluster[PAYLOAD_IV_OFF..PAYLOAD_IV_OFF + 16]);
    Aes128CbcDec::new(key.into(), iv.as_ref().into())
        .decrypt_padded_mut::<NoPadding>(&mut cluster[HASH_AREA..])
        .map_err(|_| WdError::Crypto("cluster payload decrypt failed".into()))?;
    Ok(())
}

/// Encrypt one cluster in place: hash area first with a zero IV, then the
/// payload keyed off the now-encrypted bytes 0x3D0..0x3E0.
pub fn encrypt_cluster(cluster: &mut [u8], key: &[u8; TITLE_KEY_SIZE]) -> WdResult<()> {
    debug_assert_eq!(cluster.len(), CLUSTER_SIZE as usize);
    Aes128CbcEnc::new(key.into(), [0u8; 16].as_ref().into())
        .encrypt_padded_mut::<NoPadding>(&mut cluster[..HASH_AREA], HASH_AREA)
        .map_err(|_| WdError::Crypto("cluster hash encrypt failed".into()))?;
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&cluster[PAYLOAD_IV_OFF..PAYLOAD_IV_OFF + 16]);
    let payload_len = CLUSTER_SIZE as usize - HASH_AREA;
    Aes128CbcEnc::new(key.into(), iv.as_ref().into())
        .encrypt_padded_mut::<NoPadding>(&mut cluster[HASH_AREA..], payload_len)
        .map_err(|_| WdError::Crypto("cluster payload encrypt failed".into()))?;
    Ok(())
}

/// Recompute the complete hash metadata of one decrypted supergroup (64
/// clusters) in place and return its H3 digest.
pub fn rebuild_supergroup(buf: &mut [u8]) -> [u8; HASH_SIZE] {
    debug_assert_eq!(buf.len(), SUPERGROUP_SIZE as usize);
    let group_size = (GROUP_CLUSTERS * CLUSTER_SIZE) as usize;
    let mut hasher = Sha1::new();
    let mut h2 = [0u8; H2_LEN];
    for g in 0..GROUP_CLUSTERS as usize {
        let group = &mut buf[g * group_size..][..group_size];
        let mut h1 = [0u8; H1_LEN];
        for c in 0..GROUP_CLUSTERS as usize {
            let cluster = &mut group[c * CLUSTER_SIZE as usize..][..CLUSTER_SIZE as usize];
            let mut h0 = [0u8; H0_LEN];
            for j in 0..31 {
                hasher.update(&cluster[(j + 1) * SUB_BLOCK..][..SUB_BLOCK]);
                h0[j * HASH_SIZE..][..HASH_SIZE].copy_from_slice(&hasher.finalize_reset());
            }
            hasher.update(h0);
            h1[c * HASH_SIZE..][..HASH_SIZE].copy_from_slice(&hasher.finalize_reset());
            cluster[H0_OFF..H0_OFF + H0_LEN].copy_from_slice(&h0);
            cluster[H0_OFF + H0_LEN..H1_OFF].fill(0);
        }
        hasher.update(h1);
        h2[g * HASH_SIZE..][..HASH_SIZE].copy_from_slice(&hasher.finalize_reset());
        for c in 0..GROUP_CLUSTERS as usize {
            let cluster = &mut group[c * CLUSTER_SIZE as usize..][..CLUSTER_SIZE as usize];
            cluster[H1_OFF..H1_OFF + H1_LEN].copy_from_slice(&h1);
            cluster[H1_OFF + H1_LEN..H2_OFF].fill(0);
        }
    }
    hasher.update(h2);
    let h3: [u8; HASH_SIZE] = hasher.finalize_reset().into();
    for g in 0..GROUP_CLUSTERS as usize {
        let group = &mut buf[g * group_size..][..group_size];
        for c in 0..GROUP_CLUSTERS as usize {
            let cluster = &mut group[c * CLUSTER_SIZE as usize..][..CLUSTER_SIZE as usize];
            cluster[H2_OFF..H2_OFF + H2_LEN].copy_from_slice(&h2);
            cluster[H2_OFF + H2_LEN..HASH_AREA].fill(0);
        }
    }
    h3
}

/// Encrypt a whole decrypted supergroup in place.
pub fn encrypt_supergroup(buf: &mut [u8], key: &[u8; TITLE_KEY_SIZE]) -> WdResult<()> {
    debug_assert_eq!(buf.len(), SUPERGROUP_SIZE as usize);
    for c in 0..SUPERGROUP_CLUSTERS as usize {
        encrypt_cluster(
            &mut buf[c * CLUSTER_SIZE as usize..][..CLUSTER_SIZE as usize],
            key,
        )?;
    }
    Ok(())
}

/// Decrypt a whole encrypted supergroup in place.
pub fn decrypt_supergroup(buf: &mut [u8], key: &[u8; TITLE_KEY_SIZE]) -> WdResult<()> {
    debug_assert_eq!(buf.len(), SUPERGROUP_SIZE as usize);
    for c in 0..SUPERGROUP_CLUSTERS as usize {
        decrypt_cluster(
            &mut buf[c * CLUSTER_SIZE as usize..][..CLUSTER_SIZE as usize],
            key,
        )?;
    }
    Ok(())
}

/// Result of checking a single decrypted cluster against its stored hashes.
/// Each level is verifiable from the cluster alone: a cluster stores the
/// full H1 vector of its group and the full H2 vector of its supergroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterCheck {
    pub h0_bad: u32,
    pub h1_bad: bool,
    pub h2_bad: bool,
}

impl ClusterCheck {
    pub fn is_ok(&self) -> bool {
        self.h0_bad == 0 && !self.h1_bad && !self.h2_bad
    }
}

/// Verify the H0 digests of a decrypted cluster and its own H1 entry.
pub fn verify_cluster(cluster: &[u8], cluster_in_group: usize) -> ClusterCheck {
    debug_assert_eq!(cluster.len(), CLUSTER_SIZE as usize);
    let mut check = ClusterCheck::default();
    let mut hasher = Sha1::new();
    for j in 0..31 {
        hasher.update(&cluster[(j + 1) * SUB_BLOCK..][..SUB_BLOCK]);
        let digest = hasher.finalize_reset();
        if digest.as_slice() != &cluster[H0_OFF + j * HASH_SIZE..][..HASH_SIZE] {
            check.h0_bad += 1;
        }
    }
    let h1 = sha1(&cluster[H0_OFF..H0_OFF + H0_LEN]);
    check.h1_bad = h1 != cluster[H1_OFF + cluster_in_group * HASH_SIZE..][..HASH_SIZE];
    check
}

/// Verify a cluster's stored H2 entry for its group.
pub fn verify_cluster_h2(cluster: &[u8], group_in_supergroup: usize) -> bool {
    let h2 = sha1(&cluster[H1_OFF..H1_OFF + H1_LEN]);
    h2 == cluster[H2_OFF + group_in_supergroup * HASH_SIZE..][..HASH_SIZE]
}

/// H3 digest of a decrypted cluster's H2 area; equal for every cluster of a
/// supergroup.
pub fn cluster_h3_digest(cluster: &[u8]) -> [u8; HASH_SIZE] {
    sha1(&cluster[H2_OFF..H2_OFF + H2_LEN])
}

/// Digest of the whole H3 table, stored in `tmd.contents[0].hash`.
pub fn h3_table_digest(h3: &[u8]) -> [u8; HASH_SIZE] {
    debug_assert_eq!(h3.len(), H3_SIZE);
    sha1(h3)
}

/// Batches dirty clusters and finalizes the H3 table and TMD content hash
/// once. Rebuild is monotonic: a dirty cluster dirties its whole supergroup.
#[derive(Debug, Default)]
pub struct HashTreeBuilder {
    dirty: BTreeSet<u64>,
}

impl HashTreeBuilder {
    pub fn new() -> Self {
        HashTreeBuilder::default()
    }

    pub fn mark_cluster(&mut self, cluster: u64) {
        self.dirty.insert(cluster / SUPERGROUP_CLUSTERS);
    }

    pub fn mark_supergroup(&mut self, supergroup: u64) {
        self.dirty.insert(supergroup);
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    /// Rehash every dirty supergroup via `rehash` (which returns the new H3
    /// digest for the given supergroup index), then refresh the TMD content
    /// record.
    pub fn finalize<F>(self, h3: &mut [u8], tmd: &mut Tmd, mut rehash: F) -> WdResult<()>
    where
        F: FnMut(u64) -> WdResult<[u8; HASH_SIZE]>,
    {
        debug_assert_eq!(h3.len(), H3_SIZE);
        for supergroup in self.dirty {
            let digest = rehash(supergroup)?;
            let off = supergroup as usize * HASH_SIZE;
            if off + HASH_SIZE > h3.len() {
                return Err(WdError::Format("h3 table"));
            }
            h3[off..off + HASH_SIZE].copy_from_slice(&digest);
        }
        let content = tmd
            .contents
            .first_mut()
            .ok_or(WdError::Format("tmd content"))?;
        content.hash = h3_table_digest(h3);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_supergroup() -> Vec<u8> {
        let mut buf = vec![0u8; SUPERGROUP_SIZE as usize];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        buf
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [0x42u8; 16];
        let mut buf = test_supergroup();
        rebuild_supergroup(&mut buf);
        let plain = buf.clone();
        encrypt_supergroup(&mut buf, &key).unwrap();
        assert_ne!(buf, plain);
        decrypt_supergroup(&mut buf, &key).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn rebuilt_tree_verifies() {
        let mut buf = test_supergroup();
        let h3 = rebuild_supergroup(&mut buf);
        for c in 0..SUPERGROUP_CLUSTERS as usize {
            let cluster = &buf[c * CLUSTER_SIZE as usize..][..CLUSTER_SIZE as usize];
            let check = verify_cluster(cluster, c % GROUP_CLUSTERS as usize);
            assert!(check.is_ok(), "cluster {c}: {check:?}");
            assert!(verify_cluster_h2(cluster, c / GROUP_CLUSTERS as usize));
            assert_eq!(cluster_h3_digest(cluster), h3);
        }
    }

    #[test]
    fn corruption_is_detected() {
        let mut buf = test_supergroup();
        rebuild_supergroup(&mut buf);
        // flip one payload byte of cluster 9
        let off = 9 * CLUSTER_SIZE as usize + HASH_AREA + 123;
        buf[off] ^= 0xFF;
        let cluster = &buf[9 * CLUSTER_SIZE as usize..][..CLUSTER_SIZE as usize];
        let check = verify_cluster(cluster, 1);
        assert_eq!(check.h0_bad, 1);
        assert!(!check.h1_bad);
    }

    #[test]
    fn title_key_unwrap_uses_title_id_iv() {
        use crate::keys::{CommonKeys, KeySlot};
        let mut keys = CommonKeys::default();
        keys.set(KeySlot::Standard, [3; 16]);

        let mut ticket = Ticket::default();
        ticket.title_id.copy_from_slice(b"\0\x01\0\0WIID");

        // encrypt a known key the same way the platform does
        let plain = [0xABu8; 16];
        let mut wrapped = plain;
        let iv = title_key_iv(&ticket);
        Aes128CbcEnc::new((&[3u8; 16]).into(), iv.as_ref().into())
            .encrypt_padded_mut::<NoPadding>(&mut wrapped, 16)
            .unwrap();
        ticket.title_key = wrapped;

        assert_eq!(unwrap_title_key(&ticket, &keys).unwrap(), plain);
    }

    #[test]
    fn builder_updates_h3_and_tmd() {
        use crate::structs::TmdContent;
        let mut h3 = vec![0u8; H3_SIZE];
        let mut tmd = Tmd::default();
        tmd.contents.push(TmdContent::default());

        let mut builder = HashTreeBuilder::new();
        builder.mark_cluster(0);
        builder.mark_cluster(65); // supergroup 1
        builder
            .finalize(&mut h3, &mut tmd, |sg| Ok([sg as u8 + 1; HASH_SIZE]))
            .unwrap();
        assert_eq!(&h3[..HASH_SIZE], &[1u8; HASH_SIZE]);
        assert_eq!(&h3[HASH_SIZE..2 * HASH_SIZE], &[2u8; HASH_SIZE]);
        assert_eq!(tmd.contents[0].hash, h3_table_digest(&h3));
    }
}
