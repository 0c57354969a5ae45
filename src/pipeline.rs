//! Copy, scrub, diff, verify and extract pipelines over the sector usage
//! map.

use std::fs;
use std::io::Seek;
use std::path::Path;

use crate::builder::{DiscBuilder, PartitionSource};
use crate::container::Superfile;
use crate::crypto::{self, HashTreeBuilder};
use crate::disc::{FileKind, PrefixMode, Selection, WiiDisc, USAGE_UNUSED};
use crate::error::{WdError, WdResult};
use crate::fst::Fst;
use crate::keys::CommonKeys;
use crate::pattern::FilePattern;
use crate::sign;
use crate::structs::{Boot, Ticket, Tmd, BOOT_SIZE, REGION_SIZE};
use crate::{
    check_interrupt, CLUSTER_DATA_SIZE, CLUSTER_SIZE, REGION_OFF, SECTOR_SIZE,
    SUPERGROUP_CLUSTERS, SUPERGROUP_SIZE,
};

/// Marker written into skeletonized images.
pub const SKELETON_MARKER: &[u8; 10] = b"[SKELETON]";
const SKELETON_MARKER_OFF: u64 = REGION_OFF + REGION_SIZE as u64;

const COPY_CHUNK: u64 = 0x10_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// copy every byte of the logical image
    Raw,
    /// copy only sectors the usage map marks as used; the rest become holes
    #[default]
    Scrub,
}

fn copy_range(src: &mut WiiDisc, dest: &mut Superfile, mut off: u64, end: u64) -> WdResult<()> {
    let mut buf = vec![0u8; COPY_CHUNK as usize];
    while off < end {
        check_interrupt()?;
        let chunk = (end - off).min(COPY_CHUNK) as usize;
        src.read_raw(off, &mut buf[..chunk])?;
        dest.write_at(off, &buf[..chunk])?;
        off += chunk as u64;
    }
    Ok(())
}

/// Copy a disc onto a destination superfile, honoring pending patches.
/// Scrub mode skips unused sectors (they read back as zeros).
pub fn copy_disc(src: &mut WiiDisc, dest: &mut Superfile, mode: CopyMode) -> WdResult<()> {
    let size = src.size();
    dest.set_size(size)?;
    match mode {
        CopyMode::Raw => copy_range(src, dest, 0, size)?,
        CopyMode::Scrub => {
            let map = src.build_usage_map()?;
            let mut sector = 0usize;
            while sector < map.len() {
                if map[sector] == USAGE_UNUSED {
                    sector += 1;
                    continue;
                }
                let start = sector;
                while sector < map.len() && map[sector] != USAGE_UNUSED {
                    sector += 1;
                }
                let lo = start as u64 * SECTOR_SIZE;
                let hi = (sector as u64 * SECTOR_SIZE).min(size);
                copy_range(src, dest, lo, hi)?;
            }
        }
    }
    rewrite_patched_partitions(src, Some(dest))?;
    dest.sync()
}

/// Re-encrypt the supergroups touched by cleartext patches and fix the
/// hash chain (H0..H3, TMD content hash). With `dest` the result goes to a
/// copy target; without it, back into the disc's own image (each
/// supergroup is read before it is overwritten).
fn rewrite_patched_partitions(
    src: &mut WiiDisc,
    mut dest: Option<&mut Superfile>,
) -> WdResult<()> {
    for index in 0..src.partition_count() {
        let patched: Vec<(u64, Vec<u8>)> = {
            let part = src.partition(index).unwrap();
            part.patches.iter().map(|(o, d)| (o, d.to_vec())).collect()
        };
        if patched.is_empty() {
            continue;
        }
        if src.is_gc() {
            for (off, data) in patched {
                match dest.as_deref_mut() {
                    Some(d) => d.write_at(off, &data)?,
                    None => src.superfile_mut().write_at(off, &data)?,
                }
            }
            continue;
        }
        src.ensure_crypto(index)?;
        let part = src.partition(index).unwrap();
        let key = part
            .title_key
            .ok_or_else(|| WdError::Crypto("patching needs the title key".into()))?;
        let header = part.header.as_ref().unwrap();
        let part_off = part.slot.offset;
        let data_abs = part_off + *header.data_off;
        let data_size = *header.data_size;
        let tmd_off = part_off + *header.tmd_off;
        let h3_off = part_off + *header.h3_off;
        let mut h3 = part.h3.clone();
        let mut tmd = part.tmd.clone().ok_or(WdError::Format("no tmd"))?;

        let mut tree = HashTreeBuilder::new();
        for (off, data) in &patched {
            let first = off / CLUSTER_DATA_SIZE;
            let last = (off + data.len() as u64 - 1) / CLUSTER_DATA_SIZE;
            for cluster in first..=last {
                tree.mark_cluster(cluster);
            }
        }

        let mut buf = vec![0u8; SUPERGROUP_SIZE as usize];
        tree.finalize(&mut h3, &mut tmd, |sg| {
            check_interrupt()?;
            let sg_abs = data_abs + sg * SUPERGROUP_SIZE;
            if (sg + 1) * SUPERGROUP_SIZE > data_size {
                return Err(WdError::Format("patch beyond partition data"));
            }
            src.superfile_mut().read_at(sg_abs, &mut buf)?;
            crypto::decrypt_supergroup(&mut buf, &key)?;
            // overlay the cleartext patches of this supergroup
            let part = src.partition(index).unwrap();
            for cluster in 0..SUPERGROUP_CLUSTERS {
                let clear_off = (sg * SUPERGROUP_CLUSTERS + cluster) * CLUSTER_DATA_SIZE;
                let payload = &mut buf[(cluster * CLUSTER_SIZE + 0x400) as usize..]
                    [..CLUSTER_DATA_SIZE as usize];
                part.patches.overlay(clear_off, payload);
            }
            let digest = crypto::rebuild_supergroup(&mut buf);
            crypto::encrypt_supergroup(&mut buf, &key)?;
            match dest.as_deref_mut() {
                Some(d) => d.write_at(sg_abs, &buf)?,
                None => src.superfile_mut().write_at(sg_abs, &buf)?,
            }
            Ok(digest)
        })?;

        sign::tmd_fake_sign(&mut tmd)?;
        let tmd_bytes = tmd.to_bytes()?;
        match dest.as_deref_mut() {
            Some(d) => {
                d.write_at(h3_off, &h3)?;
                d.write_at(tmd_off, &tmd_bytes)?;
            }
            None => {
                src.superfile_mut().write_at(h3_off, &h3)?;
                src.superfile_mut().write_at(tmd_off, &tmd_bytes)?;
            }
        }
    }
    Ok(())
}

/// Apply all pending patches to the image itself (EDIT/RENAME). Raw
/// patches are written directly; cleartext patches re-encrypt their
/// supergroups and fix the hash chain in place.
pub fn apply_patches_in_place(disc: &mut WiiDisc) -> WdResult<()> {
    rewrite_patched_partitions(disc, None)?;
    let raw: Vec<(u64, Vec<u8>)> = disc
        .disc_patches()
        .iter()
        .map(|(o, d)| (o, d.to_vec()))
        .collect();
    for (off, data) in raw {
        disc.superfile_mut().write_at(off, &data)?;
    }
    disc.invalidate_cache();
    disc.superfile_mut().sync()
}

/// Skeletonize: keep disc and partition control data plus the system area
/// of each partition, drop file payload, and stamp the marker.
pub fn skeletonize(src: &mut WiiDisc, dest: &mut Superfile) -> WdResult<()> {
    let size = src.size();
    dest.set_size(size)?;
    // disc control area
    copy_range(src, dest, 0, 0x50000.min(size))?;
    for index in 0..src.partition_count() {
        if src.ensure_open(index).is_err() {
            continue;
        }
        let (part_off, data_abs, boot) = {
            let part = src.partition(index).unwrap();
            let part_off = part.slot.offset;
            let data_abs = part
                .header
                .as_ref()
                .map(|h| part_off + *h.data_off);
            (part_off, data_abs, part.boot.clone())
        };
        match data_abs {
            Some(data_abs) => {
                copy_range(src, dest, part_off, part_off + crate::PART_CONTROL_SIZE)?;
                // system clusters: boot through end of FST
                if let Some(boot) = boot {
                    let sys_end = boot.fst_off() + boot.fst_size();
                    let clusters = sys_end.div_ceil(CLUSTER_DATA_SIZE);
                    copy_range(src, dest, data_abs, data_abs + clusters * CLUSTER_SIZE)?;
                }
            }
            None if src.is_gc() => {
                if let Some(boot) = boot {
                    let sys_end = boot.fst_off() + boot.fst_size();
                    copy_range(src, dest, 0, sys_end.min(size))?;
                }
            }
            None => {}
        }
    }
    dest.write_at(SKELETON_MARKER_OFF, SKELETON_MARKER)?;
    dest.sync()
}

pub fn is_skeleton(sf: &mut Superfile) -> WdResult<bool> {
    let mut marker = [0u8; 10];
    sf.read_at(SKELETON_MARKER_OFF, &mut marker)?;
    Ok(&marker == SKELETON_MARKER)
}

#[derive(Debug, Default)]
pub struct DiffReport {
    /// human-readable difference records, capped at the caller's limit
    pub messages: Vec<String>,
    /// total number of differences found (messages may be truncated)
    pub total: u64,
}

impl DiffReport {
    fn record(&mut self, limit: usize, message: String) {
        self.total += 1;
        if self.messages.len() < limit {
            self.messages.push(message);
        }
    }

    pub fn differs(&self) -> bool {
        self.total > 0
    }
}

/// Raw diff: compare the byte ranges selected by the usage maps of both
/// discs; reports ranges with first differing offset and length.
pub fn diff_raw(a: &mut WiiDisc, b: &mut WiiDisc, limit: usize) -> WdResult<DiffReport> {
    let mut report = DiffReport::default();
    let size = a.size().max(b.size());
    let map_a = a.build_usage_map()?;
    let map_b = b.build_usage_map()?;
    let sectors = size.div_ceil(SECTOR_SIZE) as usize;
    let mut buf_a = vec![0u8; SECTOR_SIZE as usize];
    let mut buf_b = vec![0u8; SECTOR_SIZE as usize];
    let mut run_start: Option<u64> = None;
    let mut run_len = 0u64;
    let mut first_diff = 0u64;
    for sector in 0..sectors {
        check_interrupt()?;
        let used_a = map_a.get(sector).copied().unwrap_or(USAGE_UNUSED) != USAGE_UNUSED;
        let used_b = map_b.get(sector).copied().unwrap_or(USAGE_UNUSED) != USAGE_UNUSED;
        if !used_a && !used_b {
            continue;
        }
        let off = sector as u64 * SECTOR_SIZE;
        a.read_raw(off, &mut buf_a)?;
        b.read_raw(off, &mut buf_b)?;
        if buf_a == buf_b {
            if let Some(start) = run_start.take() {
                report.record(
                    limit,
                    format!("differ at {start:#x}+{run_len:#x}, first byte at {first_diff:#x}"),
                );
            }
            run_len = 0;
            continue;
        }
        let within = buf_a
            .iter()
            .zip(buf_b.iter())
            .position(|(x, y)| x != y)
            .unwrap_or(0) as u64;
        if run_start.is_none() {
            run_start = Some(off);
            first_diff = off + within;
        }
        run_len += SECTOR_SIZE;
    }
    if let Some(start) = run_start {
        report.record(
            limit,
            format!("differ at {start:#x}+{run_len:#x}, first byte at {first_diff:#x}"),
        );
    }
    Ok(report)
}

fn collect_files(
    disc: &mut WiiDisc,
    selection: &Selection,
    pattern: Option<&mut FilePattern>,
) -> WdResult<Vec<(String, usize, u64, u64)>> {
    let mut files = Vec::new();
    disc.iterate_files(selection, PrefixMode::Auto, &mut |entry| {
        if matches!(entry.kind, FileKind::File) {
            files.push((entry.path.clone(), entry.part, entry.offset, entry.size));
        }
        crate::fst::VisitAction::Continue
    })?;
    if let Some(pattern) = pattern {
        files.retain(|(path, ..)| pattern.matches(&format!("/{path}"), '/'));
    }
    files.sort_by(|x, y| x.0.cmp(&y.0));
    Ok(files)
}

/// Compare ticket, TMD and boot of the paired main partitions.
fn diff_control(
    a: &mut WiiDisc,
    b: &mut WiiDisc,
    report: &mut DiffReport,
    limit: usize,
) -> WdResult<()> {
    let (Some(pa), Some(pb)) = (a.main_partition(), b.main_partition()) else {
        return Ok(());
    };
    if a.is_gc() || b.is_gc() {
        return Ok(());
    }
    for (name, bytes_a, bytes_b) in [
        ("ticket.bin", a.ticket_bytes(pa), b.ticket_bytes(pb)),
        ("tmd.bin", a.tmd_bytes(pa), b.tmd_bytes(pb)),
    ] {
        match (bytes_a, bytes_b) {
            (Ok(x), Ok(y)) if x == y => {}
            (Ok(_), Ok(_)) => report.record(limit, format!("{name} differs")),
            _ => report.record(limit, format!("{name} unreadable")),
        }
    }
    let mut boot_a = vec![0u8; BOOT_SIZE];
    let mut boot_b = vec![0u8; BOOT_SIZE];
    a.read_part(pa, 0, &mut boot_a, true)?;
    b.read_part(pb, 0, &mut boot_b, true)?;
    if boot_a != boot_b {
        report.record(limit, "sys/boot.bin differs".into());
    }
    Ok(())
}

/// File-level diff: pair files of both discs by canonical path and compare
/// contents; ticket, TMD, boot and fst.bin are compared separately.
pub fn diff_files(
    a: &mut WiiDisc,
    b: &mut WiiDisc,
    pattern: Option<&mut FilePattern>,
    limit: usize,
) -> WdResult<DiffReport> {
    let mut report = DiffReport::default();
    let selection = Selection::all();

    // control structures of the paired main partitions; skipped when a
    // pattern narrows the diff to selected files
    if pattern.is_none() {
        diff_control(a, b, &mut report, limit)?;
    }
    let mut pattern = pattern;
    let files_a = collect_files(a, &selection, pattern.as_deref_mut())?;
    let files_b = collect_files(b, &selection, pattern.as_deref_mut())?;

    let mut ia = 0usize;
    let mut ib = 0usize;
    let mut buf_a = vec![0u8; COPY_CHUNK as usize];
    let mut buf_b = vec![0u8; COPY_CHUNK as usize];
    while ia < files_a.len() || ib < files_b.len() {
        check_interrupt()?;
        let order = match (files_a.get(ia), files_b.get(ib)) {
            (Some(x), Some(y)) => x.0.cmp(&y.0),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => break,
        };
        match order {
            std::cmp::Ordering::Less => {
                report.record(limit, format!("only in source: {}", files_a[ia].0));
                ia += 1;
            }
            std::cmp::Ordering::Greater => {
                report.record(limit, format!("only in destination: {}", files_b[ib].0));
                ib += 1;
            }
            std::cmp::Ordering::Equal => {
                let (path, part_a, off_a, size_a) = files_a[ia].clone();
                let (_, part_b, off_b, size_b) = files_b[ib].clone();
                ia += 1;
                ib += 1;
                if size_a != size_b {
                    report.record(
                        limit,
                        format!("{path}: size {size_a} != {size_b}"),
                    );
                    continue;
                }
                let mut pos = 0u64;
                while pos < size_a {
                    let chunk = (size_a - pos).min(COPY_CHUNK) as usize;
                    a.read_part(part_a, off_a + pos, &mut buf_a[..chunk], true)?;
                    b.read_part(part_b, off_b + pos, &mut buf_b[..chunk], true)?;
                    if buf_a[..chunk] != buf_b[..chunk] {
                        report.record(limit, format!("{path}: content differs"));
                        break;
                    }
                    pos += chunk as u64;
                }
            }
        }
    }
    Ok(report)
}

/// Per-level counters of a verify run; blocks, not bytes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked_clusters: u64,
    pub h0_bad: u64,
    pub h1_bad: u64,
    pub h2_bad: u64,
    pub h3_bad: u64,
    pub tmd_bad: u64,
    pub ticket_unsigned: u64,
    pub skipped_partitions: u64,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.h0_bad == 0
            && self.h1_bad == 0
            && self.h2_bad == 0
            && self.h3_bad == 0
            && self.tmd_bad == 0
    }
}

/// Verify every used cluster of every readable partition against the hash
/// tree, the H3 table and the TMD content hash.
pub fn verify_disc(disc: &mut WiiDisc, limit: usize) -> WdResult<VerifyReport> {
    let mut report = VerifyReport::default();
    if disc.is_gc() {
        // no hash tree on the small format
        return Ok(report);
    }
    let map = disc.build_usage_map()?;
    let mut messages = 0usize;
    for index in 0..disc.partition_count() {
        if disc.ensure_crypto(index).is_err() {
            report.skipped_partitions += 1;
            continue;
        }
        let part = disc.partition(index).unwrap();
        let header = part.header.as_ref().unwrap();
        let key = match part.title_key {
            Some(key) => key,
            None => {
                report.skipped_partitions += 1;
                continue;
            }
        };
        let part_off = part.slot.offset;
        let data_abs = part_off + *header.data_off;
        let data_size = *header.data_size;
        let h3 = part.h3.clone();
        let tmd_hash = part.tmd.as_ref().and_then(|t| t.contents.first()).map(|c| c.hash);
        // a zeroed signature without the leading-zero digest is a broken
        // fake signature
        if header.ticket.sig.iter().all(|&b| b == 0)
            && !sign::ticket_is_fake_signed(&header.ticket)
        {
            report.ticket_unsigned += 1;
        }
        match tmd_hash {
            Some(hash) if hash == crypto::h3_table_digest(&h3) => {}
            _ => report.tmd_bad += 1,
        }

        let clusters = data_size / CLUSTER_SIZE;
        let mut cluster_buf = vec![0u8; CLUSTER_SIZE as usize];
        for cluster in 0..clusters {
            check_interrupt()?;
            let abs = data_abs + cluster * CLUSTER_SIZE;
            let sector = (abs / SECTOR_SIZE) as usize;
            if map.get(sector).copied().unwrap_or(USAGE_UNUSED) == USAGE_UNUSED {
                continue;
            }
            report.checked_clusters += 1;
            disc.superfile_mut().read_at(abs, &mut cluster_buf)?;
            crypto::decrypt_cluster(&mut cluster_buf, &key)?;
            let in_group = (cluster % crate::GROUP_CLUSTERS) as usize;
            let group_in_sg =
                ((cluster / crate::GROUP_CLUSTERS) % crate::GROUP_CLUSTERS) as usize;
            let check = crypto::verify_cluster(&cluster_buf, in_group);
            report.h0_bad += u64::from(check.h0_bad);
            report.h1_bad += u64::from(check.h1_bad);
            if !crypto::verify_cluster_h2(&cluster_buf, group_in_sg) {
                report.h2_bad += 1;
            }
            let sg = (cluster / SUPERGROUP_CLUSTERS) as usize;
            let expect = &h3[sg * 20..][..20];
            if crypto::cluster_h3_digest(&cluster_buf) != expect[..] {
                report.h3_bad += 1;
            }
            if !check.is_ok() && messages < limit {
                messages += 1;
                tracing::warn!(part = index, cluster, "hash mismatch");
            }
        }
    }
    Ok(report)
}

fn write_file(path: &Path, data: &[u8]) -> WdResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(())
}

/// Extract the selected partitions into an FST tree under `dest`.
pub fn extract_disc(
    disc: &mut WiiDisc,
    dest: &Path,
    selection: &Selection,
    mut pattern: Option<&mut FilePattern>,
) -> WdResult<()> {
    if dest.exists() && fs::read_dir(dest)?.next().is_some() {
        return Err(WdError::AlreadyExists(dest.to_path_buf()));
    }
    fs::create_dir_all(dest)?;
    for index in 0..disc.partition_count() {
        if !selection.selects(index, disc.partition(index).unwrap()) {
            continue;
        }
        disc.ensure_open(index)?;
        check_interrupt()?;
        let is_gc = disc.is_gc();
        let base = if is_gc {
            dest.to_path_buf()
        } else {
            dest.join(disc.partition(index).unwrap().ptype().to_string())
        };

        if !is_gc {
            write_file(&base.join("ticket.bin"), &disc.ticket_bytes(index)?)?;
            write_file(&base.join("tmd.bin"), &disc.tmd_bytes(index)?)?;
            let part = disc.partition(index).unwrap();
            let cert = part.cert.clone();
            let h3 = part.h3.clone();
            write_file(&base.join("cert.bin"), &cert)?;
            write_file(&base.join("h3.bin"), &h3)?;
            let mut region = vec![0u8; REGION_SIZE];
            disc.read_raw(REGION_OFF, &mut region)?;
            write_file(&base.join("disc").join("region.bin"), &region)?;
            let mut header = vec![0u8; crate::structs::DISC_HEADER_SIZE];
            disc.read_raw(0, &mut header)?;
            write_file(&base.join("disc").join("header.bin"), &header)?;
        }

        let mut boot_buf = vec![0u8; BOOT_SIZE];
        disc.read_part(index, 0, &mut boot_buf, true)?;
        write_file(&base.join("sys").join("boot.bin"), &boot_buf)?;
        let mut bi2 = vec![0u8; 0x2000];
        disc.read_part(index, BOOT_SIZE as u64, &mut bi2, true)?;
        write_file(&base.join("sys").join("bi2.bin"), &bi2)?;
        let apl_size = disc.apploader_size(index)?;
        let mut apl = vec![0u8; apl_size as usize];
        disc.read_part(index, 0x2440, &mut apl, true)?;
        write_file(&base.join("sys").join("apploader.img"), &apl)?;
        let boot = disc.partition(index).unwrap().boot.clone().unwrap();
        let dol_size = disc.dol_size(index)?;
        let mut dol = vec![0u8; dol_size as usize];
        disc.read_part(index, boot.dol_off(), &mut dol, true)?;
        write_file(&base.join("sys").join("main.dol"), &dol)?;
        let mut fst_buf = vec![0u8; boot.fst_size() as usize];
        disc.read_part(index, boot.fst_off(), &mut fst_buf, true)?;
        write_file(&base.join("sys").join("fst.bin"), &fst_buf)?;

        fs::create_dir_all(base.join("files"))?;
        let fst = disc.partition(index).unwrap().fst.clone();
        if let Some(fst) = fst {
            let mut files: Vec<(String, u64, u32)> = Vec::new();
            fst.visit(&mut |visit| {
                if let crate::fst::FstVisit::File { path, offset, size } = visit {
                    files.push((path.to_owned(), offset, size));
                }
                crate::fst::VisitAction::Continue
            })?;
            for (path, offset, size) in files {
                check_interrupt()?;
                if let Some(pattern) = pattern.as_deref_mut() {
                    if !pattern.matches(&format!("/files{path}"), '/') {
                        continue;
                    }
                }
                let mut data = vec![0u8; size as usize];
                disc.read_part(index, offset, &mut data, true)?;
                let mut out = base.join("files");
                for piece in path.trim_start_matches('/').split('/') {
                    out.push(piece);
                }
                write_file(&out, &data)?;
            }
        }
    }
    Ok(())
}

/// A partition source reading an open disc, used to rebuild an image from
/// its file system (COPY over an FST view).
pub struct DiscPartitionSource<'a> {
    disc: &'a mut WiiDisc,
    index: usize,
}

impl<'a> DiscPartitionSource<'a> {
    pub fn new(disc: &'a mut WiiDisc, index: usize) -> WdResult<Self> {
        disc.ensure_open(index)?;
        Ok(DiscPartitionSource { disc, index })
    }

    fn read_clear(&mut self, off: u64, size: u64) -> WdResult<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        self.disc.read_part(self.index, off, &mut buf, true)?;
        Ok(buf)
    }
}

impl PartitionSource for DiscPartitionSource<'_> {
    fn boot(&mut self) -> WdResult<Boot> {
        let bytes = self.read_clear(0, BOOT_SIZE as u64)?;
        crate::structs::decode(&bytes, BOOT_SIZE, "boot")
    }

    fn bi2(&mut self) -> WdResult<Vec<u8>> {
        self.read_clear(BOOT_SIZE as u64, 0x2000)
    }

    fn apploader(&mut self) -> WdResult<Vec<u8>> {
        let size = self.disc.apploader_size(self.index)?;
        self.read_clear(0x2440, size)
    }

    fn dol(&mut self) -> WdResult<Vec<u8>> {
        let boot = self.disc.partition(self.index).unwrap().boot.clone().unwrap();
        let size = self.disc.dol_size(self.index)?;
        self.read_clear(boot.dol_off(), size)
    }

    fn fst(&mut self) -> WdResult<Fst> {
        self.disc
            .partition(self.index)
            .unwrap()
            .fst
            .clone()
            .ok_or(WdError::Format("partition has no fst"))
    }

    fn file_data(&mut self, path: &str) -> WdResult<Vec<u8>> {
        let fst = self.fst()?;
        let record = fst
            .find_file(path)
            .ok_or_else(|| WdError::Missing(path.to_owned()))?;
        let off = fst.file_offset(record);
        let size = fst.item(record).map(|i| i.size).unwrap_or(0);
        self.read_clear(off, u64::from(size))
    }
}

/// Rebuild a fresh image from the file systems of `src` (fake signing the
/// result). The inverse of scrubbing: layout is regenerated, content kept.
pub fn rebuild_disc<WS>(src: &mut WiiDisc, dest: WS, keys: &CommonKeys) -> WdResult<WS>
where
    WS: std::io::Read + std::io::Write + Seek,
{
    if src.is_gc() {
        return Err(WdError::Syntax("rebuild targets wii images".into()));
    }
    let header = src.header().clone();
    let region = *src.region();
    let mut builder = DiscBuilder::new(dest, header, region, keys.clone());
    for index in 0..src.partition_count() {
        src.ensure_open(index)?;
        let ticket = Ticket::from_bytes(&src.ticket_bytes(index)?)?;
        let tmd = Tmd::from_bytes(&src.tmd_bytes(index)?)?;
        let (ptype, cert) = {
            let part = src.partition(index).unwrap();
            (part.ptype(), part.cert.clone())
        };
        let mut source = DiscPartitionSource::new(src, index)?;
        builder.add_partition(ptype, ticket, tmd, &cert, &mut source)?;
    }
    builder.finish()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::test::{build_test_image, test_keys};
    use crate::container::{CreateOpts, ImageFormat};

    fn disc_from(path: &Path) -> WiiDisc {
        WiiDisc::open(Superfile::open(path).unwrap(), test_keys()).unwrap()
    }

    fn write_test_image(dir: &Path, name: &str) -> std::path::PathBuf {
        let image = build_test_image(vec![
            ("/data/a.bin".into(), vec![0xA5; 0x3000]),
            ("/b.txt".into(), b"pipeline test".to_vec()),
        ]);
        let path = dir.join(name);
        fs::write(&path, &image).unwrap();
        path
    }

    #[test]
    fn built_image_verifies_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path(), "src.iso");
        let mut disc = disc_from(&path);
        let report = verify_disc(&mut disc, 16).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert!(report.checked_clusters > 0);
    }

    #[test]
    fn copy_then_diff_is_equal() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = write_test_image(dir.path(), "src.iso");
        let dst_path = dir.path().join("dst.wdf");
        {
            let mut src = disc_from(&src_path);
            let mut dest =
                Superfile::create(&dst_path, ImageFormat::Wdf, &CreateOpts::default()).unwrap();
            copy_disc(&mut src, &mut dest, CopyMode::Scrub).unwrap();
        }
        let mut a = disc_from(&src_path);
        let mut b = disc_from(&dst_path);
        let report = diff_raw(&mut a, &mut b, 8).unwrap();
        assert!(!report.differs(), "{:?}", report.messages);
        let report = diff_files(&mut a, &mut b, None, 8).unwrap();
        assert!(!report.differs(), "{:?}", report.messages);
    }

    #[test]
    fn copy_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = write_test_image(dir.path(), "src.iso");
        let mid_path = dir.path().join("mid.ciso");
        let out_path = dir.path().join("out.iso");
        {
            let mut src = disc_from(&src_path);
            let mut mid =
                Superfile::create(&mid_path, ImageFormat::Ciso, &CreateOpts::default()).unwrap();
            copy_disc(&mut src, &mut mid, CopyMode::Scrub).unwrap();
        }
        {
            let mut mid = disc_from(&mid_path);
            let mut out =
                Superfile::create(&out_path, ImageFormat::Iso, &CreateOpts::default()).unwrap();
            copy_disc(&mut mid, &mut out, CopyMode::Scrub).unwrap();
        }
        let mut a = disc_from(&src_path);
        let mut c = disc_from(&out_path);
        let report = diff_raw(&mut a, &mut c, 8).unwrap();
        assert!(!report.differs(), "{:?}", report.messages);
    }

    #[test]
    fn patched_copy_reverifies() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = write_test_image(dir.path(), "src.iso");
        let dst_path = dir.path().join("dst.iso");
        {
            let mut src = disc_from(&src_path);
            src.patch_title("patched title").unwrap();
            let mut dest =
                Superfile::create(&dst_path, ImageFormat::Iso, &CreateOpts::default()).unwrap();
            copy_disc(&mut src, &mut dest, CopyMode::Scrub).unwrap();
        }
        let mut copy = disc_from(&dst_path);
        copy.ensure_open(0).unwrap();
        // the partition boot carries the new title and the tree still checks
        assert_eq!(
            copy.partition(0).unwrap().boot.as_ref().unwrap().header.title(),
            "patched title"
        );
        let report = verify_disc(&mut copy, 16).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert!(sign::tmd_is_fake_signed(copy.partition(0).unwrap().tmd.as_ref().unwrap()));
    }

    #[test]
    fn extract_and_rebuild_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = write_test_image(dir.path(), "src.iso");
        let tree = dir.path().join("tree");
        {
            let mut src = disc_from(&src_path);
            extract_disc(&mut src, &tree, &Selection::all(), None).unwrap();
        }
        assert!(tree.join("DATA/sys/main.dol").is_file());
        assert!(tree.join("DATA/files/b.txt").is_file());
        assert_eq!(
            fs::read(tree.join("DATA/files/b.txt")).unwrap(),
            b"pipeline test"
        );

        // rebuild through the FST-tree container
        let rebuilt = dir.path().join("rebuilt.iso");
        {
            let mut image = crate::container::fst_tree::FstTreeImage::open_with_keys(
                &tree,
                &test_keys(),
            )
            .unwrap();
            let mut out = fs::File::create(&rebuilt).unwrap();
            let mut buf = vec![0u8; 0x10000];
            let mut off = 0u64;
            use std::io::Write;
            while off < image.size() {
                let chunk = ((image.size() - off) as usize).min(buf.len());
                image.read_at(off, &mut buf[..chunk]).unwrap();
                out.write_all(&buf[..chunk]).unwrap();
                off += chunk as u64;
            }
        }
        let mut rebuilt_disc = disc_from(&rebuilt);
        let report = verify_disc(&mut rebuilt_disc, 16).unwrap();
        assert!(report.is_clean(), "{report:?}");
        // same file content after the round trip (layout may differ, so
        // the diff is narrowed to the file set)
        let mut a = disc_from(&src_path);
        let mut pattern = FilePattern::new();
        pattern.add_rules("+/**").unwrap();
        let report = diff_files(&mut a, &mut rebuilt_disc, Some(&mut pattern), 8).unwrap();
        assert!(!report.differs(), "{:?}", report.messages);
    }

    #[test]
    fn skeleton_keeps_structure_only() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = write_test_image(dir.path(), "src.iso");
        let skel_path = dir.path().join("skel.iso");
        {
            let mut src = disc_from(&src_path);
            let mut dest =
                Superfile::create(&skel_path, ImageFormat::Iso, &CreateOpts::default()).unwrap();
            skeletonize(&mut src, &mut dest).unwrap();
        }
        let mut sf = Superfile::open(&skel_path).unwrap();
        assert!(is_skeleton(&mut sf).unwrap());
        let mut disc = WiiDisc::open(sf, test_keys()).unwrap();
        // structures still parse
        disc.ensure_open(0).unwrap();
        assert!(disc.partition(0).unwrap().fst.is_some());
    }
}
