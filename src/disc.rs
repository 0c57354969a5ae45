//! Disc and partition engine.
//!
//! Opens a disc image through a superfile, enumerates partitions across the
//! four partition tables, lazily materializes per-partition structures
//! (ticket, TMD, certificate chain, H3 table) and exposes the decrypted
//! cleartext view over the encrypted, sector-striped data region. GameCube
//! images are modeled as a single plain pseudo partition covering the disc.

use std::io::{Cursor, Seek, SeekFrom};

use binrw::BinReaderExt;

use crate::container::Superfile;
use crate::crypto;
use crate::error::{WdError, WdResult};
use crate::fst::{Fst, FstVisit, VisitAction};
use crate::keys::CommonKeys;
use crate::patch::MemMap;
use crate::sign;
use crate::structs::{
    read_part_slots, Boot, DiscHeader, PartSlot, PartitionHeader, PartitionType, Region,
    BOOT_SIZE, PART_HEADER_SIZE, TMD_BASE_SIZE, TMD_CONTENT_SIZE,
};
use crate::{
    CLUSTER_DATA_SIZE, CLUSTER_HASH_SIZE, CLUSTER_SIZE, H3_SIZE, PART_CONTROL_SIZE, REGION_OFF,
    SECTOR_SIZE,
};

// usage map classification
pub const USAGE_UNUSED: u8 = 0;
pub const USAGE_DISC: u8 = 1;
pub const USAGE_PART0: u8 = 2;
/// distinguished value for sectors scrubbed to zero
pub const USAGE_SCRUB_ZERO: u8 = 0x7F;
/// flag bit: the sector belongs to an encrypted data region
pub const USAGE_ENC_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    New,
    HeaderLoaded,
    CryptoReady,
    Open,
    Invalid,
}

/// A partition and its lazily loaded control structures.
#[derive(Debug)]
pub struct Partition {
    pub slot: PartSlot,
    pub state: PartState,
    pub is_gc: bool,
    pub header: Option<PartitionHeader>,
    pub tmd: Option<crate::structs::Tmd>,
    pub cert: Vec<u8>,
    pub h3: Vec<u8>,
    pub title_key: Option<[u8; 16]>,
    pub boot: Option<Boot>,
    pub fst: Option<Fst>,
    /// H3 table digest does not match the TMD content hash
    pub warn_h3_mismatch: bool,
    /// boot id does not match the disc header id
    pub warn_id_mismatch: bool,
    /// pending cleartext patches
    pub patches: MemMap,
}

impl Partition {
    fn new(slot: PartSlot, is_gc: bool) -> Partition {
        Partition {
            slot,
            state: PartState::New,
            is_gc,
            header: None,
            tmd: None,
            cert: Vec::new(),
            h3: Vec::new(),
            title_key: None,
            boot: None,
            fst: None,
            warn_h3_mismatch: false,
            warn_id_mismatch: false,
            patches: MemMap::new(),
        }
    }

    pub fn ptype(&self) -> PartitionType {
        self.slot.ptype
    }

    pub fn is_valid(&self) -> bool {
        self.state != PartState::Invalid && !self.warn_h3_mismatch
    }

    /// Bytes of the cleartext view (payload only).
    pub fn cleartext_size(&self) -> u64 {
        if self.is_gc {
            return u64::MAX;
        }
        match &self.header {
            Some(header) => *header.data_size / CLUSTER_SIZE * CLUSTER_DATA_SIZE,
            None => 0,
        }
    }
}

/// Partition selection, combined monotonically: a partition is selected if
/// any clause selects it. No clauses means all.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    clauses: Vec<Clause>,
    select_none: bool,
}

#[derive(Debug, Clone)]
enum Clause {
    Type(PartitionType),
    Table(usize),
    Index(usize),
}

impl Selection {
    pub fn all() -> Selection {
        Selection::default()
    }

    pub fn none() -> Selection {
        Selection {
            clauses: Vec::new(),
            select_none: true,
        }
    }

    pub fn add_type(&mut self, ptype: PartitionType) {
        self.select_none = false;
        self.clauses.push(Clause::Type(ptype));
    }

    pub fn add_table(&mut self, table: usize) {
        self.select_none = false;
        self.clauses.push(Clause::Table(table));
    }

    pub fn add_index(&mut self, index: usize) {
        self.select_none = false;
        self.clauses.push(Clause::Index(index));
    }

    /// Parse a selector like `all`, `none`, `data`, `update`, `channel`,
    /// `ptab0`..`ptab3` or a numeric partition index; comma separated
    /// clauses combine.
    pub fn parse(text: &str) -> WdResult<Selection> {
        let mut selection = Selection::all();
        for token in text.split(',').filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "all" => return Ok(Selection::all()),
                "none" => return Ok(Selection::none()),
                "data" => selection.add_type(PartitionType::Data),
                "update" => selection.add_type(PartitionType::Update),
                "channel" => selection.add_type(PartitionType::Channel),
                other => {
                    if let Some(table) = other.strip_prefix("ptab") {
                        let table: usize = table.parse().map_err(|_| {
                            WdError::Syntax(format!("bad partition table '{token}'"))
                        })?;
                        selection.add_table(table);
                    } else if let Ok(index) = other.parse::<usize>() {
                        selection.add_index(index);
                    } else {
                        return Err(WdError::Syntax(format!("bad partition selector '{token}'")));
                    }
                }
            }
        }
        Ok(selection)
    }

    pub fn selects(&self, index: usize, part: &Partition) -> bool {
        if self.select_none {
            return false;
        }
        if self.clauses.is_empty() {
            return true;
        }
        self.clauses.iter().any(|clause| match clause {
            Clause::Type(t) => part.slot.ptype == *t,
            Clause::Table(t) => part.slot.table == *t,
            Clause::Index(i) => *i == index,
        })
    }
}

/// How partition-relative paths are prefixed during file iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefixMode {
    /// prefix only when more than one partition is selected
    #[default]
    Auto,
    Never,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    DirEnter,
    DirLeave,
    SystemFile,
    PartHeader,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub kind: FileKind,
    pub path: String,
    pub part: usize,
    /// cleartext offset for File/SystemFile, control-area offset for
    /// PartHeader entries
    pub offset: u64,
    pub size: u64,
}

/// A pending edit of the disc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscPatch {
    Data {
        part: usize,
        offset: u64,
        bytes: Vec<u8>,
    },
    FstName {
        part: usize,
        path: String,
        new_name: String,
    },
    Id(String),
    Title(String),
    Region(u32),
    CommonKey {
        part: usize,
        index: u8,
    },
    SystemVersion {
        part: usize,
        version: u64,
    },
    WiimmfiHost {
        part: usize,
        host: String,
    },
}

pub struct WiiDisc {
    sf: Superfile,
    header: DiscHeader,
    region: Region,
    is_gc: bool,
    partitions: Vec<Partition>,
    keys: CommonKeys,
    disc_patches: MemMap,
    cluster_cache: Vec<u8>,
    cache_tag: Option<(usize, u64)>,
}

impl WiiDisc {
    pub fn open(mut sf: Superfile, keys: CommonKeys) -> WdResult<WiiDisc> {
        sf.seek(SeekFrom::Start(0))?;
        let header: DiscHeader = sf.read_be()?;
        let is_wii = header.is_wii();
        let is_gc = header.is_gamecube();
        if !is_wii && !is_gc {
            return Err(WdError::Format("disc: no wii or gamecube magic"));
        }
        let mut region = Region::default();
        let mut partitions = Vec::new();
        if is_wii {
            sf.seek(SeekFrom::Start(REGION_OFF))?;
            region = sf.read_be()?;
            for slot in read_part_slots(&mut sf)? {
                partitions.push(Partition::new(slot, false));
            }
            if partitions.is_empty() {
                return Err(WdError::Format("disc: empty partition tables"));
            }
        } else {
            partitions.push(Partition::new(
                PartSlot {
                    table: 0,
                    index: 0,
                    offset: 0,
                    ptype: PartitionType::Data,
                },
                true,
            ));
        }
        Ok(WiiDisc {
            sf,
            header,
            region,
            is_gc,
            partitions,
            keys,
            disc_patches: MemMap::new(),
            cluster_cache: vec![0u8; CLUSTER_SIZE as usize],
            cache_tag: None,
        })
    }

    pub fn header(&self) -> &DiscHeader {
        &self.header
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn is_gc(&self) -> bool {
        self.is_gc
    }

    pub fn size(&self) -> u64 {
        self.sf.size()
    }

    pub fn superfile_mut(&mut self) -> &mut Superfile {
        &mut self.sf
    }

    pub fn into_superfile(self) -> Superfile {
        self.sf
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, index: usize) -> Option<&Partition> {
        self.partitions.get(index)
    }

    /// The single DATA partition designated "main".
    pub fn main_partition(&self) -> Option<usize> {
        self.partitions
            .iter()
            .position(|p| p.slot.ptype == PartitionType::Data)
    }

    /// Raw disc read with pending raw-space patches applied.
    pub fn read_raw(&mut self, off: u64, buf: &mut [u8]) -> WdResult<()> {
        self.sf.read_at(off, buf)?;
        self.disc_patches.overlay(off, buf);
        Ok(())
    }

    fn part_data_abs(&self, index: usize) -> u64 {
        let part = &self.partitions[index];
        if part.is_gc {
            return 0;
        }
        part.slot.offset
            + part
                .header
                .as_ref()
                .map(|h| *h.data_off)
                .unwrap_or(PART_CONTROL_SIZE)
    }

    /// NEW -> HEADER_LOADED: partition header, ticket, TMD, H3 are read and
    /// their sizes validated.
    pub fn ensure_header(&mut self, index: usize) -> WdResult<()> {
        let part = &self.partitions[index];
        if part.state != PartState::New || part.is_gc {
            if part.state == PartState::New {
                self.partitions[index].state = PartState::HeaderLoaded;
            }
            return Ok(());
        }
        let off = part.slot.offset;
        let result = self.load_header(index, off);
        if result.is_err() {
            self.partitions[index].state = PartState::Invalid;
        }
        result
    }

    fn load_header(&mut self, index: usize, off: u64) -> WdResult<()> {
        let mut buf = vec![0u8; PART_HEADER_SIZE];
        self.sf.read_at(off, &mut buf)?;
        let header: PartitionHeader =
            crate::structs::decode(&buf, PART_HEADER_SIZE, "partition header")?;

        // envelope invariants: control regions are disjoint and inside the
        // control area, the data region is cluster aligned
        let tmd_range = (*header.tmd_off, *header.tmd_off + u64::from(header.tmd_size));
        let cert_range = (
            *header.cert_off,
            *header.cert_off + u64::from(header.cert_size),
        );
        let h3_range = (*header.h3_off, *header.h3_off + H3_SIZE as u64);
        let ranges = [tmd_range, cert_range, h3_range];
        for (lo, hi) in ranges {
            if lo < PART_HEADER_SIZE as u64 || hi > PART_CONTROL_SIZE || lo > hi {
                return Err(WdError::Format("partition: region outside control area"));
            }
        }
        for i in 0..ranges.len() {
            for j in i + 1..ranges.len() {
                if ranges[i].0 < ranges[j].1 && ranges[j].0 < ranges[i].1 {
                    return Err(WdError::Format("partition: overlapping regions"));
                }
            }
        }
        if header.tmd_size < (TMD_BASE_SIZE + TMD_CONTENT_SIZE) as u32 {
            return Err(WdError::Format("partition: tmd too small"));
        }
        if *header.data_off < PART_CONTROL_SIZE
            || *header.data_size % CLUSTER_SIZE != 0
            || *header.data_size < CLUSTER_SIZE
        {
            return Err(WdError::Format("partition: bad data region"));
        }

        let mut tmd_buf = vec![0u8; header.tmd_size as usize];
        self.sf.read_at(off + *header.tmd_off, &mut tmd_buf)?;
        let tmd = crate::structs::Tmd::from_bytes(&tmd_buf)?;

        let mut cert = vec![0u8; header.cert_size as usize];
        self.sf.read_at(off + *header.cert_off, &mut cert)?;
        let mut h3 = vec![0u8; H3_SIZE];
        self.sf.read_at(off + *header.h3_off, &mut h3)?;

        let part = &mut self.partitions[index];
        part.header = Some(header);
        part.tmd = Some(tmd);
        part.cert = cert;
        part.h3 = h3;
        part.state = PartState::HeaderLoaded;
        Ok(())
    }

    /// HEADER_LOADED -> CRYPTO_READY: unwrap the title key and pin the H3
    /// table against the TMD content hash. A mismatch sets the warning bit
    /// but still allows reading.
    pub fn ensure_crypto(&mut self, index: usize) -> WdResult<()> {
        self.ensure_header(index)?;
        let part = &self.partitions[index];
        if part.state != PartState::HeaderLoaded || part.is_gc {
            if part.is_gc && part.state == PartState::HeaderLoaded {
                self.partitions[index].state = PartState::CryptoReady;
            }
            return Ok(());
        }
        let header = part.header.as_ref().ok_or(WdError::Fatal(
            "crypto transition without header".into(),
        ))?;
        let ticket = &header.ticket;
        let not_encrypted = sign::ticket_is_marked_not_encrypted(ticket)
            || self.header.disable_disc_enc != 0;
        let title_key = if not_encrypted {
            [0u8; 16]
        } else {
            match crypto::unwrap_title_key(ticket, &self.keys) {
                Ok(key) => key,
                Err(err) => {
                    self.partitions[index].state = PartState::Invalid;
                    return Err(err);
                }
            }
        };
        let tmd = part.tmd.as_ref();
        let h3_ok = tmd
            .and_then(|t| t.contents.first())
            .map(|c| c.hash == crypto::h3_table_digest(&part.h3))
            .unwrap_or(false);
        let part = &mut self.partitions[index];
        part.title_key = Some(title_key);
        part.warn_h3_mismatch = !h3_ok;
        if !h3_ok {
            tracing::warn!(part = index, "h3 table digest does not match tmd");
        }
        part.state = PartState::CryptoReady;
        Ok(())
    }

    /// CRYPTO_READY -> OPEN: decrypt the partition's boot block, check the
    /// id against the disc header, parse the FST.
    pub fn ensure_open(&mut self, index: usize) -> WdResult<()> {
        self.ensure_crypto(index)?;
        if self.partitions[index].state != PartState::CryptoReady {
            return if self.partitions[index].state == PartState::Open {
                Ok(())
            } else {
                Err(WdError::Format("partition not readable"))
            };
        }
        let mut boot_buf = vec![0u8; BOOT_SIZE];
        self.read_part(index, 0, &mut boot_buf, true)?;
        let boot: Boot = crate::structs::decode(&boot_buf, BOOT_SIZE, "partition boot")?;
        let id_ok = boot.header.disc_id[..3] == self.header.disc_id[..3];
        let fst_off = boot.fst_off();
        let fst_size = boot.fst_size();
        let fst = if fst_size == 0 || fst_size > 0x800_0000 {
            None
        } else {
            let mut fst_buf = vec![0u8; fst_size as usize];
            self.read_part(index, fst_off, &mut fst_buf, true)?;
            Some(Fst::parse(
                &fst_buf,
                if self.partitions[index].is_gc { 1 } else { 4 },
            )?)
        };
        let part = &mut self.partitions[index];
        part.warn_id_mismatch = !id_ok;
        if !id_ok {
            tracing::warn!(part = index, "partition boot id differs from disc id");
        }
        part.boot = Some(boot);
        part.fst = fst;
        part.state = PartState::Open;
        Ok(())
    }

    /// Read from a partition's data region. With `decrypt` the offset
    /// addresses the cleartext view (offsets and length should be 4-byte
    /// aligned, matching the on-disc off4 units); without it, the raw
    /// encrypted bytes.
    pub fn read_part(
        &mut self,
        index: usize,
        off: u64,
        buf: &mut [u8],
        decrypt: bool,
    ) -> WdResult<()> {
        self.ensure_header(index)?;
        if self.partitions[index].is_gc {
            let patches = std::mem::take(&mut self.partitions[index].patches);
            self.sf.read_at(off, buf)?;
            patches.overlay(off, buf);
            self.partitions[index].patches = patches;
            return Ok(());
        }
        if !decrypt {
            let abs = self.part_data_abs(index);
            return self.sf.read_at(abs + off, buf);
        }
        self.ensure_crypto(index)?;
        if off % 4 != 0 {
            return Err(WdError::Syntax("partition reads are off4 addressed".into()));
        }
        let limit = self.partitions[index].cleartext_size();
        let abs = self.part_data_abs(index);
        let key = self.partitions[index]
            .title_key
            .ok_or_else(|| WdError::Crypto("partition crypto not ready".into()))?;
        let plain = self.header.disable_disc_enc != 0
            || sign::ticket_is_marked_not_encrypted(
                &self.partitions[index].header.as_ref().unwrap().ticket,
            );

        let mut pos = off;
        let mut filled = 0usize;
        while filled < buf.len() {
            if pos >= limit {
                buf[filled..].fill(0);
                break;
            }
            let cluster = pos / CLUSTER_DATA_SIZE;
            let within = (pos % CLUSTER_DATA_SIZE) as usize;
            let chunk = (CLUSTER_DATA_SIZE as usize - within).min(buf.len() - filled);
            if self.cache_tag != Some((index, cluster)) {
                self.sf
                    .read_at(abs + cluster * CLUSTER_SIZE, &mut self.cluster_cache)?;
                if !plain {
                    crypto::decrypt_cluster_data(&mut self.cluster_cache, &key)?;
                }
                self.cache_tag = Some((index, cluster));
            }
            let src = 0x400 + within;
            buf[filled..filled + chunk].copy_from_slice(&self.cluster_cache[src..src + chunk]);
            filled += chunk;
            pos += chunk as u64;
        }
        self.partitions[index].patches.overlay(off, buf);
        Ok(())
    }

    /// Drop the cluster cache (after external writes to the image).
    pub fn invalidate_cache(&mut self) {
        self.cache_tag = None;
    }

    /// Absolute image offset of a partition cleartext offset (the start of
    /// the byte inside its encrypted cluster).
    pub fn cleartext_to_image(&self, index: usize, off: u64) -> u64 {
        if self.partitions.get(index).map(|p| p.is_gc).unwrap_or(true) {
            return off;
        }
        let cluster = off / CLUSTER_DATA_SIZE;
        let within = off % CLUSTER_DATA_SIZE;
        self.part_data_abs(index) + cluster * CLUSTER_SIZE + CLUSTER_HASH_SIZE + within
    }

    /// Walk the files of every selected partition.
    pub fn iterate_files<V>(
        &mut self,
        selection: &Selection,
        pmode: PrefixMode,
        visitor: &mut V,
    ) -> WdResult<()>
    where
        V: FnMut(&FileEntry) -> VisitAction,
    {
        let selected: Vec<usize> = (0..self.partitions.len())
            .filter(|&i| selection.selects(i, &self.partitions[i]))
            .collect();
        let with_prefix = match pmode {
            PrefixMode::Never => false,
            PrefixMode::Always => true,
            PrefixMode::Auto => selected.len() > 1,
        };
        for index in selected {
            if self.ensure_open(index).is_err() {
                tracing::warn!(part = index, "skipping unreadable partition");
                continue;
            }
            let prefix = if with_prefix {
                format!("{}/", self.partitions[index].ptype())
            } else {
                String::new()
            };
            let mut emit = |kind: FileKind, path: String, offset: u64, size: u64| FileEntry {
                kind,
                path,
                part: index,
                offset,
                size,
            };
            let part = &self.partitions[index];
            let mut entries: Vec<FileEntry> = Vec::new();
            if let Some(header) = &part.header {
                entries.push(emit(
                    FileKind::PartHeader,
                    format!("{prefix}ticket.bin"),
                    0,
                    crate::structs::TICKET_SIZE as u64,
                ));
                entries.push(emit(
                    FileKind::PartHeader,
                    format!("{prefix}tmd.bin"),
                    *header.tmd_off,
                    u64::from(header.tmd_size),
                ));
                entries.push(emit(
                    FileKind::PartHeader,
                    format!("{prefix}cert.bin"),
                    *header.cert_off,
                    u64::from(header.cert_size),
                ));
                entries.push(emit(
                    FileKind::PartHeader,
                    format!("{prefix}h3.bin"),
                    *header.h3_off,
                    H3_SIZE as u64,
                ));
            }
            let boot = part.boot.as_ref();
            entries.push(emit(
                FileKind::SystemFile,
                format!("{prefix}sys/boot.bin"),
                0,
                BOOT_SIZE as u64,
            ));
            entries.push(emit(
                FileKind::SystemFile,
                format!("{prefix}sys/bi2.bin"),
                BOOT_SIZE as u64,
                0x2000,
            ));
            if let Some(boot) = boot {
                entries.push(emit(
                    FileKind::SystemFile,
                    format!("{prefix}sys/main.dol"),
                    boot.dol_off(),
                    0, // sized on extraction
                ));
                entries.push(emit(
                    FileKind::SystemFile,
                    format!("{prefix}sys/fst.bin"),
                    boot.fst_off(),
                    boot.fst_size(),
                ));
            }
            entries.push(emit(
                FileKind::SystemFile,
                format!("{prefix}sys/apploader.img"),
                0x2440,
                0,
            ));
            for entry in entries {
                match visitor(&entry) {
                    VisitAction::Stop => return Ok(()),
                    _ => {}
                }
            }
            let fst = self.partitions[index].fst.clone();
            if let Some(fst) = fst {
                let mut stopped = false;
                fst.visit(&mut |visit| {
                    let entry = match visit {
                        FstVisit::EnterDir { path } => FileEntry {
                            kind: FileKind::DirEnter,
                            path: format!("{prefix}files{path}"),
                            part: index,
                            offset: 0,
                            size: 0,
                        },
                        FstVisit::LeaveDir { path } => FileEntry {
                            kind: FileKind::DirLeave,
                            path: format!("{prefix}files{path}"),
                            part: index,
                            offset: 0,
                            size: 0,
                        },
                        FstVisit::File { path, offset, size } => FileEntry {
                            kind: FileKind::File,
                            path: format!("{prefix}files{path}"),
                            part: index,
                            offset,
                            size: u64::from(size),
                        },
                    };
                    let action = visitor(&entry);
                    if action == VisitAction::Stop {
                        stopped = true;
                    }
                    action
                })?;
                if stopped {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Mark `[off, off+len)` of a partition's cleartext view in the usage
    /// map.
    fn mark_clusters(
        map: &mut [u8],
        data_abs: u64,
        value: u8,
        off: u64,
        len: u64,
    ) {
        if len == 0 {
            return;
        }
        let first = off / CLUSTER_DATA_SIZE;
        let last = (off + len - 1) / CLUSTER_DATA_SIZE;
        for cluster in first..=last {
            let sector = (data_abs + cluster * CLUSTER_SIZE) / SECTOR_SIZE;
            for s in 0..(CLUSTER_SIZE / SECTOR_SIZE) {
                let idx = (sector + s) as usize;
                if idx < map.len() {
                    map[idx] = value;
                }
            }
        }
    }

    fn mark_raw(map: &mut [u8], value: u8, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        let first = off / SECTOR_SIZE;
        let last = (off + len - 1) / SECTOR_SIZE;
        for sector in first..=last {
            let idx = sector as usize;
            if idx < map.len() {
                map[idx] = value;
            }
        }
    }

    /// Build the dense per-sector usage map: disc control area, partition
    /// control areas, and every cluster reachable through FST or hash tree.
    pub fn build_usage_map(&mut self) -> WdResult<Vec<u8>> {
        let sectors = self.sf.size().div_ceil(SECTOR_SIZE) as usize;
        let mut map = vec![USAGE_UNUSED; sectors.max(1)];
        if self.is_gc {
            self.build_gc_usage(&mut map)?;
            return Ok(map);
        }
        // disc header, partition tables, region block
        Self::mark_raw(&mut map, USAGE_DISC, 0, 0x50000);
        for index in 0..self.partitions.len() {
            if self.ensure_open(index).is_err() {
                continue;
            }
            let value = USAGE_PART0 + (index as u8 & 0x3F);
            let part_off = self.partitions[index].slot.offset;
            let data_abs = self.part_data_abs(index);
            Self::mark_raw(&mut map, value, part_off, PART_CONTROL_SIZE);
            let part = &self.partitions[index];
            let enc_value = value | USAGE_ENC_FLAG;
            let boot = part.boot.clone();
            let fst = part.fst.clone();
            // system area: boot, bi2, apploader, dol, fst
            if let Some(boot) = &boot {
                let sys_end = boot
                    .fst_off()
                    .max(boot.dol_off())
                    .max(0x2440)
                    + boot.fst_size().max(0x2000);
                Self::mark_clusters(&mut map, data_abs, enc_value, 0, sys_end);
            }
            if let Some(fst) = &fst {
                fst.visit(&mut |visit| {
                    if let FstVisit::File { offset, size, .. } = visit {
                        Self::mark_clusters(
                            &mut map,
                            data_abs,
                            enc_value,
                            offset,
                            u64::from(size),
                        );
                    }
                    VisitAction::Continue
                })?;
            }
        }
        Ok(map)
    }

    fn build_gc_usage(&mut self, map: &mut [u8]) -> WdResult<()> {
        self.ensure_open(0)?;
        let part = &self.partitions[0];
        let boot = part.boot.clone();
        let fst = part.fst.clone();
        Self::mark_raw(map, USAGE_DISC, 0, 0x2440);
        if let Some(boot) = &boot {
            // apploader through fst
            let sys_end = boot.fst_off() + boot.fst_size();
            Self::mark_raw(map, USAGE_PART0, 0x2440, sys_end.saturating_sub(0x2440));
            if boot.dol_off() != 0 {
                // dol size needs its header
                let mut head = vec![0u8; crate::structs::DOL_HEADER_SIZE];
                self.read_part(0, boot.dol_off(), &mut head, true)?;
                if let Ok(dol) = crate::structs::decode::<crate::structs::DolHeader>(
                    &head,
                    crate::structs::DOL_HEADER_SIZE,
                    "dol header",
                ) {
                    Self::mark_raw(map, USAGE_PART0, boot.dol_off(), dol.image_size());
                }
            }
        }
        if let Some(fst) = &fst {
            fst.visit(&mut |visit| {
                if let FstVisit::File { offset, size, .. } = visit {
                    Self::mark_raw(map, USAGE_PART0, offset, u64::from(size));
                }
                VisitAction::Continue
            })?;
        }
        Ok(())
    }

    // ----- pending patches -----

    /// Record any pending patch; applied on reads of the affected virtual
    /// range and materialized by copy or in-place rewrite.
    pub fn apply_patch(&mut self, patch: DiscPatch) -> WdResult<()> {
        match patch {
            DiscPatch::Data { part, offset, bytes } => self.patch_data(part, offset, bytes),
            DiscPatch::FstName {
                part,
                path,
                new_name,
            } => self.patch_fst_name(part, &path, &new_name),
            DiscPatch::Id(id6) => self.patch_id(&id6),
            DiscPatch::Title(title) => self.patch_title(&title),
            DiscPatch::Region(region) => self.patch_region(region),
            DiscPatch::CommonKey { part, index } => self.patch_common_key(part, index),
            DiscPatch::SystemVersion { part, version } => {
                self.patch_system_version(part, version)
            }
            DiscPatch::WiimmfiHost { part, host } => self.patch_wiimmfi_host(part, &host),
        }
    }

    /// Record a cleartext data patch against a partition.
    pub fn patch_data(&mut self, index: usize, off: u64, bytes: Vec<u8>) -> WdResult<()> {
        self.ensure_crypto(index)?;
        self.partitions[index].patches.insert(off, bytes);
        Ok(())
    }

    /// Patch the disc title (header plus every partition boot copy).
    pub fn patch_title(&mut self, title: &str) -> WdResult<()> {
        let mut field = vec![0u8; 0x40];
        let n = title.len().min(0x3F);
        field[..n].copy_from_slice(&title.as_bytes()[..n]);
        self.disc_patches.insert(0x20, field.clone());
        for index in 0..self.partitions.len() {
            if self.ensure_open(index).is_ok() {
                self.partitions[index].patches.insert(0x20, field.clone());
            }
        }
        Ok(())
    }

    /// Patch the disc id6 (header plus partition boot copies).
    pub fn patch_id(&mut self, id6: &str) -> WdResult<()> {
        if id6.len() != 6 || !id6.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(WdError::Syntax(format!("'{id6}' is not a valid id6")));
        }
        self.disc_patches.insert(0, id6.as_bytes().to_vec());
        for index in 0..self.partitions.len() {
            if self.ensure_open(index).is_ok() {
                self.partitions[index]
                    .patches
                    .insert(0, id6.as_bytes().to_vec());
            }
        }
        Ok(())
    }

    /// Patch the region block.
    pub fn patch_region(&mut self, region: u32) -> WdResult<()> {
        self.disc_patches
            .insert(REGION_OFF, region.to_be_bytes().to_vec());
        Ok(())
    }

    /// Re-wrap the title key under another common key slot; the rewritten
    /// ticket is fake signed and patched over the raw control area.
    pub fn patch_common_key(&mut self, index: usize, new_index: u8) -> WdResult<()> {
        self.ensure_crypto(index)?;
        let part = &self.partitions[index];
        let key = part
            .title_key
            .ok_or_else(|| WdError::Crypto("title key unavailable".into()))?;
        let mut ticket = part.header.as_ref().unwrap().ticket.clone();
        ticket.common_key_index = new_index;
        crate::builder::wrap_title_key(&mut ticket, &key, &self.keys)?;
        sign::ticket_fake_sign(&mut ticket)?;
        let bytes = ticket.to_bytes()?;
        let off = self.partitions[index].slot.offset;
        self.partitions[index].header.as_mut().unwrap().ticket = ticket;
        self.disc_patches.insert(off, bytes);
        Ok(())
    }

    /// Patch the TMD system version (IOS); the TMD is re-fake-signed.
    pub fn patch_system_version(&mut self, index: usize, version: u64) -> WdResult<()> {
        self.ensure_header(index)?;
        let part = &mut self.partitions[index];
        let tmd = part.tmd.as_mut().ok_or(WdError::Format("no tmd"))?;
        tmd.sys_version = version;
        sign::tmd_fake_sign(tmd)?;
        let bytes = tmd.to_bytes()?;
        let off = part.slot.offset + *part.header.as_ref().unwrap().tmd_off;
        self.disc_patches.insert(off, bytes);
        Ok(())
    }

    /// Rename an FST entry in place. The new name must fit the old name's
    /// space in the string pool.
    pub fn patch_fst_name(&mut self, index: usize, path: &str, new_name: &str) -> WdResult<()> {
        self.ensure_open(index)?;
        let part = &self.partitions[index];
        let fst = part.fst.as_ref().ok_or(WdError::Format("no fst"))?;
        let record = fst
            .find_file(path)
            .ok_or_else(|| WdError::Missing(path.to_owned()))?;
        let old_name = fst.name(record);
        if new_name.len() > old_name.len() {
            return Err(WdError::Syntax(format!(
                "'{new_name}' is longer than the existing name"
            )));
        }
        let boot = part.boot.as_ref().ok_or(WdError::Format("no boot"))?;
        let name_off = fst.item(record).map(|i| i.name_off()).unwrap_or(0);
        let pool_off =
            boot.fst_off() + fst.len() as u64 * crate::structs::FST_ITEM_SIZE as u64;
        let mut bytes = vec![0u8; old_name.len()];
        bytes[..new_name.len()].copy_from_slice(new_name.as_bytes());
        self.partitions[index]
            .patches
            .insert(pool_off + u64::from(name_off), bytes);
        Ok(())
    }

    /// Redirect the online-service host name inside main.dol.
    pub fn patch_wiimmfi_host(&mut self, index: usize, host: &str) -> WdResult<()> {
        const NEEDLE: &[u8] = b"nintendowifi.net";
        self.ensure_open(index)?;
        let boot = self.partitions[index]
            .boot
            .clone()
            .ok_or(WdError::Format("no boot"))?;
        let mut head = vec![0u8; crate::structs::DOL_HEADER_SIZE];
        self.read_part(index, boot.dol_off(), &mut head, true)?;
        let dol_header: crate::structs::DolHeader = crate::structs::decode(
            &head,
            crate::structs::DOL_HEADER_SIZE,
            "dol header",
        )?;
        let dol_size = dol_header.image_size();
        let mut dol = vec![0u8; dol_size as usize];
        self.read_part(index, boot.dol_off(), &mut dol, true)?;
        if host.len() > NEEDLE.len() {
            return Err(WdError::Syntax("replacement host too long".into()));
        }
        let mut patched = 0;
        let mut pos = 0usize;
        while let Some(found) = dol[pos..]
            .windows(NEEDLE.len())
            .position(|w| w == NEEDLE)
        {
            let at = pos + found;
            let mut replacement = vec![0u8; NEEDLE.len()];
            replacement[..host.len()].copy_from_slice(host.as_bytes());
            self.partitions[index]
                .patches
                .insert(boot.dol_off() + at as u64, replacement);
            patched += 1;
            pos = at + NEEDLE.len();
        }
        if patched == 0 {
            return Err(WdError::Missing("no online-service host in main.dol".into()));
        }
        Ok(())
    }

    pub fn has_patches(&self) -> bool {
        !self.disc_patches.is_empty()
            || self.partitions.iter().any(|p| !p.patches.is_empty())
    }

    pub fn disc_patches(&self) -> &MemMap {
        &self.disc_patches
    }

    /// Ticket bytes of a partition, raw patches applied.
    pub fn ticket_bytes(&mut self, index: usize) -> WdResult<Vec<u8>> {
        self.ensure_header(index)?;
        let off = self.partitions[index].slot.offset;
        let mut buf = vec![0u8; crate::structs::TICKET_SIZE];
        self.read_raw(off, &mut buf)?;
        Ok(buf)
    }

    /// TMD bytes of a partition, raw patches applied.
    pub fn tmd_bytes(&mut self, index: usize) -> WdResult<Vec<u8>> {
        self.ensure_header(index)?;
        let part = &self.partitions[index];
        let header = part.header.as_ref().ok_or(WdError::Format("no header"))?;
        let off = part.slot.offset + *header.tmd_off;
        let mut buf = vec![0u8; header.tmd_size as usize];
        self.read_raw(off, &mut buf)?;
        Ok(buf)
    }

    /// Size of the main DOL of a partition (header walk).
    pub fn dol_size(&mut self, index: usize) -> WdResult<u64> {
        self.ensure_open(index)?;
        let boot = self.partitions[index]
            .boot
            .clone()
            .ok_or(WdError::Format("no boot"))?;
        let mut head = vec![0u8; crate::structs::DOL_HEADER_SIZE];
        self.read_part(index, boot.dol_off(), &mut head, true)?;
        let dol: crate::structs::DolHeader = crate::structs::decode(
            &head,
            crate::structs::DOL_HEADER_SIZE,
            "dol header",
        )?;
        Ok(dol.image_size())
    }

    /// Apploader size (header at 0x2440: two u32 sizes at 0x14/0x18).
    pub fn apploader_size(&mut self, index: usize) -> WdResult<u64> {
        let mut head = vec![0u8; 0x20];
        self.read_part(index, 0x2440, &mut head, true)?;
        let mut cur = Cursor::new(&head[0x14..0x1C]);
        let size1: u32 = cur.read_be()?;
        let size2: u32 = cur.read_be()?;
        Ok(0x20 + u64::from(size1) + u64::from(size2))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::test::{build_test_image, test_keys};
    use crate::container::{CreateOpts, ImageFormat};
    use crate::structs::DISC_HEADER_SIZE;

    fn open_test_disc(dir: &tempfile::TempDir, files: Vec<(String, Vec<u8>)>) -> WiiDisc {
        let image = build_test_image(files);
        let path = dir.path().join("disc.iso");
        std::fs::write(&path, &image).unwrap();
        let sf = Superfile::open(&path).unwrap();
        WiiDisc::open(sf, test_keys()).unwrap()
    }

    #[test]
    fn opens_and_walks_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut disc = open_test_disc(
            &dir,
            vec![
                ("/data/level.bin".into(), vec![7u8; 0x900]),
                ("/readme.txt".into(), b"hi".to_vec()),
            ],
        );
        assert!(!disc.is_gc());
        assert_eq!(disc.partition_count(), 1);
        assert_eq!(disc.main_partition(), Some(0));
        disc.ensure_open(0).unwrap();
        let part = disc.partition(0).unwrap();
        assert_eq!(part.state, PartState::Open);
        assert!(!part.warn_h3_mismatch);
        assert!(!part.warn_id_mismatch);
        assert_eq!(part.boot.as_ref().unwrap().header.id6(), "RTSTW1");
    }

    #[test]
    fn cleartext_reads_find_file_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut disc = open_test_disc(&dir, vec![("/blob.bin".into(), vec![0x5A; 0x2000])]);
        disc.ensure_open(0).unwrap();
        let fst = disc.partition(0).unwrap().fst.clone().unwrap();
        let record = fst.find_file("/blob.bin").unwrap();
        let off = fst.file_offset(record);
        let mut buf = vec![0u8; 0x2000];
        disc.read_part(0, off, &mut buf, true).unwrap();
        assert_eq!(buf, vec![0x5A; 0x2000]);
    }

    #[test]
    fn iterate_files_emits_system_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut disc = open_test_disc(&dir, vec![("/a.bin".into(), vec![1u8; 16])]);
        let mut paths = Vec::new();
        disc.iterate_files(&Selection::all(), PrefixMode::Auto, &mut |entry| {
            paths.push(entry.path.clone());
            VisitAction::Continue
        })
        .unwrap();
        assert!(paths.contains(&"ticket.bin".to_string()));
        assert!(paths.contains(&"sys/main.dol".to_string()));
        assert!(paths.contains(&"files/a.bin".to_string()));
    }

    #[test]
    fn usage_map_covers_control_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut disc = open_test_disc(&dir, vec![("/a.bin".into(), vec![1u8; 64])]);
        let map = disc.build_usage_map().unwrap();
        assert_eq!(map[0], USAGE_DISC);
        // partition control area at 0x50000
        assert_eq!(map[(0x50000 / SECTOR_SIZE) as usize], USAGE_PART0);
        // first data cluster is used and encrypted
        let data_sector = ((0x50000 + PART_CONTROL_SIZE) / SECTOR_SIZE) as usize;
        assert_eq!(map[data_sector], USAGE_PART0 | USAGE_ENC_FLAG);
    }

    #[test]
    fn selection_parsing() {
        let sel = Selection::parse("data,update").unwrap();
        let slot = PartSlot {
            table: 0,
            index: 0,
            offset: 0x50000,
            ptype: PartitionType::Data,
        };
        let part = Partition::new(slot, false);
        assert!(sel.selects(0, &part));
        let sel = Selection::parse("channel").unwrap();
        assert!(!sel.selects(0, &part));
        let sel = Selection::parse("none").unwrap();
        assert!(!sel.selects(0, &part));
        assert!(Selection::parse("bogus").is_err());
    }

    #[test]
    fn id_patch_changes_reads() {
        let dir = tempfile::tempdir().unwrap();
        let mut disc = open_test_disc(&dir, vec![("/a.bin".into(), vec![1u8; 16])]);
        disc.apply_patch(DiscPatch::Id("NEWID1".into())).unwrap();
        let mut buf = [0u8; 6];
        disc.read_raw(0, &mut buf).unwrap();
        assert_eq!(&buf, b"NEWID1");
        let mut buf = vec![0u8; 6];
        disc.read_part(0, 0, &mut buf, true).unwrap();
        assert_eq!(&buf, b"NEWID1");
        assert!(disc.has_patches());
    }

    #[test]
    fn wbfs_embedded_disc_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let image = build_test_image(vec![("/x.bin".into(), vec![9u8; 32])]);
        let path = dir.path().join("games.wbfs");
        let opts = CreateOpts {
            overwrite: false,
            disc_header: Some(image[..DISC_HEADER_SIZE].to_vec()),
            ..CreateOpts::default()
        };
        let mut sf = Superfile::create(&path, ImageFormat::Wbfs, &opts).unwrap();
        sf.write_at(0, &image).unwrap();
        sf.sync().unwrap();
        drop(sf);

        let sf = Superfile::open(&path).unwrap();
        assert_eq!(sf.format(), ImageFormat::Wbfs);
        let mut disc = WiiDisc::open(sf, test_keys()).unwrap();
        disc.ensure_open(0).unwrap();
        assert!(disc.partition(0).unwrap().is_valid());
    }
}
