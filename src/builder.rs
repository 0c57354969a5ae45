//! Disc construction: from partition sources (extracted trees, copies) to a
//! complete image.
//!
//! Wii partitions are written through a staging writer that keeps one
//! supergroup of plaintext in memory, rebuilds its hash metadata and
//! encrypts it on eviction. The partition control area (ticket, TMD, cert
//! chain, H3 table) is fixed up and fake signed once the data is final.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use binrw::BinWriterExt;

use crate::crypto;
use crate::error::{WdError, WdResult};
use crate::fst::{Fst, FstBuilder, FstVisit, VisitAction};
use crate::keys::CommonKeys;
use crate::sign;
use crate::structs::{
    encode, Boot, DiscHeader, PartitionHeader, PartitionType, PtabEntry, Region, Ticket, Tmd,
    TmdContent, BOOT_SIZE, TICKET_SIZE,
};
use crate::{
    align_next, CLUSTER_DATA_SIZE, CLUSTER_SIZE, H3_SIZE, PART_CONTROL_SIZE, PTAB_OFF, REGION_OFF,
    SUPERGROUP_DATA_SIZE, SUPERGROUP_SIZE,
};

const APPLOADER_OFF: u64 = 0x2440;
const BI2_SIZE: usize = 0x2000;
const FIRST_PART_OFF: u64 = 0x50000;

/// Seed buffers from the OS random state; good enough for ticket ids and
/// title keys of freshly created images.
pub fn random_fill(buf: &mut [u8]) {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let state = RandomState::new();
    let mut counter = 0u64;
    for chunk in buf.chunks_mut(8) {
        let mut hasher = state.build_hasher();
        hasher.write_u64(counter);
        counter += 1;
        let bytes = hasher.finish().to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}

fn id4_of(id: &[u8]) -> [u8; 4] {
    let mut id4 = *b"0000";
    for (dst, src) in id4.iter_mut().zip(id.iter()) {
        *dst = *src;
    }
    id4
}

/// Fresh ticket template for CREATE. The returned plaintext title key must
/// be wrapped via [`wrap_title_key`] before the ticket leaves the process.
pub fn ticket_new(id4: &[u8]) -> (Ticket, [u8; 16]) {
    let mut tik = Ticket::default();
    tik.sig_type = 0x10001;
    tik.issuer[..26].copy_from_slice(b"Root-CA00000001-XS00000003");
    tik.title_id[..4].copy_from_slice(&[0, 1, 0, 0]);
    tik.title_id[4..].copy_from_slice(&id4_of(id4));
    tik.permitted_titles = [0xFF; 8];
    tik.unknown2 = 0xFFFF;
    let mut title_key = [0u8; 16];
    random_fill(&mut title_key);
    random_fill(&mut tik.ticket_id);
    tik.ticket_id[0] = 0;
    tik.ticket_id[1] = 1;
    (tik, title_key)
}

/// Store `plain` in the ticket's title-key field, wrapped under the common
/// key the ticket's index selects.
pub fn wrap_title_key(tik: &mut Ticket, plain: &[u8; 16], keys: &CommonKeys) -> WdResult<()> {
    use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
    let common = keys.for_index(tik.common_key_index)?;
    let iv = crypto::title_key_iv(tik);
    let mut wrapped = *plain;
    crypto::Aes128CbcEnc::new(common.into(), iv.as_ref().into())
        .encrypt_padded_mut::<NoPadding>(&mut wrapped, 16)
        .map_err(|_| WdError::Crypto("title key wrap failed".into()))?;
    tik.title_key = wrapped;
    Ok(())
}

/// Fresh TMD template for CREATE: one content record of type 3.
pub fn tmd_new(id4: &[u8]) -> Tmd {
    let mut tmd = Tmd::default();
    tmd.sig_type = 0x10001;
    tmd.issuer[..26].copy_from_slice(b"Root-CA00000001-CP00000004");
    tmd.sys_version = 0x1_0000_0023;
    tmd.title_type = 1;
    tmd.group_id = 0x3031;
    tmd.title_id[..4].copy_from_slice(&[0, 1, 0, 0]);
    tmd.title_id[4..].copy_from_slice(&id4_of(id4));
    tmd.contents.push(TmdContent {
        id: 0,
        index: 0,
        ctype: 3,
        size: 0xFF7C_0000,
        hash: [0; 20],
    });
    tmd
}

/// Staging writer for one Wii partition's encrypted data area. Plaintext
/// addressing; one supergroup is buffered, hashed and encrypted on
/// eviction. Earlier supergroups can be revisited (they are read back and
/// decrypted).
pub struct EncryptedPartWriter<'a, WS: Read + Write + Seek> {
    file: &'a mut WS,
    /// absolute file offset of the partition's data area
    abs_data_off: u64,
    key: [u8; 16],
    h3: Vec<u8>,
    buf: Vec<u8>,
    current: Option<u64>,
    written_sgs: u64,
    pos: u64,
    data_len: u64,
}

impl<'a, WS: Read + Write + Seek> EncryptedPartWriter<'a, WS> {
    pub fn new(file: &'a mut WS, abs_data_off: u64, key: [u8; 16]) -> Self {
        EncryptedPartWriter {
            file,
            abs_data_off,
            key,
            h3: vec![0u8; H3_SIZE],
            buf: vec![0u8; SUPERGROUP_SIZE as usize],
            current: None,
            written_sgs: 0,
            pos: 0,
            data_len: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek_to(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Plaintext bytes written so far (high-water mark).
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    fn flush_current(&mut self) -> WdResult<()> {
        let Some(sg) = self.current.take() else {
            return Ok(());
        };
        let digest = crypto::rebuild_supergroup(&mut self.buf);
        let off = sg as usize * 20;
        if off + 20 > self.h3.len() {
            return Err(WdError::Format("partition exceeds the h3 table"));
        }
        self.h3[off..off + 20].copy_from_slice(&digest);
        crypto::encrypt_supergroup(&mut self.buf, &self.key)?;
        self.file
            .seek(SeekFrom::Start(self.abs_data_off + sg * SUPERGROUP_SIZE))?;
        self.file.write_all(&self.buf)?;
        self.written_sgs = self.written_sgs.max(sg + 1);
        Ok(())
    }

    fn stage(&mut self, sg: u64) -> WdResult<()> {
        if self.current == Some(sg) {
            return Ok(());
        }
        self.flush_current()?;
        if sg < self.written_sgs {
            self.file
                .seek(SeekFrom::Start(self.abs_data_off + sg * SUPERGROUP_SIZE))?;
            self.file.read_exact(&mut self.buf)?;
            crypto::decrypt_supergroup(&mut self.buf, &self.key)?;
        } else {
            self.buf.fill(0);
        }
        self.current = Some(sg);
        Ok(())
    }

    pub fn write_all(&mut self, mut data: &[u8]) -> WdResult<()> {
        while !data.is_empty() {
            let sg = self.pos / SUPERGROUP_DATA_SIZE;
            let within_sg = self.pos % SUPERGROUP_DATA_SIZE;
            let cluster = within_sg / CLUSTER_DATA_SIZE;
            let within = within_sg % CLUSTER_DATA_SIZE;
            self.stage(sg)?;
            let chunk = ((CLUSTER_DATA_SIZE - within) as usize).min(data.len());
            let dst = (cluster * CLUSTER_SIZE + 0x400 + within) as usize;
            self.buf[dst..dst + chunk].copy_from_slice(&data[..chunk]);
            data = &data[chunk..];
            self.pos += chunk as u64;
            self.data_len = self.data_len.max(self.pos);
        }
        Ok(())
    }

    pub fn write_be<T>(&mut self, value: &T) -> WdResult<()>
    where
        T: for<'b> binrw::BinWrite<Args<'b> = ()>,
    {
        let bytes = encode(value)?;
        self.write_all(&bytes)
    }

    /// Flush everything and return the H3 table plus the encrypted data
    /// size (whole supergroups).
    pub fn finish(mut self) -> WdResult<(Vec<u8>, u64)> {
        self.flush_current()?;
        let sgs = self.data_len.div_ceil(SUPERGROUP_DATA_SIZE).max(1);
        // supergroups never touched still need valid all-zero-payload hashes
        for sg in 0..sgs {
            if sg >= self.written_sgs {
                self.stage(sg)?;
                self.flush_current()?;
            }
        }
        self.file.flush()?;
        Ok((self.h3, sgs * SUPERGROUP_SIZE))
    }
}

/// Supplies the pieces of one partition to [`DiscBuilder::add_partition`].
pub trait PartitionSource {
    fn boot(&mut self) -> WdResult<Boot>;
    fn bi2(&mut self) -> WdResult<Vec<u8>>;
    fn apploader(&mut self) -> WdResult<Vec<u8>>;
    fn dol(&mut self) -> WdResult<Vec<u8>>;
    /// FST with final names; offsets and sizes are placeholders.
    fn fst(&mut self) -> WdResult<Fst>;
    fn file_data(&mut self, path: &str) -> WdResult<Vec<u8>>;
    fn progress(&mut self, _done: usize, _total: usize) {}
}

/// Record indices of all file entries in visit order.
fn file_layout(fst: &Fst) -> WdResult<Vec<(usize, String)>> {
    let mut layout: Vec<(usize, String)> = Vec::new();
    fst.visit(&mut |visit| {
        if let FstVisit::File { path, .. } = visit {
            layout.push((0, path.to_owned()));
        }
        VisitAction::Continue
    })?;
    let mut file_no = 0usize;
    for index in 1..fst.len() {
        if !fst.item(index).map(|i| i.is_dir()).unwrap_or(true) {
            layout[file_no].0 = index;
            file_no += 1;
        }
    }
    Ok(layout)
}

/// Builds a Wii disc: control structures per partition plus the global
/// partition table and region block.
pub struct DiscBuilder<WS: Read + Write + Seek> {
    file: WS,
    disc_header: DiscHeader,
    region: Region,
    keys: CommonKeys,
    next_part_off: u64,
    partitions: Vec<PtabEntry>,
}

impl<WS: Read + Write + Seek> DiscBuilder<WS> {
    pub fn new(file: WS, disc_header: DiscHeader, region: Region, keys: CommonKeys) -> Self {
        DiscBuilder {
            file,
            disc_header,
            region,
            keys,
            next_part_off: FIRST_PART_OFF,
            partitions: Vec::new(),
        }
    }

    pub fn add_partition<S: PartitionSource>(
        &mut self,
        ptype: PartitionType,
        ticket: Ticket,
        mut tmd: Tmd,
        cert_chain: &[u8],
        source: &mut S,
    ) -> WdResult<()> {
        let part_off = self.next_part_off;
        let title_key = crypto::unwrap_title_key(&ticket, &self.keys)?;

        let mut header = PartitionHeader {
            ticket,
            ..PartitionHeader::default()
        };
        header.tmd_size = tmd.size() as u32;
        header.tmd_off = (TICKET_SIZE as u64 + 0x1C).into(); // 0x2C0, already 0x20 aligned
        header.cert_size = cert_chain.len() as u32;
        header.cert_off = align_next(*header.tmd_off + u64::from(header.tmd_size), 0x20).into();
        header.h3_off = 0x8000u64.into();
        header.data_off = PART_CONTROL_SIZE.into();
        if *header.cert_off + u64::from(header.cert_size) > *header.h3_off {
            return Err(WdError::Format("partition control area overflow"));
        }

        // encrypted data
        let mut writer =
            EncryptedPartWriter::new(&mut self.file, part_off + PART_CONTROL_SIZE, title_key);
        let mut boot = source.boot()?;
        let mut fst = source.fst()?;
        let total_files = fst.count_files();

        writer.seek_to(0x440);
        writer.write_all(&source.bi2()?)?;
        writer.seek_to(APPLOADER_OFF);
        writer.write_all(&source.apploader()?)?;

        boot.set_dol_off(align_next(writer.position(), 0x20));
        writer.seek_to(boot.dol_off());
        writer.write_all(&source.dol()?)?;

        let fst_off = align_next(writer.position(), 0x20);
        let fst_size = fst.to_bytes()?.len() as u64;
        boot.set_fst(fst_off, fst_size);

        // lay out file data behind the FST, then write the final FST
        let layout = file_layout(&fst)?;
        let mut data_pos = align_next(fst_off + fst_size + 4, 0x40);
        let mut done = 0usize;
        for (index, path) in &layout {
            source.progress(done, total_files);
            done += 1;
            let data = source.file_data(path)?;
            writer.seek_to(data_pos);
            writer.write_all(&data)?;
            fst.set_file_offset(*index, data_pos);
            fst.set_file_size(*index, data.len() as u32);
            data_pos = align_next(data_pos + data.len() as u64, 0x40);
        }
        source.progress(done, total_files);

        writer.seek_to(fst_off);
        writer.write_all(&fst.to_bytes()?)?;
        writer.seek_to(0);
        writer.write_be(&boot)?;

        let data_len = writer.data_len();
        let (h3, encrypted_size) = writer.finish()?;
        header.data_size = encrypted_size.into();

        // pin the hash tree in the TMD and fake sign everything
        if tmd.contents.is_empty() {
            tmd.contents.push(TmdContent::default());
        }
        tmd.contents[0].size = data_len;
        tmd.contents[0].hash = crypto::h3_table_digest(&h3);
        sign::tmd_fake_sign(&mut tmd)?;
        sign::ticket_fake_sign(&mut header.ticket)?;

        self.file.seek(SeekFrom::Start(part_off + *header.tmd_off))?;
        self.file.write_all(&tmd.to_bytes()?)?;
        self.file
            .seek(SeekFrom::Start(part_off + *header.cert_off))?;
        self.file.write_all(cert_chain)?;
        self.file.seek(SeekFrom::Start(part_off + *header.h3_off))?;
        self.file.write_all(&h3)?;
        self.file.seek(SeekFrom::Start(part_off))?;
        self.file.write_be(&header)?;

        self.partitions.push(PtabEntry {
            off: part_off.into(),
            ptype: ptype.raw(),
        });
        self.next_part_off = align_next(part_off + PART_CONTROL_SIZE + encrypted_size, 0x10000);
        Ok(())
    }

    /// Write disc header, region block and partition table.
    pub fn finish(mut self) -> WdResult<WS> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_be(&self.disc_header)?;
        self.file.seek(SeekFrom::Start(REGION_OFF))?;
        self.file.write_be(&self.region)?;
        self.file.seek(SeekFrom::Start(PTAB_OFF))?;
        self.file.write_be(&(self.partitions.len() as u32))?;
        self.file.write_be(&((PTAB_OFF as u32 + 0x20) >> 2))?;
        self.file.seek(SeekFrom::Start(PTAB_OFF + 0x20))?;
        for entry in &self.partitions {
            self.file.write_be(entry)?;
        }
        self.file.flush()?;
        Ok(self.file)
    }
}

fn try_read(path: PathBuf) -> WdResult<Vec<u8>> {
    if !path.is_file() {
        return Err(WdError::Missing(path.display().to_string()));
    }
    Ok(fs::read(path)?)
}

/// Build an FST (placeholder offsets) from a `files/` directory tree.
pub fn fst_from_directory(dir: &Path, scale: u64) -> WdResult<Fst> {
    fn scan(builder: &mut FstBuilder, dir: &Path) -> WdResult<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name().to_string_lossy().to_uppercase());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                builder.begin_dir(&name);
                scan(builder, &entry.path())?;
                builder.end_dir();
            } else {
                builder.add_file(&name, 0, meta.len() as u32);
            }
        }
        Ok(())
    }
    let mut builder = FstBuilder::new(scale);
    scan(&mut builder, dir)?;
    Ok(builder.finish())
}

/// Partition source reading an extracted tree (`sys/…`, `files/…`).
pub struct DirPartitionSource {
    base: PathBuf,
    fst: Fst,
}

impl DirPartitionSource {
    pub fn open(base: &Path, scale: u64) -> WdResult<DirPartitionSource> {
        let fst = fst_from_directory(&base.join("files"), scale)?;
        Ok(DirPartitionSource {
            base: base.to_path_buf(),
            fst,
        })
    }
}

impl PartitionSource for DirPartitionSource {
    fn boot(&mut self) -> WdResult<Boot> {
        let bytes = try_read(self.base.join("sys").join("boot.bin"))?;
        crate::structs::decode(&bytes, BOOT_SIZE, "boot.bin")
    }

    fn bi2(&mut self) -> WdResult<Vec<u8>> {
        try_read(self.base.join("sys").join("bi2.bin"))
    }

    fn apploader(&mut self) -> WdResult<Vec<u8>> {
        try_read(self.base.join("sys").join("apploader.img"))
    }

    fn dol(&mut self) -> WdResult<Vec<u8>> {
        try_read(self.base.join("sys").join("main.dol"))
    }

    fn fst(&mut self) -> WdResult<Fst> {
        Ok(self.fst.clone())
    }

    fn file_data(&mut self, path: &str) -> WdResult<Vec<u8>> {
        let mut fs_path = self.base.join("files");
        for part in path.trim_start_matches('/').split('/') {
            fs_path.push(part);
        }
        try_read(fs_path)
    }
}

fn partition_type_of_dir(name: &str) -> PartitionType {
    match name {
        "DATA" => PartitionType::Data,
        "UPDATE" => PartitionType::Update,
        "CHANNEL" => PartitionType::Channel,
        other => other
            .strip_prefix("P-")
            .and_then(|n| n.parse().ok())
            .map(PartitionType::Other)
            .unwrap_or(PartitionType::Data),
    }
}

/// Build a complete image from an extracted FST tree.
///
/// Multi-partition trees keep one subdirectory per partition (`DATA`,
/// `UPDATE`, …); a tree with `sys/` at the top level is a single DATA
/// partition. GameCube trees are written as plain unencrypted images.
pub fn build_from_fst_tree<WS: Read + Write + Seek>(
    dir: &Path,
    dest: &mut WS,
    keys: &CommonKeys,
) -> WdResult<()> {
    let flat = dir.join("sys").join("boot.bin").is_file();
    let data_dir = if flat { dir.to_path_buf() } else { dir.join("DATA") };
    let boot_bytes = try_read(data_dir.join("sys").join("boot.bin"))?;
    let boot: Boot = crate::structs::decode(&boot_bytes, BOOT_SIZE, "boot.bin")?;

    if boot.header.is_gamecube() {
        return build_gc_from_tree(&data_dir, dest);
    }
    if !boot.header.is_wii() {
        return Err(WdError::Format("boot.bin: no disc magic"));
    }

    let mut disc_header = boot.header.clone();
    disc_header.disable_disc_enc = 0;
    disc_header.disable_hash_verification = 0;
    let region = match try_read(data_dir.join("disc").join("region.bin")) {
        Ok(bytes) => crate::structs::decode(&bytes, 0x20, "region.bin")?,
        Err(_) => Region::default(),
    };

    let mut parts: Vec<(PartitionType, PathBuf)> = Vec::new();
    if flat {
        parts.push((PartitionType::Data, data_dir.clone()));
    } else {
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join("ticket.bin").is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        // the DATA partition leads, everything else follows in name order
        names.sort_by_key(|n| (n != "DATA", n.clone()));
        for name in names {
            parts.push((partition_type_of_dir(&name), dir.join(&name)));
        }
    }
    if parts.is_empty() {
        return Err(WdError::Missing(format!(
            "{}: no partition directories",
            dir.display()
        )));
    }

    let mut builder = DiscBuilder::new(dest, disc_header, region, keys.clone());
    for (ptype, base) in parts {
        let ticket = Ticket::from_bytes(&try_read(base.join("ticket.bin"))?)?;
        let tmd = Tmd::from_bytes(&try_read(base.join("tmd.bin"))?)?;
        let cert = try_read(base.join("cert.bin")).unwrap_or_default();
        let mut source = DirPartitionSource::open(&base, 4)?;
        builder.add_partition(ptype, ticket, tmd, &cert, &mut source)?;
    }
    builder.finish()?;
    Ok(())
}

/// GameCube images are plain: boot, bi2, apploader, dol, FST and file data
/// written without any encryption layer.
pub fn build_gc_from_tree<WS: Read + Write + Seek>(dir: &Path, dest: &mut WS) -> WdResult<()> {
    let mut source = DirPartitionSource::open(dir, 1)?;
    let mut boot = source.boot()?;
    let bi2 = source.bi2()?;
    let apploader = source.apploader()?;
    let dol = source.dol()?;
    let mut fst = source.fst()?;

    dest.seek(SeekFrom::Start(0x440))?;
    dest.write_all(&bi2[..bi2.len().min(BI2_SIZE)])?;
    dest.seek(SeekFrom::Start(APPLOADER_OFF))?;
    dest.write_all(&apploader)?;
    let dol_off = align_next(dest.stream_position()?, 0x100);
    boot.set_dol_off(dol_off);
    dest.seek(SeekFrom::Start(dol_off))?;
    dest.write_all(&dol)?;
    let fst_off = align_next(dest.stream_position()?, 0x100);
    let fst_size = fst.to_bytes()?.len() as u64;
    boot.set_fst(fst_off, fst_size);

    let layout = file_layout(&fst)?;
    let mut data_pos = align_next(fst_off + fst_size, 0x100);
    for (index, path) in &layout {
        let data = source.file_data(path)?;
        dest.seek(SeekFrom::Start(data_pos))?;
        dest.write_all(&data)?;
        fst.set_file_offset(*index, data_pos);
        fst.set_file_size(*index, data.len() as u32);
        data_pos = align_next(data_pos + data.len() as u64, 0x20);
    }
    dest.seek(SeekFrom::Start(fst_off))?;
    dest.write_all(&fst.to_bytes()?)?;
    dest.seek(SeekFrom::Start(0))?;
    dest.write_be(&boot)?;
    dest.flush()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::keys::KeySlot;
    use crate::structs::DolHeader;
    use std::io::Cursor;

    pub(crate) struct MemSource {
        pub files: Vec<(String, Vec<u8>)>,
        pub is_gc: bool,
        pub id6: [u8; 6],
    }

    impl MemSource {
        pub(crate) fn new(id6: &[u8; 6], files: Vec<(String, Vec<u8>)>) -> Self {
            MemSource {
                files,
                is_gc: false,
                id6: *id6,
            }
        }
    }

    impl PartitionSource for MemSource {
        fn boot(&mut self) -> WdResult<Boot> {
            Ok(Boot {
                header: DiscHeader::new(&self.id6, "builder test", self.is_gc),
                ..Boot::default()
            })
        }

        fn bi2(&mut self) -> WdResult<Vec<u8>> {
            Ok(vec![0x11; BI2_SIZE])
        }

        fn apploader(&mut self) -> WdResult<Vec<u8>> {
            Ok(vec![0x22; 0x800])
        }

        fn dol(&mut self) -> WdResult<Vec<u8>> {
            let header = DolHeader {
                entry_point: 0x8000_4000,
                ..DolHeader::default()
            };
            let mut dol = encode(&header).unwrap();
            dol.extend_from_slice(&[0x33; 0x100]);
            Ok(dol)
        }

        fn fst(&mut self) -> WdResult<Fst> {
            let mut b = FstBuilder::new(if self.is_gc { 1 } else { 4 });
            for (path, data) in &self.files {
                b.add_file(path.trim_start_matches('/'), 0, data.len() as u32);
            }
            Ok(b.finish())
        }

        fn file_data(&mut self, path: &str) -> WdResult<Vec<u8>> {
            self.files
                .iter()
                .find(|(p, _)| p == path)
                .map(|(_, d)| d.clone())
                .ok_or_else(|| WdError::Missing(path.to_owned()))
        }
    }

    pub(crate) fn test_keys() -> CommonKeys {
        let mut keys = CommonKeys::default();
        keys.set(KeySlot::Standard, *b"0123456789abcdef");
        keys
    }

    /// A small signed one-partition image used across the test suite.
    pub(crate) fn build_test_image(files: Vec<(String, Vec<u8>)>) -> Vec<u8> {
        let keys = test_keys();
        let (mut ticket, title_key) = ticket_new(b"RTST");
        wrap_title_key(&mut ticket, &title_key, &keys).unwrap();
        let tmd = tmd_new(b"RTST");
        let mut image = Cursor::new(Vec::new());
        let mut builder = DiscBuilder::new(
            &mut image,
            DiscHeader::new(b"RTSTW1", "builder test", false),
            Region::default(),
            keys,
        );
        let mut source = MemSource::new(b"RTSTW1", files);
        builder
            .add_partition(PartitionType::Data, ticket, tmd, &[0u8; 0x40], &mut source)
            .unwrap();
        builder.finish().unwrap();
        image.into_inner()
    }

    #[test]
    fn builds_a_signed_partition() {
        let image = build_test_image(vec![("/hello.txt".into(), b"hello world".to_vec())]);
        assert_eq!(&image[..6], b"RTSTW1");
        // partition table announces one partition at 0x50000
        assert_eq!(
            &image[PTAB_OFF as usize..PTAB_OFF as usize + 4],
            &1u32.to_be_bytes()
        );
        let part: PartitionHeader = crate::structs::decode(
            &image[0x50000..0x50000 + crate::structs::PART_HEADER_SIZE],
            crate::structs::PART_HEADER_SIZE,
            "part header",
        )
        .unwrap();
        assert!(sign::ticket_is_fake_signed(&part.ticket));
        assert_eq!(*part.data_off, PART_CONTROL_SIZE);
        assert_eq!(*part.data_size, SUPERGROUP_SIZE);
        let tmd_bytes = &image[0x50000 + *part.tmd_off as usize..][..part.tmd_size as usize];
        let tmd = Tmd::from_bytes(tmd_bytes).unwrap();
        assert!(sign::tmd_is_fake_signed(&tmd));
        // TMD content hash pins the H3 table
        let h3 = &image[0x50000 + *part.h3_off as usize..][..H3_SIZE];
        assert_eq!(tmd.contents[0].hash, crypto::h3_table_digest(h3));
    }

    #[test]
    fn gc_tree_builds_plain() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        fs::create_dir_all(base.join("sys")).unwrap();
        fs::create_dir_all(base.join("files")).unwrap();
        let boot = Boot {
            header: DiscHeader::new(b"GTSTG1", "gc test", true),
            ..Boot::default()
        };
        fs::write(base.join("sys/boot.bin"), encode(&boot).unwrap()).unwrap();
        fs::write(base.join("sys/bi2.bin"), vec![0u8; BI2_SIZE]).unwrap();
        fs::write(base.join("sys/apploader.img"), vec![1u8; 64]).unwrap();
        let dol = encode(&DolHeader::default()).unwrap();
        fs::write(base.join("sys/main.dol"), dol).unwrap();
        fs::write(base.join("files/readme.txt"), b"gc data").unwrap();

        let mut image = Cursor::new(Vec::new());
        build_from_fst_tree(base, &mut image, &CommonKeys::default()).unwrap();
        let image = image.into_inner();
        assert_eq!(&image[..6], b"GTSTG1");
        // gc magic, not wii
        assert_eq!(&image[0x1C..0x20], &crate::GC_MAGIC.to_be_bytes());
        let boot: Boot = crate::structs::decode(&image[..BOOT_SIZE], BOOT_SIZE, "boot").unwrap();
        let fst = Fst::parse(
            &image[boot.fst_off() as usize..][..boot.fst_size() as usize],
            1,
        )
        .unwrap();
        let index = fst.find_file("/readme.txt").unwrap();
        let off = fst.file_offset(index) as usize;
        assert_eq!(&image[off..off + 7], b"gc data");
    }
}
