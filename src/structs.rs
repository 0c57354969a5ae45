//! Fixed-offset on-disc structures.
//!
//! All multi-byte integers are big-endian on disc; every struct here is read
//! and written through binrw with `read_be`/`write_be`. The serialized sizes
//! are load-bearing (offsets of later regions are computed from them) and are
//! pinned by [`SIZES`] plus decode-time checks.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::ops::Deref;

use binrw::{binrw, BinRead, BinReaderExt, BinWrite};

use crate::error::{WdError, WdResult};
use crate::{GC_MAGIC, PTAB_OFF, WII_MAGIC};

pub const DISC_HEADER_SIZE: usize = 0x100;
pub const BOOT_SIZE: usize = 0x440;
pub const REGION_SIZE: usize = 0x20;
pub const TICKET_SIZE: usize = 0x2A4;
pub const TICKET_SIG_OFF: usize = 0x140;
pub const TICKET_BRUTE_FORCE_OFF: usize = 0x24C;
pub const TICKET_KEY_OFF: usize = 0x1BF;
pub const TICKET_IV_OFF: usize = 0x1DC;
pub const TMD_BASE_SIZE: usize = 0x1E4;
pub const TMD_CONTENT_SIZE: usize = 0x24;
pub const TMD_SIG_OFF: usize = 0x140;
pub const TMD_BRUTE_FORCE_OFF: usize = 0x19A;
pub const PART_HEADER_SIZE: usize = 0x2C0;
pub const FST_ITEM_SIZE: usize = 12;
pub const DOL_HEADER_SIZE: usize = 0x100;

pub const DOL_N_TEXT_SECTIONS: usize = 7;
pub const DOL_N_DATA_SECTIONS: usize = 11;
pub const DOL_N_SECTIONS: usize = DOL_N_TEXT_SECTIONS + DOL_N_DATA_SECTIONS;

/// A disc offset stored on disc as `u32` in units of 4 bytes.
#[binrw]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Off4(
    #[br(map = |raw: u32| u64::from(raw) << 2)]
    #[bw(map = |v: &u64| (*v >> 2) as u32)]
    pub u64,
);

impl Deref for Off4 {
    type Target = u64;

    fn deref(&self) -> &u64 {
        &self.0
    }
}

impl From<u64> for Off4 {
    fn from(v: u64) -> Self {
        Off4(v)
    }
}

/// Decode a struct from a buffer whose length must match the serialized size
/// exactly.
pub fn decode<T>(bytes: &[u8], expect: usize, what: &'static str) -> WdResult<T>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    if bytes.len() != expect {
        return Err(WdError::Format(what));
    }
    let mut cur = Cursor::new(bytes);
    let value = T::read_be(&mut cur)?;
    if cur.position() != expect as u64 {
        return Err(WdError::Format(what));
    }
    Ok(value)
}

/// Serialize a struct to its big-endian on-disc form.
pub fn encode<T>(value: &T) -> WdResult<Vec<u8>>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut buf = Cursor::new(Vec::new());
    value.write_be(&mut buf)?;
    Ok(buf.into_inner())
}

/// The 0x100 byte disc header found at offset 0 of every image and at the
/// start of every partition's decrypted view.
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscHeader {
    pub disc_id: [u8; 6],
    pub disc_number: u8,
    pub disc_version: u8,
    pub audio_streaming: u8,
    pub stream_buf_size: u8,
    pub unused1: [u8; 14],
    pub wii_magic: u32,
    pub gc_magic: u32,
    pub disc_title: [u8; 0x40],
    pub disable_hash_verification: u8,
    pub disable_disc_enc: u8,
    pub unused2: [u8; 0x9E],
}

impl Default for DiscHeader {
    fn default() -> Self {
        DiscHeader {
            disc_id: *b"000000",
            disc_number: 0,
            disc_version: 0,
            audio_streaming: 0,
            stream_buf_size: 0,
            unused1: [0; 14],
            wii_magic: 0,
            gc_magic: 0,
            disc_title: [0; 0x40],
            disable_hash_verification: 0,
            disable_disc_enc: 0,
            unused2: [0; 0x9E],
        }
    }
}

/// Disc attributes recognized from the header id area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscAttributes {
    pub multi_boot: bool,
    pub dvd9: bool,
}

impl DiscHeader {
    pub fn new(id6: &[u8], title: &str, is_gc: bool) -> Self {
        let mut hdr = DiscHeader::default();
        for (dst, src) in hdr.disc_id.iter_mut().zip(id6.iter()) {
            *dst = *src;
        }
        for (dst, src) in hdr.disc_title.iter_mut().zip(title.bytes()) {
            *dst = src;
        }
        if is_gc {
            hdr.gc_magic = GC_MAGIC;
        } else {
            hdr.wii_magic = WII_MAGIC;
        }
        hdr
    }

    pub fn is_wii(&self) -> bool {
        self.wii_magic == WII_MAGIC
    }

    pub fn is_gamecube(&self) -> bool {
        self.gc_magic == GC_MAGIC
    }

    pub fn id6(&self) -> String {
        String::from_utf8_lossy(&self.disc_id).into_owned()
    }

    /// Disc title, decoded as UTF-8 with a SHIFT_JIS fallback for Japanese
    /// GameCube images.
    pub fn title(&self) -> String {
        let raw = &self.disc_title;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let raw = &raw[..end];
        match std::str::from_utf8(raw) {
            Ok(s) => s.to_owned(),
            Err(_) => {
                let (text, _, _) = encoding_rs::SHIFT_JIS.decode(raw);
                text.into_owned()
            }
        }
    }

    /// Multi-boot recognition via the special id words; DVD9 images carry a
    /// secondary magic at byte 4 of the id area. The flags never compose
    /// with the region block.
    pub fn attributes(&self) -> DiscAttributes {
        let mut attrib = DiscAttributes::default();
        if !self.is_gamecube() {
            return attrib;
        }
        const MULTI_BOOT_IDS: [&[u8; 6]; 4] = [b"GCOPDV", b"COBRAM", b"GGCOSD", b"RGCOSD"];
        if MULTI_BOOT_IDS.iter().any(|id| self.disc_id == **id) {
            attrib.multi_boot = true;
            if &self.disc_id[4..6] == b"DV" {
                // full check needs the two bytes following the id
                attrib.dvd9 = self.disc_number == b'D' && self.disc_version == b'9';
            }
        }
        attrib
    }
}

/// The 0x440 byte boot block: disc header plus the dol/fst locators at
/// 0x420. On Wii discs the offsets are in units of 4 bytes, on GameCube
/// discs they are plain byte offsets.
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boot {
    pub header: DiscHeader,
    pub unused1: [u8; 0x320],
    pub dol_off4: u32,
    pub fst_off4: u32,
    pub fst_size4: u32,
    pub max_fst_size4: u32,
    pub unused2: [u8; 0x10],
}

impl Default for Boot {
    fn default() -> Self {
        Boot {
            header: DiscHeader::default(),
            unused1: [0; 0x320],
            dol_off4: 0,
            fst_off4: 0,
            fst_size4: 0,
            max_fst_size4: 0,
            unused2: [0; 0x10],
        }
    }
}

impl Boot {
    fn scale(&self) -> u64 {
        if self.header.is_gamecube() {
            1
        } else {
            4
        }
    }

    pub fn dol_off(&self) -> u64 {
        u64::from(self.dol_off4) * self.scale()
    }

    pub fn fst_off(&self) -> u64 {
        u64::from(self.fst_off4) * self.scale()
    }

    pub fn fst_size(&self) -> u64 {
        u64::from(self.fst_size4) * self.scale()
    }

    pub fn set_dol_off(&mut self, off: u64) {
        self.dol_off4 = (off / self.scale()) as u32;
    }

    pub fn set_fst(&mut self, off: u64, size: u64) {
        self.fst_off4 = (off / self.scale()) as u32;
        self.fst_size4 = (size / self.scale()) as u32;
        self.max_fst_size4 = self.max_fst_size4.max(self.fst_size4);
    }
}

/// The 0x20 byte region block at disc offset 0x4E000.
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub region: u32,
    pub padding: [u8; 12],
    pub age_ratings: [u8; 16],
}

impl Default for Region {
    fn default() -> Self {
        Region {
            region: 0,
            padding: [0; 12],
            age_ratings: [0x80; 16],
        }
    }
}

/// One of the four partition table descriptors at 0x40000.
#[binrw]
#[derive(Debug, Clone, Copy, Default)]
pub struct PtabInfo {
    pub n_part: u32,
    pub off: Off4,
}

/// Raw partition table entry: absolute disc offset (off4) and type word.
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtabEntry {
    pub off: Off4,
    pub ptype: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionType {
    Data,
    Update,
    Channel,
    Other(u32),
}

impl From<u32> for PartitionType {
    fn from(raw: u32) -> Self {
        match raw {
            0 => PartitionType::Data,
            1 => PartitionType::Update,
            2 => PartitionType::Channel,
            other => PartitionType::Other(other),
        }
    }
}

impl PartitionType {
    pub fn raw(&self) -> u32 {
        match self {
            PartitionType::Data => 0,
            PartitionType::Update => 1,
            PartitionType::Channel => 2,
            PartitionType::Other(raw) => *raw,
        }
    }
}

impl std::fmt::Display for PartitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionType::Data => write!(f, "DATA"),
            PartitionType::Update => write!(f, "UPDATE"),
            PartitionType::Channel => write!(f, "CHANNEL"),
            PartitionType::Other(raw) => write!(f, "P-{raw}"),
        }
    }
}

/// A resolved partition table entry: which of the four tables it came from,
/// its index there, and where the partition lives on disc.
#[derive(Debug, Clone, Copy)]
pub struct PartSlot {
    pub table: usize,
    pub index: usize,
    pub offset: u64,
    pub ptype: PartitionType,
}

/// Read all four partition tables. When multiple slots reference the same
/// partition offset the first encountered wins.
pub fn read_part_slots<RS: Read + Seek>(rs: &mut RS) -> WdResult<Vec<PartSlot>> {
    rs.seek(SeekFrom::Start(PTAB_OFF))?;
    let mut infos = [PtabInfo::default(); 4];
    for info in infos.iter_mut() {
        *info = rs.read_be()?;
    }
    let mut slots: Vec<PartSlot> = Vec::new();
    for (table, info) in infos.iter().enumerate() {
        if info.n_part == 0 {
            continue;
        }
        if info.n_part > 0x100 {
            return Err(WdError::Format("partition table"));
        }
        rs.seek(SeekFrom::Start(*info.off))?;
        for index in 0..info.n_part as usize {
            let entry: PtabEntry = rs.read_be()?;
            if slots.iter().any(|s| s.offset == *entry.off) {
                continue;
            }
            slots.push(PartSlot {
                table,
                index,
                offset: *entry.off,
                ptype: PartitionType::from(entry.ptype),
            });
        }
    }
    Ok(slots)
}

/// Ticket, 0x2A4 bytes. The signed region starts at the issuer (0x140); the
/// brute-force field used by fake signing sits at 0x24C.
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub sig_type: u32,
    pub sig: [u8; 0x100],
    pub sig_padding: [u8; 0x3C],
    pub issuer: [u8; 0x40],
    pub ecdh: [u8; 0x3C],
    pub format_version: u8,
    pub reserved: [u8; 2],
    pub title_key: [u8; 16],
    pub unknown1: u8,
    pub ticket_id: [u8; 8],
    pub console_id: [u8; 4],
    pub title_id: [u8; 8],
    pub unknown2: u16,
    pub ticket_version: u16,
    pub permitted_titles: [u8; 8],
    pub title_export: u8,
    pub common_key_index: u8,
    pub unknown3: [u8; 0x30],
    pub content_permissions: [u8; 0x2A],
    pub fake_sign: [u8; 0x58],
}

impl Default for Ticket {
    fn default() -> Self {
        Ticket {
            sig_type: 0x10001,
            sig: [0; 0x100],
            sig_padding: [0; 0x3C],
            issuer: [0; 0x40],
            ecdh: [0; 0x3C],
            format_version: 0,
            reserved: [0; 2],
            title_key: [0; 16],
            unknown1: 0,
            ticket_id: [0; 8],
            console_id: [0; 4],
            title_id: [0; 8],
            unknown2: 0,
            ticket_version: 0,
            permitted_titles: [0; 8],
            title_export: 0,
            common_key_index: 0,
            unknown3: [0; 0x30],
            content_permissions: [0; 0x2A],
            fake_sign: [0; 0x58],
        }
    }
}

impl Ticket {
    pub fn to_bytes(&self) -> WdResult<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> WdResult<Self> {
        decode(bytes, TICKET_SIZE, "ticket")
    }
}

/// One TMD content record, 0x24 bytes; `hash` of record 0 pins the H3 table.
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmdContent {
    pub id: u32,
    pub index: u16,
    pub ctype: u16,
    pub size: u64,
    pub hash: [u8; 20],
}

impl Default for TmdContent {
    fn default() -> Self {
        TmdContent {
            id: 0,
            index: 0,
            ctype: 3,
            size: 0,
            hash: [0; 20],
        }
    }
}

/// Title metadata, 0x1E4 bytes base plus one 0x24 byte record per content.
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tmd {
    pub sig_type: u32,
    pub sig: [u8; 0x100],
    pub sig_padding: [u8; 0x3C],
    pub issuer: [u8; 0x40],
    pub version: u8,
    pub ca_crl_version: u8,
    pub signer_crl_version: u8,
    pub padding1: u8,
    pub sys_version: u64,
    pub title_id: [u8; 8],
    pub title_type: u32,
    pub group_id: u16,
    pub fake_sign: [u8; 0x3E],
    pub access_rights: u32,
    pub title_version: u16,
    #[br(temp)]
    #[bw(calc = contents.len() as u16)]
    n_content: u16,
    pub boot_index: u16,
    pub padding2: [u8; 2],
    #[br(count = n_content)]
    pub contents: Vec<TmdContent>,
}

impl Default for Tmd {
    fn default() -> Self {
        Tmd {
            sig_type: 0x10001,
            sig: [0; 0x100],
            sig_padding: [0; 0x3C],
            issuer: [0; 0x40],
            version: 0,
            ca_crl_version: 0,
            signer_crl_version: 0,
            padding1: 0,
            sys_version: 0,
            title_id: [0; 8],
            title_type: 0,
            group_id: 0,
            fake_sign: [0; 0x3E],
            access_rights: 0,
            title_version: 0,
            boot_index: 0,
            padding2: [0; 2],
            contents: Vec::new(),
        }
    }
}

impl Tmd {
    pub fn size(&self) -> usize {
        TMD_BASE_SIZE + self.contents.len() * TMD_CONTENT_SIZE
    }

    pub fn to_bytes(&self) -> WdResult<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> WdResult<Self> {
        if bytes.len() < TMD_BASE_SIZE
            || (bytes.len() - TMD_BASE_SIZE) % TMD_CONTENT_SIZE != 0
        {
            return Err(WdError::Format("tmd"));
        }
        let mut cur = Cursor::new(bytes);
        let tmd: Tmd = cur.read_be()?;
        if tmd.size() != bytes.len() {
            return Err(WdError::Format("tmd"));
        }
        Ok(tmd)
    }
}

/// Partition header, 0x2C0 bytes: ticket followed by the locators of TMD,
/// certificate chain, H3 table and encrypted data region. All offsets are
/// relative to the partition start and in units of 4 bytes.
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHeader {
    pub ticket: Ticket,
    pub tmd_size: u32,
    pub tmd_off: Off4,
    pub cert_size: u32,
    pub cert_off: Off4,
    pub h3_off: Off4,
    pub data_off: Off4,
    pub data_size: Off4,
}

impl Default for PartitionHeader {
    fn default() -> Self {
        PartitionHeader {
            ticket: Ticket::default(),
            tmd_size: 0,
            tmd_off: Off4::default(),
            cert_size: 0,
            cert_off: Off4::default(),
            h3_off: Off4::default(),
            data_off: Off4::default(),
            data_size: Off4::default(),
        }
    }
}

/// Raw 12-byte file-system-table record.
#[binrw]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FstItem {
    pub kind_and_name: u32,
    pub offset: u32,
    pub size: u32,
}

impl FstItem {
    pub fn is_dir(&self) -> bool {
        self.kind_and_name >> 24 != 0
    }

    pub fn name_off(&self) -> u32 {
        self.kind_and_name & 0x00FF_FFFF
    }

    pub fn new(is_dir: bool, name_off: u32, offset: u32, size: u32) -> Self {
        FstItem {
            kind_and_name: (u32::from(is_dir) << 24) | (name_off & 0x00FF_FFFF),
            offset,
            size,
        }
    }
}

/// DOL executable header: 7 text and 11 data sections, each with file
/// offset, load address and size, then bss and entry point.
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DolHeader {
    pub sect_off: [u32; DOL_N_SECTIONS],
    pub sect_addr: [u32; DOL_N_SECTIONS],
    pub sect_size: [u32; DOL_N_SECTIONS],
    pub bss_addr: u32,
    pub bss_size: u32,
    pub entry_point: u32,
    pub padding: [u8; 0x1C],
}

impl Default for DolHeader {
    fn default() -> Self {
        DolHeader {
            sect_off: [0; DOL_N_SECTIONS],
            sect_addr: [0; DOL_N_SECTIONS],
            sect_size: [0; DOL_N_SECTIONS],
            bss_addr: 0,
            bss_size: 0,
            entry_point: 0,
            padding: [0; 0x1C],
        }
    }
}

impl DolHeader {
    /// Total on-disc size: end of the farthest section, at least the header.
    pub fn image_size(&self) -> u64 {
        let mut size = DOL_HEADER_SIZE as u64;
        for i in 0..DOL_N_SECTIONS {
            if self.sect_off[i] != 0 && self.sect_size[i] != 0 {
                size = size.max(u64::from(self.sect_off[i]) + u64::from(self.sect_size[i]));
            }
        }
        size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn serialized_len<T>(value: &T) -> usize
    where
        T: for<'a> BinWrite<Args<'a> = ()>,
    {
        encode(value).unwrap().len()
    }

    #[test]
    fn struct_sizes_are_exact() {
        assert_eq!(serialized_len(&DiscHeader::default()), DISC_HEADER_SIZE);
        assert_eq!(serialized_len(&Boot::default()), BOOT_SIZE);
        assert_eq!(serialized_len(&Region::default()), REGION_SIZE);
        assert_eq!(serialized_len(&Ticket::default()), TICKET_SIZE);
        assert_eq!(serialized_len(&Tmd::default()), TMD_BASE_SIZE);
        assert_eq!(serialized_len(&TmdContent::default()), TMD_CONTENT_SIZE);
        assert_eq!(serialized_len(&PartitionHeader::default()), PART_HEADER_SIZE);
        assert_eq!(serialized_len(&FstItem::default()), FST_ITEM_SIZE);
        assert_eq!(serialized_len(&DolHeader::default()), DOL_HEADER_SIZE);
    }

    #[test]
    fn ticket_field_offsets() {
        let mut tik = Ticket::default();
        tik.issuer[0] = 0xAA;
        tik.title_key[0] = 0xBB;
        tik.title_id[0] = 0xCC;
        tik.fake_sign[0] = 0xDD;
        let bytes = tik.to_bytes().unwrap();
        assert_eq!(bytes[TICKET_SIG_OFF], 0xAA);
        assert_eq!(bytes[TICKET_KEY_OFF], 0xBB);
        assert_eq!(bytes[TICKET_IV_OFF], 0xCC);
        assert_eq!(bytes[TICKET_BRUTE_FORCE_OFF], 0xDD);
    }

    #[test]
    fn tmd_field_offsets() {
        let mut tmd = Tmd::default();
        tmd.issuer[0] = 0xAA;
        tmd.fake_sign[0] = 0xBB;
        tmd.contents.push(TmdContent {
            hash: [0xCC; 20],
            ..TmdContent::default()
        });
        let bytes = tmd.to_bytes().unwrap();
        assert_eq!(bytes.len(), TMD_BASE_SIZE + TMD_CONTENT_SIZE);
        assert_eq!(bytes[TMD_SIG_OFF], 0xAA);
        assert_eq!(bytes[TMD_BRUTE_FORCE_OFF], 0xBB);
        assert_eq!(bytes[0x1F4], 0xCC); // content[0].hash
    }

    #[test]
    fn endian_round_trip() {
        let mut hdr = DiscHeader::new(b"RTESTW", "round trip", false);
        hdr.disc_number = 1;
        let bytes = encode(&hdr).unwrap();
        let back: DiscHeader = decode(&bytes, DISC_HEADER_SIZE, "disc header").unwrap();
        assert_eq!(hdr, back);

        let tik = Ticket::default();
        let bytes = tik.to_bytes().unwrap();
        assert_eq!(Ticket::from_bytes(&bytes).unwrap(), tik);

        let raw = 0x1234_5678u32.to_be_bytes();
        let off: Off4 = decode(&raw, 4, "off4").unwrap();
        assert_eq!(*off, u64::from(0x1234_5678u32) << 2);
        assert_eq!(encode(&off).unwrap(), raw);
    }

    #[test]
    fn rejects_wrong_sizes() {
        assert!(Ticket::from_bytes(&[0u8; TICKET_SIZE - 1]).is_err());
        assert!(Tmd::from_bytes(&[0u8; TMD_BASE_SIZE + 1]).is_err());
    }

    #[test]
    fn recognizes_disc_kinds() {
        let wii = DiscHeader::new(b"RMCP01", "wii", false);
        assert!(wii.is_wii() && !wii.is_gamecube());
        let gc = DiscHeader::new(b"GALE01", "gc", true);
        assert!(gc.is_gamecube() && !gc.is_wii());
        assert!(!gc.attributes().multi_boot);

        let mut mb = DiscHeader::new(b"GCOPDV", "multi", true);
        mb.disc_number = b'D';
        mb.disc_version = b'9';
        let attrib = mb.attributes();
        assert!(attrib.multi_boot && attrib.dvd9);
    }
}
