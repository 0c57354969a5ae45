//! End-to-end scenarios over complete images.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use wiidisc::builder::{
    ticket_new, tmd_new, wrap_title_key, DiscBuilder, PartitionSource,
};
use wiidisc::container::{CreateOpts, ImageFormat, Superfile};
use wiidisc::disc::{Selection, WiiDisc};
use wiidisc::error::WdResult;
use wiidisc::fst::{Fst, FstBuilder};
use wiidisc::keys::{CommonKeys, KeySlot};
use wiidisc::pipeline;
use wiidisc::sign;
use wiidisc::structs::{
    decode, Boot, DiscHeader, DolHeader, PartitionType, Region, DOL_HEADER_SIZE,
};

struct TestSource {
    id6: [u8; 6],
    files: Vec<(String, Vec<u8>)>,
}

impl PartitionSource for TestSource {
    fn boot(&mut self) -> WdResult<Boot> {
        Ok(Boot {
            header: DiscHeader::new(&self.id6, "scenario test title", false),
            ..Boot::default()
        })
    }

    fn bi2(&mut self) -> WdResult<Vec<u8>> {
        Ok(vec![0u8; 0x2000])
    }

    fn apploader(&mut self) -> WdResult<Vec<u8>> {
        Ok(vec![0xA0; 0x500])
    }

    fn dol(&mut self) -> WdResult<Vec<u8>> {
        let mut header = DolHeader::default();
        header.sect_off[0] = 0x100;
        header.sect_addr[0] = 0x8000_1000;
        header.sect_size[0] = 0x200;
        header.entry_point = 0x8000_1100;
        let mut dol = wiidisc::structs::encode(&header).unwrap();
        dol.extend_from_slice(&[0xD0; 0x200]);
        Ok(dol)
    }

    fn fst(&mut self) -> WdResult<Fst> {
        let mut b = FstBuilder::new(4);
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
            .ok_or_else(|| wiidisc::WdError::Missing(path.to_owned()))
    }
}

fn test_keys() -> CommonKeys {
    let mut keys = CommonKeys::default();
    keys.set(KeySlot::Standard, *b"scenario-key-16b");
    keys
}

fn build_image(id6: &[u8; 6], files: Vec<(String, Vec<u8>)>) -> Vec<u8> {
    let keys = test_keys();
    let (mut ticket, title_key) = ticket_new(&id6[..4]);
    wrap_title_key(&mut ticket, &title_key, &keys).unwrap();
    let tmd = tmd_new(&id6[..4]);
    let mut region = Region::default();
    region.region = 2;
    let mut image = Cursor::new(Vec::new());
    let mut builder = DiscBuilder::new(
        &mut image,
        DiscHeader::new(id6, "scenario test title", false),
        region,
        keys,
    );
    let mut source = TestSource {
        id6: *id6,
        files,
    };
    builder
        .add_partition(PartitionType::Data, ticket, tmd, &[0u8; 0x40], &mut source)
        .unwrap();
    builder.finish().unwrap();
    image.into_inner()
}

fn write_image(dir: &Path, name: &str) -> PathBuf {
    let image = build_image(
        b"RSCE01",
        vec![
            ("/movie/intro.thp".into(), vec![0x11; 0x4000]),
            ("/setup.txt".into(), b"scenario".to_vec()),
        ],
    );
    let path = dir.join(name);
    std::fs::write(&path, image).unwrap();
    path
}

fn open(path: &Path) -> WiiDisc {
    WiiDisc::open(Superfile::open(path).unwrap(), test_keys()).unwrap()
}

#[test]
fn dump_scenario_reports_core_facts() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "game.iso");
    let mut disc = open(&path);

    // exactly one data partition whose id matches the disc id
    assert_eq!(disc.partition_count(), 1);
    let main = disc.main_partition().unwrap();
    disc.ensure_open(main).unwrap();
    let part = disc.partition(main).unwrap();
    assert_eq!(part.ptype(), PartitionType::Data);
    let boot = part.boot.clone().unwrap();
    assert_eq!(boot.header.id6(), disc.header().id6());

    // region value matches the region block
    assert_eq!(disc.region().region, 2);

    // the DOL entry point equals the word at 0xE0 of main.dol
    let mut head = vec![0u8; DOL_HEADER_SIZE];
    disc.read_part(main, boot.dol_off(), &mut head, true).unwrap();
    let raw_entry = u32::from_be_bytes(head[0xE0..0xE4].try_into().unwrap());
    let dol: DolHeader = decode(&head, DOL_HEADER_SIZE, "dol").unwrap();
    assert_eq!(dol.entry_point, raw_entry);
    assert_eq!(raw_entry, 0x8000_1100);
}

#[test]
fn extracted_tree_rebuilds_and_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "game.iso");
    let tree = dir.path().join("tree");
    {
        let mut disc = open(&path);
        pipeline::extract_disc(&mut disc, &tree, &Selection::all(), None).unwrap();
    }
    // the extracted ticket and TMD are fake signed
    let ticket =
        wiidisc::structs::Ticket::from_bytes(&std::fs::read(tree.join("DATA/ticket.bin")).unwrap())
            .unwrap();
    assert!(sign::ticket_is_fake_signed(&ticket));
    let tmd =
        wiidisc::structs::Tmd::from_bytes(&std::fs::read(tree.join("DATA/tmd.bin")).unwrap())
            .unwrap();
    assert!(sign::tmd_is_fake_signed(&tmd));

    // rebuilding from the tree gives an image with a clean hash tree
    let rebuilt = dir.path().join("rebuilt.iso");
    {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&rebuilt)
            .unwrap();
        wiidisc::builder::build_from_fst_tree(&tree, &mut file, &test_keys()).unwrap();
    }
    let mut disc = open(&rebuilt);
    let report = pipeline::verify_disc(&mut disc, 8).unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(report.checked_clusters > 0);
}

#[test]
fn iso_and_wbfs_copy_do_not_differ() {
    let dir = tempfile::tempdir().unwrap();
    let iso_path = write_image(dir.path(), "game.iso");
    let wbfs_path = dir.path().join("game.wbfs");
    {
        let mut src = open(&iso_path);
        let header = {
            let mut buf = vec![0u8; wiidisc::structs::DISC_HEADER_SIZE];
            src.read_raw(0, &mut buf).unwrap();
            buf
        };
        let opts = CreateOpts {
            overwrite: false,
            disc_header: Some(header),
            ..CreateOpts::default()
        };
        let mut dest = Superfile::create(&wbfs_path, ImageFormat::Wbfs, &opts).unwrap();
        pipeline::copy_disc(&mut src, &mut dest, pipeline::CopyMode::Scrub).unwrap();
    }
    let mut a = open(&iso_path);
    let mut b = open(&wbfs_path);
    let report = pipeline::diff_raw(&mut a, &mut b, 8).unwrap();
    assert!(!report.differs(), "{:?}", report.messages);
    let report = pipeline::diff_files(&mut a, &mut b, None, 8).unwrap();
    assert!(!report.differs(), "{:?}", report.messages);
}

#[test]
fn rename_on_wbfs_updates_shelf_and_header() {
    let dir = tempfile::tempdir().unwrap();
    let iso_path = write_image(dir.path(), "game.iso");
    let wbfs_path = dir.path().join("game.wbfs");
    {
        let mut src = open(&iso_path);
        let mut header = vec![0u8; wiidisc::structs::DISC_HEADER_SIZE];
        src.read_raw(0, &mut header).unwrap();
        let opts = CreateOpts {
            overwrite: false,
            disc_header: Some(header),
            ..CreateOpts::default()
        };
        let mut dest = Superfile::create(&wbfs_path, ImageFormat::Wbfs, &opts).unwrap();
        pipeline::copy_disc(&mut src, &mut dest, pipeline::CopyMode::Scrub).unwrap();
    }
    // rename disc header plus the shelf slot id
    {
        let sf = Superfile::open_rw(&wbfs_path).unwrap();
        let mut disc = WiiDisc::open(sf, test_keys()).unwrap();
        disc.patch_id("RSCJ01").unwrap();
        pipeline::apply_patches_in_place(&mut disc).unwrap();
        let mut sf = disc.into_superfile();
        let wbfs = sf.wbfs_disc_mut().unwrap();
        let slot = wbfs.slot();
        wbfs.shelf_mut().rename_slot(slot, "RSCJ01", None).unwrap();
        wbfs.sync().unwrap();
    }
    // the new id resolves on reopen
    let sf = Superfile::open_wbfs_slot(&wbfs_path, "RSCJ01", false).unwrap();
    let mut disc = WiiDisc::open(sf, test_keys()).unwrap();
    assert_eq!(disc.header().id6(), "RSCJ01");
    disc.ensure_open(0).unwrap();
    // the boot copy inside the partition was rewritten as well, and the
    // hash tree still checks out
    assert_eq!(
        disc.partition(0).unwrap().boot.as_ref().unwrap().header.id6(),
        "RSCJ01"
    );
    let report = pipeline::verify_disc(&mut disc, 8).unwrap();
    assert!(report.is_clean(), "{report:?}");
}

#[test]
fn scrub_copy_is_file_level_equal() {
    let dir = tempfile::tempdir().unwrap();
    let iso_path = write_image(dir.path(), "game.iso");
    let scrubbed = dir.path().join("scrubbed.iso");
    {
        let mut src = open(&iso_path);
        let mut dest =
            Superfile::create(&scrubbed, ImageFormat::Iso, &CreateOpts::default()).unwrap();
        pipeline::copy_disc(&mut src, &mut dest, pipeline::CopyMode::Scrub).unwrap();
    }
    let mut a = open(&iso_path);
    let mut b = open(&scrubbed);
    let mut pattern = wiidisc::pattern::FilePattern::new();
    pattern.add_rules("+/**").unwrap();
    let report = pipeline::diff_files(&mut a, &mut b, Some(&mut pattern), 8).unwrap();
    assert!(!report.differs(), "{:?}", report.messages);
}
