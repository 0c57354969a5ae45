use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use wiidisc::builder;
use wiidisc::cert;
use wiidisc::container::codec::CompressionSpec;
use wiidisc::container::{CreateOpts, ImageFormat, Superfile};
use wiidisc::disc::{DiscPatch, FileKind, PrefixMode, Selection, WiiDisc};
use wiidisc::dol::{add_dol_section, patch_dol, DolPatch};
use wiidisc::error::WdError;
use wiidisc::fst::VisitAction;
use wiidisc::keys::CommonKeys;
use wiidisc::patch::FileMap;
use wiidisc::pattern::{FilePattern, PatternRegistry, PatternSlot};
use wiidisc::pipeline::{self, CopyMode};
use wiidisc::settings::Settings;
use wiidisc::sign;
use wiidisc::structs::{decode, DolHeader, DOL_HEADER_SIZE};

// exit codes of the command surface
const EXIT_OK: u8 = 0;
const EXIT_WARNING: u8 = 1;
const EXIT_DIFFER: u8 = 2;
const EXIT_SYNTAX: u8 = 3;
const EXIT_SEMANTIC: u8 = 4;
const EXIT_READ_ERROR: u8 = 5;
const EXIT_WRITE_ERROR: u8 = 6;
const EXIT_FORMAT_ERROR: u8 = 7;
const EXIT_CRYPTO_ERROR: u8 = 8;
const EXIT_IO_ERROR: u8 = 9;
const EXIT_INTERRUPT: u8 = 40;

#[derive(Debug, Parser)]
#[clap(name = "wit", about = "read, transform and rewrite GameCube and Wii disc images")]
struct Args {
    /// demote soft errors to warnings and continue with the next source
    #[clap(long, global = true)]
    ignore: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// list images with id, type, size and title
    List {
        sources: Vec<PathBuf>,
        #[clap(short, long)]
        long: bool,
    },
    /// list the files inside the image's file systems
    Files {
        source: PathBuf,
        /// file pattern rules, e.g. '+/files/;-/**' or ':sys'
        #[clap(long)]
        files: Vec<String>,
        /// partition selector: all, data, update, channel, ptabN or index
        #[clap(long, default_value = "all")]
        psel: String,
        /// print how file data maps onto image offsets
        #[clap(long)]
        map: bool,
    },
    /// dump header, partition and system information of an image
    Dump { source: PathBuf },
    /// extract an image into an FST tree
    Extract {
        source: PathBuf,
        destination: PathBuf,
        #[clap(long, default_value = "all")]
        psel: String,
        #[clap(long)]
        files: Vec<String>,
    },
    /// copy and convert an image (scrubbing unused sectors by default)
    Copy {
        source: PathBuf,
        destination: PathBuf,
        /// copy every sector instead of scrubbing
        #[clap(long)]
        raw: bool,
        /// rebuild the image from its file system instead of copying
        /// sectors
        #[clap(long)]
        fst: bool,
        #[clap(long)]
        overwrite: bool,
        /// compression spec for WIA targets, e.g. purge@2
        #[clap(long)]
        compression: Option<String>,
    },
    /// convert an image into another container format (alias of copy)
    Convert {
        source: PathBuf,
        destination: PathBuf,
        #[clap(long)]
        overwrite: bool,
        #[clap(long)]
        compression: Option<String>,
    },
    /// compare two images
    Diff {
        source: PathBuf,
        destination: PathBuf,
        /// compare file by file instead of sector ranges
        #[clap(long)]
        files: bool,
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
    /// verify the hash trees of one or more images
    Verify {
        sources: Vec<PathBuf>,
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
    /// edit an image in place (id, title, region, keys)
    Edit {
        source: PathBuf,
        #[clap(long)]
        id: Option<String>,
        #[clap(long)]
        name: Option<String>,
        #[clap(long)]
        region: Option<u32>,
        #[clap(long)]
        common_key: Option<u8>,
        /// system version (IOS) for the TMD
        #[clap(long)]
        ios: Option<u64>,
        /// redirect the online service host in main.dol
        #[clap(long)]
        wiimmfi: Option<String>,
    },
    /// change the id6 (and optionally the title) of an image
    Rename {
        source: PathBuf,
        new_id: String,
        #[clap(long)]
        name: Option<String>,
    },
    /// reduce an image to its structure, dropping file payload
    Skeletonize {
        source: PathBuf,
        destination: PathBuf,
        #[clap(long)]
        overwrite: bool,
    },
    /// create ticket and TMD templates
    Create {
        /// TICKET or TMD
        what: String,
        destination: PathBuf,
        #[clap(long, default_value = "WIT0")]
        id: String,
        #[clap(long)]
        overwrite: bool,
    },
    /// patch sections of a DOL executable
    Dolpatch {
        dol: PathBuf,
        /// patches: ADDR=HEXBYTES, entry=ADDR, newtext=ADDR:HEX,
        /// newdata=ADDR:HEX
        patches: Vec<String>,
    },
    /// show the certificate chains of images or cert blobs
    Cert { sources: Vec<PathBuf> },
}

#[derive(Error, Debug)]
enum CmdError {
    #[error("{0}")]
    Wd(#[from] WdError),
    #[error("{0}")]
    Message(String),
}

type CmdResult = Result<u8, CmdError>;

fn error_exit_code(err: &WdError) -> u8 {
    match err {
        WdError::Syntax(_) => EXIT_SYNTAX,
        WdError::Missing(_) => EXIT_SEMANTIC,
        WdError::AlreadyExists(_) => EXIT_WRITE_ERROR,
        WdError::Format(_) => EXIT_FORMAT_ERROR,
        WdError::Crypto(_) => EXIT_CRYPTO_ERROR,
        WdError::Differ => EXIT_DIFFER,
        WdError::Interrupted => EXIT_INTERRUPT,
        WdError::Io(_) => EXIT_IO_ERROR,
        WdError::BinRw(_) => EXIT_READ_ERROR,
        WdError::Fatal(_) => EXIT_IO_ERROR,
    }
}

fn load_keys() -> CommonKeys {
    CommonKeys::load(Settings::get().key_dir.as_deref())
}

fn open_disc(path: &Path) -> Result<WiiDisc, WdError> {
    let sf = Superfile::open(path)?;
    WiiDisc::open(sf, load_keys())
}

fn open_disc_rw(path: &Path) -> Result<WiiDisc, WdError> {
    let sf = Superfile::open_rw(path)?;
    WiiDisc::open(sf, load_keys())
}

fn size_string(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn pattern_from_rules(rules: &[String]) -> Result<Option<FilePattern>, WdError> {
    if rules.is_empty() {
        return Ok(None);
    }
    let mut registry = PatternRegistry::new();
    for rule in rules {
        registry.get_mut(PatternSlot::Param).add_rules(rule)?;
    }
    registry.move_param(PatternSlot::Files);
    let mut pattern = FilePattern::new();
    std::mem::swap(&mut pattern, registry.get_mut(PatternSlot::Files));
    Ok(Some(pattern))
}

fn cmd_list(sources: &[PathBuf], long: bool) -> CmdResult {
    let mut worst = EXIT_OK;
    for source in sources {
        match open_disc(source) {
            Ok(mut disc) => {
                let header = disc.header().clone();
                let kind = if disc.is_gc() { "GC " } else { "WII" };
                let mut line = format!(
                    "{} {} {:>10}  {}",
                    header.id6(),
                    kind,
                    size_string(disc.size()),
                    header.title()
                );
                if long {
                    let map = disc.build_usage_map()?;
                    let used = map
                        .iter()
                        .filter(|&&v| v != wiidisc::disc::USAGE_UNUSED)
                        .count() as u64
                        * wiidisc::SECTOR_SIZE;
                    line.push_str(&format!(
                        "  used {}  {} partitions",
                        size_string(used),
                        disc.partition_count()
                    ));
                }
                println!("{line}");
            }
            Err(err) => {
                eprintln!("wit: {}: {err}", source.display());
                worst = worst.max(error_exit_code(&err));
            }
        }
    }
    Ok(worst)
}

fn cmd_files(source: &Path, rules: &[String], psel: &str, map: bool) -> CmdResult {
    let mut disc = open_disc(source)?;
    let selection = Selection::parse(psel)?;
    let mut pattern = pattern_from_rules(rules)?;
    let mut layout = FileMap::new();
    let mut entries: Vec<(usize, u64, u64)> = Vec::new();
    disc.iterate_files(&selection, PrefixMode::Auto, &mut |entry| {
        if matches!(entry.kind, FileKind::DirEnter | FileKind::DirLeave) {
            return VisitAction::Continue;
        }
        if let Some(pattern) = pattern.as_mut() {
            if !pattern.matches(&format!("/{}", entry.path), '/') {
                return VisitAction::Continue;
            }
        }
        if matches!(entry.kind, FileKind::File) {
            entries.push((entry.part, entry.offset, entry.size));
        }
        if entry.size > 0 {
            println!("{:>12}  {}", entry.size, entry.path);
        } else {
            println!("{:>12}  {}", "-", entry.path);
        }
        VisitAction::Continue
    })?;
    if map {
        for (part, offset, size) in entries {
            layout.insert(offset, disc.cleartext_to_image(part, offset), size);
        }
        print!("{layout}");
    }
    Ok(EXIT_OK)
}

fn cmd_dump(source: &Path) -> CmdResult {
    let mut disc = open_disc(source)?;
    let header = disc.header().clone();
    println!("image:     {}", source.display());
    println!("id6:       {}", header.id6());
    println!("title:     {}", header.title());
    println!(
        "platform:  {}",
        if disc.is_gc() { "GameCube" } else { "Wii" }
    );
    let attrib = header.attributes();
    if attrib.multi_boot {
        println!("attrib:    multi-boot{}", if attrib.dvd9 { " dvd9" } else { "" });
    }
    if !disc.is_gc() {
        println!("region:    {}", disc.region().region);
    }
    println!("size:      {}", size_string(disc.size()));
    if pipeline::is_skeleton(disc.superfile_mut())? {
        println!("marker:    [SKELETON]");
    }
    for index in 0..disc.partition_count() {
        let loaded = disc.ensure_open(index);
        let part = disc.partition(index).unwrap();
        println!(
            "partition #{index}: {} at {:#x} [{}]",
            part.ptype(),
            part.slot.offset,
            match (loaded.is_ok(), part.is_valid()) {
                (true, true) => "ok",
                (true, false) => "hash mismatch",
                (false, _) => "invalid",
            }
        );
        if let Some(tmd) = &part.tmd {
            println!(
                "  sys version: {:#x}, fake signed: {}",
                tmd.sys_version,
                sign::tmd_is_fake_signed(tmd)
            );
        }
        if let Some(boot) = &part.boot {
            println!(
                "  boot id: {}, dol at {:#x}, fst at {:#x}+{:#x}",
                boot.header.id6(),
                boot.dol_off(),
                boot.fst_off(),
                boot.fst_size()
            );
        }
    }
    // DOL entry point of the main partition
    if let Some(main) = disc.main_partition() {
        if disc.ensure_open(main).is_ok() {
            let boot = disc.partition(main).unwrap().boot.clone().unwrap();
            let mut head = vec![0u8; DOL_HEADER_SIZE];
            disc.read_part(main, boot.dol_off(), &mut head, true)?;
            let dol: DolHeader = decode(&head, DOL_HEADER_SIZE, "dol header")?;
            println!("dol entry: {:#x}", dol.entry_point);
        }
    }
    Ok(EXIT_OK)
}

fn cmd_extract(source: &Path, dest: &Path, psel: &str, rules: &[String]) -> CmdResult {
    let mut disc = open_disc(source)?;
    let selection = Selection::parse(psel)?;
    let mut pattern = pattern_from_rules(rules)?;
    pipeline::extract_disc(&mut disc, dest, &selection, pattern.as_mut())?;
    Ok(EXIT_OK)
}

fn create_dest(
    source: &mut WiiDisc,
    dest: &Path,
    overwrite: bool,
    compression: Option<&str>,
) -> Result<Superfile, WdError> {
    let format = ImageFormat::from_path(dest);
    let mut opts = CreateOpts {
        overwrite,
        size_hint: source.size(),
        ..CreateOpts::default()
    };
    if let Some(spec) = compression {
        opts.compression = CompressionSpec::parse(spec)?;
    }
    if format == ImageFormat::Wbfs {
        let mut header = vec![0u8; wiidisc::structs::DISC_HEADER_SIZE];
        source.read_raw(0, &mut header)?;
        opts.disc_header = Some(header);
    }
    Superfile::create(dest, format, &opts)
}

fn cmd_copy(
    source: &Path,
    dest: &Path,
    raw: bool,
    fst: bool,
    overwrite: bool,
    compression: Option<&str>,
) -> CmdResult {
    if dest.is_dir() {
        return cmd_extract(source, dest, "all", &[]);
    }
    let mut disc = open_disc(source)?;
    if fst {
        let sf = create_dest(&mut disc, dest, overwrite, compression)?;
        let keys = load_keys();
        let mut sf = pipeline::rebuild_disc(&mut disc, sf, &keys)?;
        sf.sync()?;
        return Ok(EXIT_OK);
    }
    let mut out = create_dest(&mut disc, dest, overwrite, compression)?;
    let mode = if raw { CopyMode::Raw } else { CopyMode::Scrub };
    pipeline::copy_disc(&mut disc, &mut out, mode)?;
    Ok(EXIT_OK)
}

fn cmd_diff(source: &Path, dest: &Path, file_level: bool, limit: usize) -> CmdResult {
    let mut a = open_disc(source)?;
    let mut b = open_disc(dest)?;
    let report = if file_level {
        pipeline::diff_files(&mut a, &mut b, None, limit)?
    } else {
        pipeline::diff_raw(&mut a, &mut b, limit)?
    };
    for message in &report.messages {
        println!("{message}");
    }
    if report.differs() {
        println!("images differ ({} differences)", report.total);
        Ok(EXIT_DIFFER)
    } else {
        Ok(EXIT_OK)
    }
}

fn cmd_verify(sources: &[PathBuf], limit: usize) -> CmdResult {
    let mut worst = EXIT_OK;
    for source in sources {
        match open_disc(source).and_then(|mut disc| pipeline::verify_disc(&mut disc, limit)) {
            Ok(report) => {
                if report.is_clean() {
                    println!("{}: ok ({} clusters)", source.display(), report.checked_clusters);
                } else {
                    println!(
                        "{}: BAD h0={} h1={} h2={} h3={} tmd={}",
                        source.display(),
                        report.h0_bad,
                        report.h1_bad,
                        report.h2_bad,
                        report.h3_bad,
                        report.tmd_bad
                    );
                    worst = worst.max(EXIT_DIFFER);
                }
            }
            Err(err) => {
                eprintln!("wit: {}: {err}", source.display());
                worst = worst.max(error_exit_code(&err));
            }
        }
    }
    Ok(worst)
}

#[allow(clippy::too_many_arguments)]
fn cmd_edit(
    source: &Path,
    id: Option<&str>,
    name: Option<&str>,
    region: Option<u32>,
    common_key: Option<u8>,
    ios: Option<u64>,
    wiimmfi: Option<&str>,
) -> CmdResult {
    let mut disc = open_disc_rw(source)?;
    let main = disc.main_partition();
    let need_main = || main.ok_or(WdError::Missing("data partition".into()));
    if let Some(id) = id {
        disc.apply_patch(DiscPatch::Id(id.to_owned()))?;
    }
    if let Some(name) = name {
        disc.apply_patch(DiscPatch::Title(name.to_owned()))?;
    }
    if let Some(region) = region {
        disc.apply_patch(DiscPatch::Region(region))?;
    }
    if let Some(index) = common_key {
        disc.apply_patch(DiscPatch::CommonKey {
            part: need_main()?,
            index,
        })?;
    }
    if let Some(version) = ios {
        disc.apply_patch(DiscPatch::SystemVersion {
            part: need_main()?,
            version,
        })?;
    }
    if let Some(host) = wiimmfi {
        disc.apply_patch(DiscPatch::WiimmfiHost {
            part: need_main()?,
            host: host.to_owned(),
        })?;
    }
    if !disc.has_patches() {
        return Err(CmdError::Message(
            "nothing to edit (pass --id, --name, ...)".into(),
        ));
    }
    pipeline::apply_patches_in_place(&mut disc)?;
    Ok(EXIT_OK)
}

fn cmd_rename(source: &Path, new_id: &str, name: Option<&str>) -> CmdResult {
    let mut disc = open_disc_rw(source)?;
    disc.patch_id(new_id)?;
    if let Some(name) = name {
        disc.patch_title(name)?;
    }
    pipeline::apply_patches_in_place(&mut disc)?;
    // a WBFS shelf also tracks the id in its slot header
    let mut sf = disc.into_superfile();
    if let Some(wbfs) = sf.wbfs_disc_mut() {
        let slot = wbfs.slot();
        wbfs.shelf_mut().rename_slot(slot, new_id, name)?;
        wbfs.sync()?;
    }
    Ok(EXIT_OK)
}

fn cmd_skeletonize(source: &Path, dest: &Path, overwrite: bool) -> CmdResult {
    let mut disc = open_disc(source)?;
    let mut out = create_dest(&mut disc, dest, overwrite, None)?;
    pipeline::skeletonize(&mut disc, &mut out)?;
    Ok(EXIT_OK)
}

fn cmd_create(what: &str, dest: &Path, id: &str, overwrite: bool) -> CmdResult {
    if dest.exists() && !overwrite {
        return Err(CmdError::Wd(WdError::AlreadyExists(dest.to_path_buf())));
    }
    let bytes = match what.to_ascii_uppercase().as_str() {
        "TICKET" => {
            let keys = load_keys();
            let (mut ticket, title_key) = builder::ticket_new(id.as_bytes());
            builder::wrap_title_key(&mut ticket, &title_key, &keys)?;
            sign::ticket_fake_sign(&mut ticket)?;
            ticket.to_bytes()?
        }
        "TMD" => {
            let mut tmd = builder::tmd_new(id.as_bytes());
            sign::tmd_fake_sign(&mut tmd)?;
            tmd.to_bytes()?
        }
        other => {
            return Err(CmdError::Message(format!(
                "unknown template '{other}', expected TICKET or TMD"
            )))
        }
    };
    std::fs::write(dest, bytes).map_err(WdError::from)?;
    Ok(EXIT_OK)
}

struct DolJob {
    patches: Vec<DolPatch>,
    entry: Option<u32>,
    /// sections to append: (is_text, load address, data)
    new_sections: Vec<(bool, u32, Vec<u8>)>,
}

fn parse_hex_bytes(value: &str) -> Result<Vec<u8>, WdError> {
    let hex: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if hex.len() % 2 != 0 || hex.is_empty() {
        return Err(WdError::Syntax(format!("bad patch bytes '{value}'")));
    }
    let mut data = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        data.push(
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| WdError::Syntax(format!("bad patch bytes '{value}'")))?,
        );
    }
    Ok(data)
}

fn parse_addr(value: &str) -> Result<u32, WdError> {
    u32::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|_| WdError::Syntax(format!("bad address '{value}'")))
}

fn parse_dol_patches(tokens: &[String]) -> Result<DolJob, WdError> {
    let mut job = DolJob {
        patches: Vec::new(),
        entry: None,
        new_sections: Vec::new(),
    };
    for token in tokens {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| WdError::Syntax(format!("bad patch '{token}'")))?;
        if key.eq_ignore_ascii_case("entry") {
            job.entry = Some(parse_addr(value)?);
            continue;
        }
        if key.eq_ignore_ascii_case("newtext") || key.eq_ignore_ascii_case("newdata") {
            let (addr, bytes) = value
                .split_once(':')
                .ok_or_else(|| WdError::Syntax(format!("bad section spec '{value}'")))?;
            job.new_sections.push((
                key.eq_ignore_ascii_case("newtext"),
                parse_addr(addr)?,
                parse_hex_bytes(bytes)?,
            ));
            continue;
        }
        job.patches.push(DolPatch {
            addr: parse_addr(key)?,
            data: parse_hex_bytes(value)?,
        });
    }
    Ok(job)
}

fn cmd_dolpatch(dol_path: &Path, tokens: &[String]) -> CmdResult {
    if tokens.is_empty() {
        return Err(CmdError::Message("no patches given".into()));
    }
    let job = parse_dol_patches(tokens)?;
    let mut dol = std::fs::read(dol_path).map_err(WdError::from)?;
    for (is_text, addr, data) in &job.new_sections {
        dol = add_dol_section(&dol, *is_text, *addr, data)?;
    }
    let report = patch_dol(&mut dol, &job.patches, job.entry)?;
    std::fs::write(dol_path, &dol).map_err(WdError::from)?;
    println!(
        "{}: {} patches applied{}",
        dol_path.display(),
        report.applied,
        if report.entry_changed {
            ", entry point changed"
        } else {
            ""
        }
    );
    if report.rejected.is_empty() {
        Ok(EXIT_OK)
    } else {
        for addr in &report.rejected {
            eprintln!("wit: warning: no section covers {addr:#x}");
        }
        Ok(EXIT_WARNING)
    }
}

fn cmd_cert(sources: &[PathBuf]) -> CmdResult {
    let mut worst = EXIT_OK;
    for source in sources {
        let chains: Result<Vec<(String, Vec<u8>)>, WdError> = (|| {
            if let Ok(mut disc) = open_disc(source) {
                let mut chains = Vec::new();
                for index in 0..disc.partition_count() {
                    if disc.ensure_header(index).is_ok() {
                        let part = disc.partition(index).unwrap();
                        chains.push((format!("partition {}", part.ptype()), part.cert.clone()));
                    }
                }
                Ok(chains)
            } else {
                Ok(vec![(
                    "file".to_string(),
                    std::fs::read(source).map_err(WdError::from)?,
                )])
            }
        })();
        match chains {
            Ok(chains) => {
                for (label, blob) in chains {
                    match cert::walk_chain(&blob) {
                        Ok(certs) => {
                            println!("{} [{label}]:", source.display());
                            for info in certs {
                                println!(
                                    "  {} issued by {} (sig {:#x}, key {})",
                                    info.name, info.issuer, info.sig_type, info.key_type
                                );
                            }
                        }
                        Err(err) => {
                            eprintln!("wit: {} [{label}]: {err}", source.display());
                            worst = worst.max(error_exit_code(&err));
                        }
                    }
                }
            }
            Err(err) => {
                eprintln!("wit: {}: {err}", source.display());
                worst = worst.max(error_exit_code(&err));
            }
        }
    }
    Ok(worst)
}

fn run(args: &Args) -> CmdResult {
    match &args.command {
        Command::List { sources, long } => cmd_list(sources, *long),
        Command::Files {
            source,
            files,
            psel,
            map,
        } => cmd_files(source, files, psel, *map),
        Command::Dump { source } => cmd_dump(source),
        Command::Extract {
            source,
            destination,
            psel,
            files,
        } => cmd_extract(source, destination, psel, files),
        Command::Copy {
            source,
            destination,
            raw,
            fst,
            overwrite,
            compression,
        } => cmd_copy(
            source,
            destination,
            *raw,
            *fst,
            *overwrite,
            compression.as_deref(),
        ),
        Command::Convert {
            source,
            destination,
            overwrite,
            compression,
        } => cmd_copy(
            source,
            destination,
            false,
            false,
            *overwrite,
            compression.as_deref(),
        ),
        Command::Diff {
            source,
            destination,
            files,
            limit,
        } => cmd_diff(source, destination, *files, *limit),
        Command::Verify { sources, limit } => cmd_verify(sources, *limit),
        Command::Edit {
            source,
            id,
            name,
            region,
            common_key,
            ios,
            wiimmfi,
        } => cmd_edit(
            source,
            id.as_deref(),
            name.as_deref(),
            *region,
            *common_key,
            *ios,
            wiimmfi.as_deref(),
        ),
        Command::Rename {
            source,
            new_id,
            name,
        } => cmd_rename(source, new_id, name.as_deref()),
        Command::Skeletonize {
            source,
            destination,
            overwrite,
        } => cmd_skeletonize(source, destination, *overwrite),
        Command::Create {
            what,
            destination,
            id,
            overwrite,
        } => cmd_create(what, destination, id, *overwrite),
        Command::Dolpatch { dol, patches } => cmd_dolpatch(dol, patches),
        Command::Cert { sources } => cmd_cert(sources),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    // WIT_OPT defaults are read exactly once
    let _ = Settings::get();
    let args = Args::parse();
    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(CmdError::Wd(err)) => {
            eprintln!("wit: {err}");
            let code = error_exit_code(&err);
            if args.ignore && err.is_soft() {
                ExitCode::from(EXIT_WARNING)
            } else {
                ExitCode::from(code)
            }
        }
        Err(CmdError::Message(message)) => {
            eprintln!("wit: {message}");
            ExitCode::from(EXIT_SEMANTIC)
        }
    }
}
