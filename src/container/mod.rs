//! The superfile: uniform random-access byte streams over every supported
//! image container.
//!
//! The container kinds form a tagged variant with a small common surface
//! (`read_at`, `write_at`, `size`, `sync`); a cursor on top provides the
//! `Read`/`Seek`/`Write` adapters the binrw based layers build on.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub mod ciso;
pub mod codec;
pub mod fst_tree;
pub mod gcz;
pub mod split;
pub mod wbfs;
pub mod wdf;
pub mod wia;

use ciso::CisoFile;
use codec::CompressionSpec;
use fst_tree::FstTreeImage;
use gcz::GczFile;
use split::SplitFile;
use wbfs::{WbfsDisc, WbfsShelf};
use wdf::WdfFile;
use wia::WiaFile;

use crate::error::{WdError, WdResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Iso,
    Wdf,
    Wia,
    Ciso,
    Gcz,
    Wbfs,
    FstTree,
}

impl ImageFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Iso => "ISO",
            ImageFormat::Wdf => "WDF",
            ImageFormat::Wia => "WIA",
            ImageFormat::Ciso => "CISO",
            ImageFormat::Gcz => "GCZ",
            ImageFormat::Wbfs => "WBFS",
            ImageFormat::FstTree => "FST",
        }
    }

    /// Guess a destination format from the file name.
    pub fn from_path(path: &Path) -> ImageFormat {
        if path.extension().is_none() && path.is_dir() {
            return ImageFormat::FstTree;
        }
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("wdf") => ImageFormat::Wdf,
            Some("wia") => ImageFormat::Wia,
            Some("ciso") => ImageFormat::Ciso,
            Some("gcz") => ImageFormat::Gcz,
            Some("wbfs") => ImageFormat::Wbfs,
            _ => ImageFormat::Iso,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub overwrite: bool,
    /// logical image size, required by GCZ (fixed block table)
    pub size_hint: u64,
    pub compression: CompressionSpec,
    /// disc header for a fresh WBFS slot
    pub disc_header: Option<Vec<u8>>,
}

#[derive(Debug)]
enum Inner {
    Iso(SplitFile),
    Wdf(WdfFile),
    Ciso(CisoFile),
    Wia(WiaFile),
    Gcz(GczFile),
    Wbfs(Box<WbfsDisc>),
    FstTree(FstTreeImage),
}

/// A uniform random-access image file.
#[derive(Debug)]
pub struct Superfile {
    inner: Inner,
    pos: u64,
    path: PathBuf,
}

fn sniff_magic(path: &Path) -> WdResult<[u8; 8]> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 8];
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..])? {
            0 => break,
            n => read += n,
        }
    }
    Ok(magic)
}

impl Superfile {
    pub fn open(path: &Path) -> WdResult<Superfile> {
        Self::open_mode(path, false)
    }

    pub fn open_rw(path: &Path) -> WdResult<Superfile> {
        Self::open_mode(path, true)
    }

    fn open_mode(path: &Path, writable: bool) -> WdResult<Superfile> {
        if path.is_dir() {
            let inner = Inner::FstTree(FstTreeImage::open(path)?);
            return Ok(Superfile {
                inner,
                pos: 0,
                path: path.to_path_buf(),
            });
        }
        if !path.exists() {
            return Err(WdError::Missing(path.display().to_string()));
        }
        let magic = sniff_magic(path)?;
        let inner = if magic == wdf::WDF_MAGIC {
            Inner::Wdf(WdfFile::open(path, writable)?)
        } else if magic[..4] == wia::WIA_MAGIC {
            Inner::Wia(WiaFile::open(path, writable)?)
        } else if magic[..4] == ciso::CISO_MAGIC {
            Inner::Ciso(CisoFile::open(path, writable)?)
        } else if magic[..4] == gcz::GCZ_MAGIC.to_le_bytes() {
            Inner::Gcz(GczFile::open(path, writable)?)
        } else if magic[..4] == wbfs::WBFS_MAGIC {
            let mut shelf = WbfsShelf::open(path, writable)?;
            let slot = shelf
                .list_slots()?
                .first()
                .map(|(slot, _)| *slot)
                .ok_or(WdError::Format("wbfs: shelf holds no disc"))?;
            Inner::Wbfs(Box::new(shelf.open_slot(slot)?))
        } else {
            // no container magic: plain ISO, the disc header decides later
            Inner::Iso(SplitFile::open(path, writable)?)
        };
        Ok(Superfile {
            inner,
            pos: 0,
            path: path.to_path_buf(),
        })
    }

    /// Open one disc of a WBFS shelf by id6.
    pub fn open_wbfs_slot(path: &Path, id6: &str, writable: bool) -> WdResult<Superfile> {
        let mut shelf = WbfsShelf::open(path, writable)?;
        let slot = shelf
            .find_slot(id6)?
            .ok_or_else(|| WdError::Missing(format!("wbfs slot {id6}")))?;
        Ok(Superfile {
            inner: Inner::Wbfs(Box::new(shelf.open_slot(slot)?)),
            pos: 0,
            path: path.to_path_buf(),
        })
    }

    pub fn create(path: &Path, format: ImageFormat, opts: &CreateOpts) -> WdResult<Superfile> {
        let inner = match format {
            ImageFormat::Iso => Inner::Iso(SplitFile::create(path, opts.overwrite)?),
            ImageFormat::Wdf => Inner::Wdf(WdfFile::create(path, 1, opts.overwrite)?),
            ImageFormat::Wia => {
                Inner::Wia(WiaFile::create(path, opts.compression, opts.overwrite)?)
            }
            ImageFormat::Ciso => Inner::Ciso(CisoFile::create(
                path,
                ciso::CISO_DEFAULT_BLOCK_SIZE,
                opts.overwrite,
            )?),
            ImageFormat::Gcz => {
                if opts.size_hint == 0 {
                    return Err(WdError::Syntax("gcz needs a known image size".into()));
                }
                Inner::Gcz(GczFile::create(
                    path,
                    opts.size_hint,
                    gcz::GCZ_DEFAULT_BLOCK_SIZE,
                    opts.overwrite,
                )?)
            }
            ImageFormat::Wbfs => {
                let header = opts
                    .disc_header
                    .as_deref()
                    .ok_or(WdError::Syntax("wbfs needs a disc header".into()))?;
                let mut shelf = if path.exists() && !opts.overwrite {
                    WbfsShelf::open(path, true)?
                } else {
                    WbfsShelf::create(path, opts.overwrite)?
                };
                let slot = shelf.create_slot(header)?;
                Inner::Wbfs(Box::new(shelf.open_slot(slot)?))
            }
            ImageFormat::FstTree => {
                return Err(WdError::Syntax(
                    "an FST tree is written by extraction, not as an image".into(),
                ))
            }
        };
        Ok(Superfile {
            inner,
            pos: 0,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        match &self.inner {
            Inner::Iso(_) => ImageFormat::Iso,
            Inner::Wdf(_) => ImageFormat::Wdf,
            Inner::Ciso(_) => ImageFormat::Ciso,
            Inner::Wia(_) => ImageFormat::Wia,
            Inner::Gcz(_) => ImageFormat::Gcz,
            Inner::Wbfs(_) => ImageFormat::Wbfs,
            Inner::FstTree(_) => ImageFormat::FstTree,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.inner {
            Inner::Iso(f) => f.size(),
            Inner::Wdf(f) => f.size(),
            Inner::Ciso(f) => f.size(),
            Inner::Wia(f) => f.size(),
            Inner::Gcz(f) => f.size(),
            Inner::Wbfs(f) => f.size(),
            Inner::FstTree(f) => f.size(),
        }
    }

    /// Announce the logical image size (containers with a fixed table need
    /// it before the first write).
    pub fn set_size(&mut self, size: u64) -> WdResult<()> {
        match &mut self.inner {
            Inner::Iso(f) => f.set_size(size),
            Inner::Wdf(f) => f.set_size(size),
            Inner::Ciso(f) => f.set_size(size),
            Inner::Wia(f) => f.set_size(size),
            Inner::Gcz(f) => f.set_size(size),
            Inner::Wbfs(_) | Inner::FstTree(_) => Ok(()),
        }
    }

    pub fn read_at(&mut self, off: u64, buf: &mut [u8]) -> WdResult<()> {
        match &mut self.inner {
            Inner::Iso(f) => f.read_at(off, buf),
            Inner::Wdf(f) => f.read_at(off, buf),
            Inner::Ciso(f) => f.read_at(off, buf),
            Inner::Wia(f) => f.read_at(off, buf),
            Inner::Gcz(f) => f.read_at(off, buf),
            Inner::Wbfs(f) => f.read_at(off, buf),
            Inner::FstTree(f) => f.read_at(off, buf),
        }
    }

    pub fn write_at(&mut self, off: u64, buf: &[u8]) -> WdResult<()> {
        match &mut self.inner {
            Inner::Iso(f) => f.write_at(off, buf),
            Inner::Wdf(f) => f.write_at(off, buf),
            Inner::Ciso(f) => f.write_at(off, buf),
            Inner::Wia(f) => f.write_at(off, buf),
            Inner::Gcz(f) => f.write_at(off, buf),
            Inner::Wbfs(f) => f.write_at(off, buf),
            Inner::FstTree(_) => Err(WdError::Io(io::ErrorKind::Unsupported.into())),
        }
    }

    pub fn sync(&mut self) -> WdResult<()> {
        match &mut self.inner {
            Inner::Iso(f) => f.sync(),
            Inner::Wdf(f) => f.sync(),
            Inner::Ciso(f) => f.sync(),
            Inner::Wia(f) => f.sync(),
            Inner::Gcz(f) => f.sync(),
            Inner::Wbfs(f) => f.sync(),
            Inner::FstTree(_) => Ok(()),
        }
    }

    /// Access the WBFS shelf beneath a WBFS-embedded disc.
    pub fn wbfs_disc_mut(&mut self) -> Option<&mut WbfsDisc> {
        match &mut self.inner {
            Inner::Wbfs(disc) => Some(disc),
            _ => None,
        }
    }
}

fn to_io_error(err: WdError) -> io::Error {
    match err {
        WdError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

impl Read for Superfile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size().saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.read_at(self.pos, &mut buf[..n]).map_err(to_io_error)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for Superfile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(self.pos, buf).map_err(to_io_error)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(to_io_error)
    }
}

impl Seek for Superfile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => self.pos as i64 + off,
            SeekFrom::End(off) => self.size() as i64 + off,
        };
        if new_pos < 0 {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_formats_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let wdf_path = dir.path().join("a.img");
        {
            let mut wdf = WdfFile::create(&wdf_path, 1, false).unwrap();
            wdf.write_at(0, b"payload").unwrap();
            wdf.sync().unwrap();
        }
        let sf = Superfile::open(&wdf_path).unwrap();
        assert_eq!(sf.format(), ImageFormat::Wdf);

        let iso_path = dir.path().join("b.img");
        std::fs::write(&iso_path, vec![0u8; 0x100]).unwrap();
        let sf = Superfile::open(&iso_path).unwrap();
        assert_eq!(sf.format(), ImageFormat::Iso);
    }

    #[test]
    fn cursor_adapters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.iso");
        let mut sf = Superfile::create(&path, ImageFormat::Iso, &CreateOpts::default()).unwrap();
        sf.write_all(b"0123456789").unwrap();
        sf.seek(SeekFrom::Start(4)).unwrap();
        let mut buf = [0u8; 3];
        sf.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"456");
        assert_eq!(sf.seek(SeekFrom::End(-2)).unwrap(), 8);
    }
}
