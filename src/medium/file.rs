use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{AddrSpace, MemClass, Medium, MAX_ADDR};

/// A medium backed by a single operating-system file.
#[derive(Debug)]
pub struct FileMedium {
    file:     File,
    path:     PathBuf,
    space:    AddrSpace,
    writable: bool,
}

impl FileMedium {
    /// Create (or truncate) a file for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self::wrap(file, path.as_ref(), true))
    }

    /// Open an existing file, read-only unless `writable`.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        Ok(Self::wrap(file, path.as_ref(), writable))
    }

    fn wrap(file: File, path: &Path, writable: bool) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            space: AddrSpace::new(MAX_ADDR),
            writable,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn physical_len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Medium for FileMedium {
    fn read_at(&mut self, _mem: MemClass, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = self.space.resolve(addr, buf.len())?;
        let len = self.physical_len()?;
        buf.fill(0);
        if start < len {
            let n = ((len - start) as usize).min(buf.len());
            self.file.seek(SeekFrom::Start(start))?;
            self.file.read_exact(&mut buf[..n])?;
        }
        Ok(())
    }

    fn write_at(&mut self, _mem: MemClass, addr: u64, buf: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "medium opened read-only",
            ));
        }
        let start = self.space.resolve(addr, buf.len())?;
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(buf)
    }

    fn eof(&self) -> io::Result<u64> {
        Ok(self.physical_len()?.saturating_sub(self.space.base()))
    }

    fn eoa(&self, _mem: MemClass) -> u64 {
        self.space.eoa()
    }

    fn set_eoa(&mut self, _mem: MemClass, addr: u64) -> io::Result<()> {
        self.space.set_eoa(addr)
    }

    fn base_addr(&self) -> u64 {
        self.space.base()
    }

    fn set_base_addr(&mut self, addr: u64) -> io::Result<()> {
        self.space.set_base(addr)
    }

    fn truncate(&mut self) -> io::Result<()> {
        if self.writable {
            self.file.set_len(self.space.eoa_abs())?;
            self.file.flush()?;
        }
        Ok(())
    }
}
