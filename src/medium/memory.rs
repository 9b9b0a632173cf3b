use std::io;

use super::{AddrSpace, DriverFeatures, DriverInfo, MemClass, Medium, MAX_ADDR};

/// A growable in-memory medium.
#[derive(Debug, Clone)]
pub struct MemoryMedium {
    data:     Vec<u8>,
    space:    AddrSpace,
    features: DriverFeatures,
    driver:   Option<DriverInfo>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// Wrap an existing image, e.g. the bytes of a previously written file.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            space:    AddrSpace::new(MAX_ADDR),
            features: DriverFeatures::empty(),
            driver:   None,
        }
    }

    /// Cap the addressable size.  Allocations beyond it fail.
    pub fn with_max_addr(mut self, max: u64) -> Self {
        self.space = AddrSpace::new(max);
        self
    }

    pub fn with_features(mut self, features: DriverFeatures) -> Self {
        self.features = features;
        self
    }

    /// Attach driver data that will be persisted with the superblock.
    pub fn with_driver_info(mut self, info: DriverInfo) -> Self {
        self.driver = Some(info);
        self
    }

    /// Driver data currently held, either configured or decoded from a file.
    pub fn driver_info(&self) -> Option<&DriverInfo> {
        self.driver.as_ref()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl Medium for MemoryMedium {
    fn read_at(&mut self, _mem: MemClass, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = self.space.resolve(addr, buf.len())? as usize;
        buf.fill(0);
        if start < self.data.len() {
            let n = (self.data.len() - start).min(buf.len());
            buf[..n].copy_from_slice(&self.data[start..start + n]);
        }
        Ok(())
    }

    fn write_at(&mut self, _mem: MemClass, addr: u64, buf: &[u8]) -> io::Result<()> {
        let start = self.space.resolve(addr, buf.len())? as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn eof(&self) -> io::Result<u64> {
        Ok((self.data.len() as u64).saturating_sub(self.space.base()))
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
        self.data.resize(self.space.eoa_abs() as usize, 0);
        Ok(())
    }

    fn max_addr(&self) -> u64 {
        self.space.max()
    }

    fn features(&self) -> DriverFeatures {
        self.features
    }

    fn sb_size(&self) -> usize {
        self.driver.as_ref().map_or(0, |d| d.data.len())
    }

    fn sb_encode(&self) -> io::Result<Option<DriverInfo>> {
        Ok(self.driver.clone())
    }

    fn sb_decode(&mut self, info: &DriverInfo) -> io::Result<()> {
        self.driver = Some(info.clone());
        Ok(())
    }
}
