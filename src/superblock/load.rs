use crate::cache::{CacheEntry, EntryType, Intent, Loaded};
use crate::error::{FileError, Result};
use crate::medium::{addr_defined, MemClass, Medium};

use super::driver::{driver_data_len, decode_driver_block, encode_driver_block, DRIVER_BLOCK_HEADER_SIZE};
use super::{Decoded, StatusFlags, Superblock, PROBE_LEN};

impl CacheEntry for Superblock {
    type Error = FileError;

    const TYPE: EntryType = EntryType::Superblock;

    fn load(medium: &mut dyn Medium, addr: u64, intent: Intent) -> Result<Loaded<Self>> {
        medium.set_eoa(MemClass::Super, addr + PROBE_LEN as u64)?;
        let mut prefix = [0u8; PROBE_LEN];
        medium.read_at(MemClass::Super, addr, &mut prefix)?;
        let len = Superblock::required_len(&prefix)?;

        medium.set_eoa(MemClass::Super, addr + len as u64)?;
        let mut buf = vec![0u8; len];
        medium.read_at(MemClass::Super, addr, &mut buf)?;

        let located = medium.base_addr() + addr;
        let Decoded { superblock: mut sb, base_adjusted } = Superblock::decode(&buf, located)?;
        let mut dirtied = base_adjusted;

        let driver_addr = sb.driver_addr();
        if addr_defined(driver_addr) {
            let mut header = [0u8; DRIVER_BLOCK_HEADER_SIZE];
            let header_end = driver_addr + DRIVER_BLOCK_HEADER_SIZE as u64;
            medium.set_eoa(MemClass::Super, header_end)?;
            medium.read_at(MemClass::Super, driver_addr, &mut header)?;

            let data_len = driver_data_len(&header)?;
            medium.set_eoa(MemClass::Super, header_end + data_len as u64)?;
            let mut block = vec![0u8; DRIVER_BLOCK_HEADER_SIZE + data_len];
            medium.read_at(MemClass::Super, driver_addr, &mut block)?;
            let info = decode_driver_block(&block)?;
            tracing::debug!(driver = %info.name_str(), len = data_len, "driver info block read");
            medium.sb_decode(&info)?;
        }

        if addr_defined(sb.eoa) {
            let eof = medium.eof()?;
            if eof < sb.eoa {
                return Err(FileError::Truncated { eof, eoa: sb.eoa });
            }
            medium.set_eoa(MemClass::Super, sb.eoa)?;
        }

        if intent == Intent::Write
            && sb.supports_extension()
            && !sb.status.contains(StatusFlags::WRITE_ACCESS)
        {
            sb.status.insert(StatusFlags::WRITE_ACCESS);
            dirtied = true;
        }

        Ok(Loaded { entry: sb, dirtied })
    }

    fn flush(&mut self, medium: &mut dyn Medium, addr: u64) -> Result<()> {
        self.eoa = medium.eoa(MemClass::Super);
        let bytes = self.encode()?;
        medium.write_at(MemClass::Super, addr, &bytes)?;

        let driver_addr = self.driver_addr();
        if addr_defined(driver_addr) {
            if let Some(info) = medium.sb_encode()? {
                let block = encode_driver_block(&info)?;
                medium.write_at(MemClass::Super, driver_addr, &block)?;
            }
        }
        tracing::trace!(version = self.version(), eoa = self.eoa, "superblock flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Sizes;
    use crate::medium::{DriverInfo, MemoryMedium};
    use crate::superblock::{VERSION_0, VERSION_2};

    fn flushed(version: u8, medium: &mut MemoryMedium, eoa: u64) -> Superblock {
        let mut sb = Superblock::new(version, Sizes::default()).unwrap();
        sb.base_addr = 0;
        medium.set_eoa(MemClass::Super, eoa).unwrap();
        sb.flush(medium, 0).unwrap();
        medium.truncate().unwrap();
        sb
    }

    #[test]
    fn write_intent_sets_write_access_on_compact_versions() {
        let mut m = MemoryMedium::new();
        flushed(VERSION_2, &mut m, 256);

        let mut m = MemoryMedium::from_bytes(m.into_bytes());
        let loaded = Superblock::load(&mut m, 0, Intent::Write).unwrap();
        assert!(loaded.dirtied);
        assert!(loaded.entry.status.contains(StatusFlags::WRITE_ACCESS));
        assert_eq!(m.eoa(MemClass::Super), 256);

        let loaded = Superblock::load(&mut m, 0, Intent::Read).unwrap();
        assert!(!loaded.dirtied);
    }

    #[test]
    fn short_file_is_truncated() {
        let mut m = MemoryMedium::new();
        flushed(VERSION_2, &mut m, 256);
        let mut bytes = m.into_bytes();
        bytes.truncate(100);

        let mut m = MemoryMedium::from_bytes(bytes);
        assert!(matches!(
            Superblock::load(&mut m, 0, Intent::Read),
            Err(FileError::Truncated { eof: 100, eoa: 256 })
        ));
    }

    #[test]
    fn legacy_driver_block_reaches_the_medium() {
        let info = DriverInfo::new("family", vec![7; 24]);
        let mut m = MemoryMedium::new().with_driver_info(info.clone());
        let mut sb = Superblock::new(VERSION_0, Sizes::default()).unwrap();
        sb.base_addr = 0;
        let sb_len = sb.encoded_len() as u64;
        sb.set_driver_addr(sb_len);
        m.set_eoa(MemClass::Super, sb_len + 16 + 24).unwrap();
        sb.flush(&mut m, 0).unwrap();

        let mut fresh = MemoryMedium::from_bytes(m.into_bytes());
        let loaded = Superblock::load(&mut fresh, 0, Intent::Read).unwrap();
        assert_eq!(loaded.entry.driver_addr(), sb_len);
        assert_eq!(fresh.driver_info(), Some(&info));
    }
}
