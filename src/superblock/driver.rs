//! Driver-info block written after legacy superblocks.
//!
//! ```text
//! version(1) reserved(3) data_len(4) name(8) data(data_len)
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FileError, Result};
use crate::medium::DriverInfo;

const DRIVER_BLOCK_VERSION: u8 = 0;

pub const DRIVER_BLOCK_HEADER_SIZE: usize = 16;

/// Largest driver block, header included, the engine will write.
pub const MAX_DRIVER_BLOCK_SIZE: usize = 1024;

pub fn encode_driver_block(info: &DriverInfo) -> Result<Vec<u8>> {
    let total = DRIVER_BLOCK_HEADER_SIZE + info.data.len();
    if total > MAX_DRIVER_BLOCK_SIZE {
        return Err(FileError::InvalidConfig(format!(
            "driver info block of {total} bytes exceeds {MAX_DRIVER_BLOCK_SIZE}"
        )));
    }
    let mut out = Vec::with_capacity(total);
    out.write_u8(DRIVER_BLOCK_VERSION)?;
    out.extend_from_slice(&[0; 3]);
    out.write_u32::<LittleEndian>(info.data.len() as u32)?;
    out.extend_from_slice(&info.name);
    out.extend_from_slice(&info.data);
    Ok(out)
}

/// Length of the data that follows a driver block header.
pub(crate) fn driver_data_len(header: &[u8]) -> Result<usize> {
    if header.len() < DRIVER_BLOCK_HEADER_SIZE {
        return Err(FileError::Malformed("driver info block header".into()));
    }
    if header[0] != DRIVER_BLOCK_VERSION {
        return Err(FileError::Malformed(format!("driver info block version {}", header[0])));
    }
    let len = (&header[4..8]).read_u32::<LittleEndian>()? as usize;
    if DRIVER_BLOCK_HEADER_SIZE + len > MAX_DRIVER_BLOCK_SIZE {
        return Err(FileError::Malformed(format!("driver info block of {len} data bytes")));
    }
    Ok(len)
}

pub fn decode_driver_block(buf: &[u8]) -> Result<DriverInfo> {
    let len = driver_data_len(buf)?;
    let end = DRIVER_BLOCK_HEADER_SIZE + len;
    if buf.len() < end {
        return Err(FileError::Malformed(format!(
            "driver info block: {} bytes, need {end}",
            buf.len()
        )));
    }
    let mut name = [0u8; 8];
    name.copy_from_slice(&buf[8..16]);
    Ok(DriverInfo { name, data: buf[DRIVER_BLOCK_HEADER_SIZE..end].to_vec() })
}
