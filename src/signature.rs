//! Format signature and the scan that finds it.
//!
//! A container may be preceded by an arbitrary user block.  The signature is
//! therefore searched for at address 0 and then at every power of two from
//! 512 up to the end of the file; the first match fixes the base address.

use crate::error::{FileError, Result};
use crate::medium::{MemClass, Medium};

/// Eight-byte magic that opens every superblock.
pub const SIGNATURE: &[u8; SIGNATURE_LEN] = b"\x89ARB\r\n\x1a\n";
pub const SIGNATURE_LEN: usize = 8;

/// Smallest nonzero probe exponent; 2^9 = 512.
const MIN_PROBE_POW: u32 = 9;

/// Smallest nonzero user block the scan can step over.
pub const MIN_USERBLOCK_SIZE: u64 = 1 << MIN_PROBE_POW;

/// Whether a user block of `size` bytes leaves the signature where
/// [`locate_signature`] looks for it.
pub fn userblock_locatable(size: u64) -> bool {
    size == 0 || (size >= MIN_USERBLOCK_SIZE && size.is_power_of_two())
}

/// Find the absolute address of the signature.
///
/// The end-of-allocation marker is widened to cover each probe window.  On
/// success it is left covering the matching window (callers re-set it once
/// the superblock is decoded); on any failure it is restored.
pub fn locate_signature<M: Medium + ?Sized>(medium: &mut M) -> Result<u64> {
    let eoa = medium.eoa(MemClass::Super);
    match scan(medium) {
        Ok(Some(addr)) => {
            tracing::debug!(addr, "located file signature");
            Ok(addr)
        }
        outcome => {
            // Restore failure is not interesting; the file is rejected either way.
            let _ = medium.set_eoa(MemClass::Super, eoa);
            outcome.and(Err(FileError::NotAContainerFile))
        }
    }
}

fn scan<M: Medium + ?Sized>(medium: &mut M) -> Result<Option<u64>> {
    let eof = medium.eof()?;
    // Least N such that 2^N exceeds the file size.
    let maxpow = (u64::BITS - eof.leading_zeros()).max(MIN_PROBE_POW);

    let mut buf = [0u8; SIGNATURE_LEN];
    for n in 8..maxpow {
        let addr = if n == 8 { 0 } else { 1u64 << n };
        medium.set_eoa(MemClass::Super, addr + SIGNATURE_LEN as u64)?;
        medium.read_at(MemClass::Super, addr, &mut buf)?;
        tracing::trace!(addr, bytes = %hex::encode(buf), "signature probe");
        if &buf == SIGNATURE {
            return Ok(Some(addr));
        }
    }
    Ok(None)
}
