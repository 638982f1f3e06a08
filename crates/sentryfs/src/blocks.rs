//! Block-indexed checksum mode.
//!
//! Instead of one running digest per file, every 4096-byte block carries its
//! own digest row in the sidecar. Writes become read-modify-write cycles on
//! whole blocks with a fail-closed pre-image check; reads re-hash each block
//! they touch. This makes random writes cheap (no full-file rescan) at the
//! cost of one extra block read per written block.

use std::os::fd::OwnedFd;
use std::path::Path;

use rustix::{
    buffer::spare_capacity,
    fs::{open, Mode, OFlags},
    io::{pread, pwrite},
};

use crate::{
    digest::Fnv64,
    error::{OverlayError, Result},
    sidecar::Sidecar,
};

/// Size of one checksummed block.
pub const BLOCK_SIZE: usize = 4096;

/// The block covering a byte offset.
pub fn index_of(offset: u64) -> u64 {
    offset / BLOCK_SIZE as u64
}

/// The stored digest of one block, parsed. Lookup failures are logged and
/// treated as "unprotected" (fail-open), like every read-path sidecar error.
fn stored_block(sidecar: &Sidecar, path: &str, index: u64) -> Option<u64> {
    let raw = match sidecar.get_block(path, index) {
        Ok(raw) => raw?,
        Err(err) => {
            log::warn!("sidecar lookup failed for {path} block {index}: {err}");
            return None;
        }
    };
    match Fnv64::parse_hex(&raw) {
        Some(value) => Some(value),
        None => {
            log::warn!("unparseable stored digest for {path} block {index}: {raw:?}");
            None
        }
    }
}

/// Read one full block from the backing descriptor. The returned buffer is
/// shorter than [`BLOCK_SIZE`] at end of file and empty beyond it.
fn read_block(fd: &OwnedFd, index: u64) -> Result<Vec<u8>> {
    let mut block = Vec::with_capacity(BLOCK_SIZE);
    pread(fd, spare_capacity(&mut block), index * BLOCK_SIZE as u64)?;
    Ok(block)
}

/// Verify every block touched by a read of `len` bytes at `offset`.
pub(crate) fn verify_range(
    sidecar: &Sidecar,
    vpath: &str,
    fd: &OwnedFd,
    offset: u64,
    len: usize,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let first = index_of(offset);
    let last = index_of(offset + len as u64 - 1);
    for index in first..=last {
        let Some(stored) = stored_block(sidecar, vpath, index) else {
            continue;
        };
        let block = read_block(fd, index)?;
        if block.is_empty() {
            continue;
        }
        let found = Fnv64::of_bytes(&block);
        if found.value() != stored {
            log::error!("block {index} of {vpath} failed verification");
            return Err(OverlayError::DigestMismatch {
                path: vpath.to_string(),
                stored: format!("{stored:016x}"),
                found: found.to_hex(),
            });
        }
    }
    Ok(())
}

/// Apply a write as per-block read-verify-modify-write cycles.
///
/// Each touched block is read back from the backing file and checked
/// against its stored digest before the user bytes are patched in; a
/// pre-image mismatch aborts the write. Every rewritten block's new digest
/// is upserted as it lands.
pub(crate) fn write_range(
    sidecar: &Sidecar,
    vpath: &str,
    fd: &OwnedFd,
    offset: u64,
    data: &[u8],
) -> Result<usize> {
    let mut done = 0;
    while done < data.len() {
        let pos = offset + done as u64;
        let index = index_of(pos);
        let block_start = index * BLOCK_SIZE as u64;
        let within = (pos - block_start) as usize;
        let take = (BLOCK_SIZE - within).min(data.len() - done);

        let mut block = read_block(fd, index)?;
        if !block.is_empty() {
            if let Some(stored) = stored_block(sidecar, vpath, index) {
                let found = Fnv64::of_bytes(&block);
                if found.value() != stored {
                    log::error!("pre-write verification failed for block {index} of {vpath}");
                    return Err(OverlayError::DigestMismatch {
                        path: vpath.to_string(),
                        stored: format!("{stored:016x}"),
                        found: found.to_hex(),
                    });
                }
            }
        }

        if block.len() < within + take {
            block.resize(within + take, 0);
        }
        block[within..within + take].copy_from_slice(&data[done..done + take]);

        let mut written = 0;
        while written < block.len() {
            let n = pwrite(fd, &block[written..], block_start + written as u64)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            written += n;
        }
        sidecar.put_block(vpath, index, &Fnv64::of_bytes(&block).to_hex())?;

        done += take;
    }
    Ok(done)
}

/// Trim the sidecar after a truncate to `size` bytes.
///
/// Rows strictly beyond the new last block are deleted; a shrink landing
/// mid-block re-hashes the surviving tail from the backing file.
pub(crate) fn truncate_range(
    sidecar: &Sidecar,
    vpath: &str,
    real: &Path,
    size: u64,
) -> Result<()> {
    if size == 0 {
        return sidecar.del_blocks(vpath);
    }
    let last = index_of(size - 1);
    sidecar.del_blocks_after(vpath, last)?;
    if size % BLOCK_SIZE as u64 != 0 {
        let fd = open(real, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())?;
        let block = read_block(&fd, last)?;
        sidecar.put_block(vpath, last, &Fnv64::of_bytes(&block).to_hex())?;
    }
    Ok(())
}
