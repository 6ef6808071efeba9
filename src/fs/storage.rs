//! The translation layer between the embedded filesystem's logical
//! (block, offset, length) addressing and the card's sector addressing.
//!
//! The filesystem is configured with 512-byte read/program granularity and
//! a power-of-two logical block size larger than the physical sector, so
//! every access that reaches this adapter must already be sector-aligned;
//! anything else is rejected rather than rounded. Erase is a no-op because
//! the media manages its own erasure, and wear-leveling is likewise
//! delegated to the media.

use crate::block_device::{BlockDevice, Sector, SectorCount, SectorIdx};

/// The mutual-exclusion the filesystem requires around its own state when
/// several logical callers share one mount. Filesystem calls are made
/// exclusively from task context and may block on the card for the full
/// media latency, so this is a schedulable (blocking) lock, not the
/// interrupt-safe spin primitive the ring buffer uses.
pub trait RawLock {
    /// Block until the lock is held.
    fn lock(&self);
    /// Release the lock.
    fn unlock(&self);
}

/// Errors the adapter can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterError<E> {
    /// An offset or length was not a multiple of the sector size.
    Unaligned,
    /// The access ran past the configured block count.
    OutOfRange,
    /// The block device failed.
    Device(E),
}

impl<E> From<E> for AdapterError<E> {
    fn from(e: E) -> Self {
        AdapterError::Device(e)
    }
}

/// Binds a [`BlockDevice`] to the filesystem's block-callback contract.
pub struct StorageAdapter<BD, L>
where
    BD: BlockDevice,
    L: RawLock,
{
    device: BD,
    lock: L,
    block_size: u32,
    block_count: u32,
}

impl<BD, L> StorageAdapter<BD, L>
where
    BD: BlockDevice,
    L: RawLock,
{
    /// Create an adapter over `device` with the filesystem's logical block
    /// size. `block_size` must be a power of two and a multiple of the
    /// 512-byte sector; `num_sectors` is what the card reported at init.
    pub fn new(device: BD, lock: L, block_size: u32, num_sectors: u32) -> Self {
        debug_assert!(block_size.is_power_of_two());
        debug_assert!(block_size >= Sector::LEN as u32);
        let sectors_per_block = block_size / Sector::LEN as u32;
        StorageAdapter {
            device,
            lock,
            block_size,
            block_count: num_sectors / sectors_per_block,
        }
    }

    /// The configured logical block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// How many whole logical blocks fit on the card.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Give back the device.
    pub fn free(self) -> BD {
        self.device
    }

    /// The filesystem's lock callback.
    pub fn lock(&self) {
        self.lock.lock();
    }

    /// The filesystem's unlock callback.
    pub fn unlock(&self) {
        self.lock.unlock();
    }

    /// Translate (block, offset, length) to a starting sector and count,
    /// rejecting anything misaligned or out of range.
    fn translate(
        &self,
        block: u32,
        off: u32,
        len: usize,
    ) -> Result<(SectorIdx, usize), AdapterError<BD::Error>> {
        let sector_len = Sector::LEN as u32;
        if off % sector_len != 0 || (len as u32) % sector_len != 0 {
            return Err(AdapterError::Unaligned);
        }
        if block >= self.block_count || off + len as u32 > self.block_size {
            return Err(AdapterError::OutOfRange);
        }
        let start = block * (self.block_size / sector_len) + off / sector_len;
        Ok((SectorIdx(start), len / Sector::LEN))
    }

    /// The filesystem's read callback.
    pub fn read(
        &mut self,
        block: u32,
        off: u32,
        buf: &mut [u8],
    ) -> Result<(), AdapterError<BD::Error>> {
        let (start, count) = self.translate(block, off, buf.len())?;
        let mut sector = Sector::new();
        for idx in 0..count {
            self.device.read_sectors(
                start + SectorCount(idx as u32),
                core::slice::from_mut(&mut sector),
            )?;
            buf[idx * Sector::LEN..(idx + 1) * Sector::LEN].copy_from_slice(&sector.contents);
        }
        Ok(())
    }

    /// The filesystem's program callback.
    pub fn prog(
        &mut self,
        block: u32,
        off: u32,
        buf: &[u8],
    ) -> Result<(), AdapterError<BD::Error>> {
        let (start, count) = self.translate(block, off, buf.len())?;
        let mut sector = Sector::new();
        for idx in 0..count {
            sector
                .contents
                .copy_from_slice(&buf[idx * Sector::LEN..(idx + 1) * Sector::LEN]);
            self.device
                .write_sectors(start + SectorCount(idx as u32), core::slice::from_ref(&sector))?;
        }
        Ok(())
    }

    /// The filesystem's erase callback. A no-op: the media self-manages
    /// erase before program.
    pub fn erase(&mut self, block: u32) -> Result<(), AdapterError<BD::Error>> {
        if block >= self.block_count {
            return Err(AdapterError::OutOfRange);
        }
        Ok(())
    }

    /// The filesystem's sync callback.
    pub fn sync(&mut self) -> Result<(), AdapterError<BD::Error>> {
        self.device.sync()?;
        Ok(())
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
