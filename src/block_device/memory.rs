//! An in-memory [`BlockDevice`], mainly useful for testing the layers above
//! the card drivers. Supports scripting presence changes and fault injection
//! so hotplug and write-failure paths can be exercised on the host.

use super::{BlockDevice, CapacityClass, CardInfo, Sector, SectorCount, SectorIdx};

/// Errors a [`MemoryBlockDevice`] can produce.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryDeviceError {
    /// An access ran past the end of the backing memory.
    OutOfRange,
    /// The presence flag is currently cleared.
    NoCard,
    /// A scripted initialization failure.
    InitFault,
    /// A scripted write failure.
    WriteFault,
    /// A scripted sync failure.
    SyncFault,
}

/// A block device backed by a borrowed byte slice.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
    present: bool,
    init_faults: u32,
    write_faults: u32,
    sync_faults: u32,
}

impl<'a> MemoryBlockDevice<'a> {
    /// Create a device over `memory`, initially present.
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self {
            memory,
            present: true,
            init_faults: 0,
            write_faults: 0,
            sync_faults: 0,
        }
    }

    /// Simulate inserting or removing the card.
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
    }

    /// Fail the next `count` calls to `init`.
    pub fn fail_init(&mut self, count: u32) {
        self.init_faults = count;
    }

    /// Fail the next `count` calls to `write_sectors`.
    pub fn fail_writes(&mut self, count: u32) {
        self.write_faults = count;
    }

    /// Fail the next `count` calls to `sync`.
    pub fn fail_syncs(&mut self, count: u32) {
        self.sync_faults = count;
    }

    fn range(&self, start: SectorIdx, count: usize) -> Result<(usize, usize), MemoryDeviceError> {
        let first = (start.0 as usize) * Sector::LEN;
        let last = first + count * Sector::LEN;
        if last > self.memory.len() {
            Err(MemoryDeviceError::OutOfRange)
        } else {
            Ok((first, last))
        }
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryDeviceError;

    fn init(&mut self) -> Result<CardInfo, Self::Error> {
        if !self.present {
            return Err(MemoryDeviceError::NoCard);
        }
        if self.init_faults > 0 {
            self.init_faults -= 1;
            return Err(MemoryDeviceError::InitFault);
        }
        Ok(CardInfo {
            num_sectors: SectorCount((self.memory.len() / Sector::LEN) as u32),
            capacity_class: CapacityClass::High,
            interface: "memory",
            clock_hz: 0,
        })
    }

    fn read_sectors(
        &mut self,
        start: SectorIdx,
        sectors: &mut [Sector],
    ) -> Result<(), Self::Error> {
        if !self.present {
            return Err(MemoryDeviceError::NoCard);
        }
        let (first, _) = self.range(start, sectors.len())?;
        for (idx, sector) in sectors.iter_mut().enumerate() {
            let offset = first + idx * Sector::LEN;
            sector
                .contents
                .copy_from_slice(&self.memory[offset..offset + Sector::LEN]);
        }
        Ok(())
    }

    fn write_sectors(&mut self, start: SectorIdx, sectors: &[Sector]) -> Result<(), Self::Error> {
        if !self.present {
            return Err(MemoryDeviceError::NoCard);
        }
        if self.write_faults > 0 {
            self.write_faults -= 1;
            return Err(MemoryDeviceError::WriteFault);
        }
        let (first, _) = self.range(start, sectors.len())?;
        for (idx, sector) in sectors.iter().enumerate() {
            let offset = first + idx * Sector::LEN;
            self.memory[offset..offset + Sector::LEN].copy_from_slice(&sector.contents);
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        if !self.present {
            return Err(MemoryDeviceError::NoCard);
        }
        if self.sync_faults > 0 {
            self.sync_faults -= 1;
            return Err(MemoryDeviceError::SyncFault);
        }
        Ok(())
    }

    fn card_present(&mut self) -> bool {
        self.present
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
