//! embedded-datalog - Block Device support
//!
//! Generic code for handling sector-addressed storage. Both card transport
//! variants implement [`BlockDevice`]; everything above this layer (hotplug,
//! filesystem adapter) only speaks this trait.

mod memory;
mod sector;

pub use memory::{MemoryBlockDevice, MemoryDeviceError};
pub use sector::{Sector, SectorCount, SectorIdx};

/// How the card addresses its contents.
///
/// Standard-capacity cards take byte addresses on the wire; high- and
/// extended-capacity cards take sector addresses.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CapacityClass {
    /// Byte-addressed, limited to 2 GiB.
    Standard,
    /// Sector-addressed (SDHC/SDXC).
    High,
}

/// Everything learned about a card during initialization.
///
/// Capacity is decoded once from the card registers and cached here; it is
/// never recomputed per I/O.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CardInfo {
    /// How many 512-byte sectors the card holds.
    pub num_sectors: SectorCount,
    /// Byte- or sector-addressed.
    pub capacity_class: CapacityClass,
    /// Which transport brought this card up. Diagnostic only.
    pub interface: &'static str,
    /// The bus clock agreed with the card, in Hz. Diagnostic only.
    pub clock_hz: u32,
}

impl CardInfo {
    /// The usable size of the card in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.num_sectors.into_bytes()
    }
}

/// Represents a block device - a device which can read and write 512-byte
/// sectors. Only supports devices which are <= 2 TiB in size.
///
/// Constructed once per physical socket and re-initialized by the hotplug
/// manager each time a card is (re)inserted.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;

    /// Bring a freshly inserted card to a ready state and report what was
    /// found. Called again after every re-insertion.
    fn init(&mut self) -> Result<CardInfo, Self::Error>;

    /// Read one or more sectors, starting at the given sector index.
    fn read_sectors(
        &mut self,
        start: SectorIdx,
        sectors: &mut [Sector],
    ) -> Result<(), Self::Error>;

    /// Write one or more sectors, starting at the given sector index.
    fn write_sectors(&mut self, start: SectorIdx, sectors: &[Sector]) -> Result<(), Self::Error>;

    /// Wait until all previously written data is committed to the media.
    fn sync(&mut self) -> Result<(), Self::Error>;

    /// Sample the socket's presence signal. May be called in any state.
    fn card_present(&mut self) -> bool;

    /// Read a single sector.
    fn read_sector(&mut self, idx: SectorIdx) -> Result<Sector, Self::Error> {
        let mut sectors = [Sector::new()];
        self.read_sectors(idx, &mut sectors)?;
        let [sector] = sectors;
        Ok(sector)
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn init(&mut self) -> Result<CardInfo, Self::Error> {
        (*self).init()
    }

    fn read_sectors(
        &mut self,
        start: SectorIdx,
        sectors: &mut [Sector],
    ) -> Result<(), Self::Error> {
        (*self).read_sectors(start, sectors)
    }

    fn write_sectors(&mut self, start: SectorIdx, sectors: &[Sector]) -> Result<(), Self::Error> {
        (*self).write_sectors(start, sectors)
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        (*self).sync()
    }

    fn card_present(&mut self) -> bool {
        (*self).card_present()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
