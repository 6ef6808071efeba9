//! embedded-datalog - Sector types
//!
//! Newtypes for the fixed 512-byte addressable unit and sector arithmetic.

use core::ops::{Add, AddAssign, Deref, DerefMut};

/// A single 512-byte sector, as transferred to and from the card.
#[derive(Clone)]
pub struct Sector {
    /// The raw bytes of this sector.
    pub contents: [u8; Sector::LEN],
}

impl Sector {
    /// Every sector is this many bytes.
    pub const LEN: usize = 512;

    /// Create a zeroed sector.
    pub fn new() -> Sector {
        Sector {
            contents: [0; Sector::LEN],
        }
    }
}

impl Default for Sector {
    fn default() -> Self {
        Sector::new()
    }
}

impl Deref for Sector {
    type Target = [u8; Sector::LEN];
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for Sector {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

impl core::fmt::Debug for Sector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Sector:")?;
        for line in self.contents.chunks(32) {
            for b in line {
                write!(f, "{:02x}", b)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// The address of a sector on the card. The first sector is number zero.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SectorIdx(pub u32);

/// A number of sectors.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SectorCount(pub u32);

impl SectorIdx {
    /// The byte offset on the card where this sector starts.
    pub fn into_bytes(self) -> u64 {
        (u64::from(self.0)) * (Sector::LEN as u64)
    }
}

impl Add<SectorCount> for SectorIdx {
    type Output = SectorIdx;
    fn add(self, rhs: SectorCount) -> SectorIdx {
        SectorIdx(self.0 + rhs.0)
    }
}

impl AddAssign<SectorCount> for SectorIdx {
    fn add_assign(&mut self, rhs: SectorCount) {
        self.0 += rhs.0
    }
}

impl SectorCount {
    /// The total size of this many sectors, in bytes.
    pub fn into_bytes(self) -> u64 {
        (u64::from(self.0)) * (Sector::LEN as u64)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
