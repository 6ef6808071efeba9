//! embedded-datalog - Card Specific Data decode
//!
//! The CSD is a raw 16-byte register captured once during initialization.
//! The structure-version field selects one of two layouts; anything else is
//! a protocol violation. Capacity is derived here exactly once and cached
//! by the driver in its `CardInfo`.

use crate::block_device::{Sector, SectorCount};

/// A decoded CSD register, version 1.0 (standard capacity).
#[derive(Debug, Copy, Clone)]
pub struct CsdV1 {
    /// The raw register bytes, as received from the card.
    pub data: [u8; 16],
}

/// A decoded CSD register, version 2.0 (high/extended capacity).
#[derive(Debug, Copy, Clone)]
pub struct CsdV2 {
    /// The raw register bytes, as received from the card.
    pub data: [u8; 16],
}

impl CsdV1 {
    /// Create a new, empty V1 CSD.
    pub fn new() -> CsdV1 {
        CsdV1 { data: [0u8; 16] }
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_bl_len, u8, 5, 0, 4);
    define_field!(c_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(c_size_mult, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);

    /// The card's block length in bytes, clamped to 512 if the field
    /// reports anything outside {512, 1024, 2048}.
    pub fn block_len(&self) -> u32 {
        match 1u32 << self.read_bl_len() {
            len @ 512 | len @ 1024 | len @ 2048 => len,
            _ => 512,
        }
    }

    /// Total number of card-native blocks: `(C_SIZE+1) * 2^(C_SIZE_MULT+2)`.
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.c_size() + 1) << (self.c_size_mult() + 2)
    }

    /// The usable size of the card in bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        u64::from(self.card_capacity_blocks()) * u64::from(self.block_len())
    }
}

impl CsdV2 {
    /// Create a new, empty V2 CSD.
    pub fn new() -> CsdV2 {
        CsdV2 { data: [0u8; 16] }
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(c_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);

    /// Total number of 512-byte sectors: `(C_SIZE+1) * 1024`.
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.c_size() + 1) * 1024
    }

    /// The usable size of the card in bytes. V2 cards always use 512-byte
    /// blocks.
    pub fn card_capacity_bytes(&self) -> u64 {
        u64::from(self.card_capacity_blocks()) * 512
    }
}

impl Default for CsdV1 {
    fn default() -> Self {
        CsdV1::new()
    }
}

impl Default for CsdV2 {
    fn default() -> Self {
        CsdV2::new()
    }
}

/// A CSD of either layout.
#[derive(Debug, Copy, Clone)]
pub enum Csd {
    /// A version 1.0 CSD.
    V1(CsdV1),
    /// A version 2.0 CSD.
    V2(CsdV2),
}

impl Csd {
    /// Decode 16 raw register bytes, selecting the layout from the
    /// structure-version field. Any version other than 0 or 1 is a
    /// protocol violation; the offending value is returned.
    pub fn parse(data: [u8; 16]) -> Result<Csd, u8> {
        match data[0] >> 6 {
            0 => Ok(Csd::V1(CsdV1 { data })),
            1 => Ok(Csd::V2(CsdV2 { data })),
            version => Err(version),
        }
    }

    /// The usable size of the card in bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes(),
            Csd::V2(csd) => csd.card_capacity_bytes(),
        }
    }

    /// The card's capacity in 512-byte sectors.
    pub fn num_sectors(&self) -> SectorCount {
        SectorCount((self.card_capacity_bytes() / Sector::LEN as u64) as u32)
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
