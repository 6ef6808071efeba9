//! embedded-datalog - SD/MMC wire protocol definitions
//!
//! Command numbering, response flags, data tokens and the two CRCs, shared
//! by the serial (SPI) and four-bit (SDIO) transport variants.

use bitflags::bitflags;

/// CMD0: put the card in idle state.
pub const CMD0: u8 = 0x00;
/// CMD2: ask all cards to send their CID (SDIO enumeration).
pub const CMD2: u8 = 0x02;
/// CMD3: ask the card to publish a relative card address (SDIO enumeration).
pub const CMD3: u8 = 0x03;
/// CMD6: switch card function (used for the high-speed switch).
pub const CMD6: u8 = 0x06;
/// CMD7: select the card with the given relative address.
pub const CMD7: u8 = 0x07;
/// CMD8: check interface/voltage conditions.
pub const CMD8: u8 = 0x08;
/// CMD9: send the card-specific data (CSD) register.
pub const CMD9: u8 = 0x09;
/// CMD12: stop a multi-sector transmission.
pub const CMD12: u8 = 0x0C;
/// CMD13: send card status.
pub const CMD13: u8 = 0x0D;
/// CMD17: read a single sector.
pub const CMD17: u8 = 0x11;
/// CMD18: read multiple sectors.
pub const CMD18: u8 = 0x12;
/// CMD24: write a single sector.
pub const CMD24: u8 = 0x18;
/// CMD25: write multiple sectors.
pub const CMD25: u8 = 0x19;
/// CMD55: prefix for application-specific commands.
pub const CMD55: u8 = 0x37;
/// CMD58: read the operating conditions register (OCR).
pub const CMD58: u8 = 0x3A;
/// CMD59: turn CRC checking on or off.
pub const CMD59: u8 = 0x3B;
/// ACMD6: set the data bus width (SDIO).
pub const ACMD6: u8 = 0x06;
/// ACMD41: start card initialization, negotiating capacity support.
pub const ACMD41: u8 = 0x29;

bitflags! {
    /// The R1 status byte every SPI-mode command answers with. The top bit
    /// is always zero in a valid response; that is what the response poll
    /// looks for.
    pub struct R1: u8 {
        /// Card is in the idle state, running its initialization.
        const IDLE_STATE = 0x01;
        /// An erase sequence was cleared before executing.
        const ERASE_RESET = 0x02;
        /// The command was not legal for the card's state.
        const ILLEGAL_COMMAND = 0x04;
        /// The command's CRC check failed.
        const COM_CRC_ERROR = 0x08;
        /// An error occurred in the sequence of erase commands.
        const ERASE_SEQUENCE_ERROR = 0x10;
        /// A misaligned address did not match the block length.
        const ADDRESS_ERROR = 0x20;
        /// The command's argument was out of range.
        const PARAMETER_ERROR = 0x40;
    }
}

impl R1 {
    /// The card is fully ready: no error and no longer idle.
    pub const READY_STATE: R1 = R1::empty();

    /// Valid responses have the top bit clear.
    pub fn is_response(byte: u8) -> bool {
        (byte & 0x80) == 0
    }
}

/// Token announcing the start of a read or single-sector write payload.
pub const DATA_START_TOKEN: u8 = 0xFE;
/// Token announcing one sector of a multi-sector write.
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
/// Token ending a multi-sector write.
pub const STOP_TRAN_TOKEN: u8 = 0xFD;
/// Mask for the data-response token after a write payload.
pub const DATA_RES_MASK: u8 = 0x1F;
/// Data-response value meaning the payload was accepted.
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// The CMD8 argument: 2.7-3.6V range plus the 0xAA check pattern the card
/// must echo back. A different echo is a voltage/interface mismatch.
pub const CMD8_CHECK_PATTERN: u32 = 0x1AA;
/// OCR bit indicating a high/extended-capacity card.
pub const OCR_CCS: u32 = 0x4000_0000;
/// ACMD41 argument bit announcing we support high-capacity cards.
pub const ACMD41_HCS: u32 = 0x4000_0000;

/// Compute the 7-bit command CRC over `data`, returned shifted up one with
/// the stop bit set, ready to be the sixth byte of a command frame.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut byte in data.iter().cloned() {
        for _ in 0..8 {
            crc <<= 1;
            if ((byte & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            byte <<= 1;
        }
    }
    (crc << 1) | 1
}

/// The CRC-16 (CCITT polynomial 0x1021) protecting every 512-byte payload.
///
/// Kept as running state so the transports can fold each byte in as it
/// crosses the bus, rather than making a second pass over the sector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Crc16(u16);

impl Crc16 {
    /// Start a fresh CRC.
    pub fn new() -> Crc16 {
        Crc16(0)
    }

    /// Fold one byte into the running CRC.
    pub fn update(&mut self, byte: u8) {
        self.0 ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if (self.0 & 0x8000) != 0 {
                self.0 = (self.0 << 1) ^ 0x1021;
            } else {
                self.0 <<= 1;
            }
        }
    }

    /// The CRC over everything folded in so far.
    pub fn get(self) -> u16 {
        self.0
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Crc16::new()
    }
}

/// One-shot CRC-16 over a whole buffer.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    for &byte in data {
        crc.update(byte);
    }
    crc.get()
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
