//! embedded-datalog - four-bit parallel transport
//!
//! The same command numbering and CRC architecture as the serial variant,
//! but addressed via a relative card address assigned during enumeration,
//! with four data lines and DMA-driven bulk transfer. The host controller
//! peripheral (behind [`SdioBus`]) owns the clock, the bus width and the
//! hardware CRC engines; this driver owns the command sequencing.

use core::fmt::Debug;

use super::csd::Csd;
use super::proto::*;
use super::{Delay, Error};
use crate::block_device::{
    BlockDevice, CapacityClass, CardInfo, Sector, SectorCount, SectorIdx,
};

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

/// The clock every card must come up at.
pub const BASE_CLOCK_HZ: u32 = 25_000_000;
/// The clock we switch to when the card accepts the high-speed function.
pub const HIGH_SPEED_CLOCK_HZ: u32 = 50_000_000;

/// ACMD41 voltage window plus high-capacity support.
const ACMD41_ARG: u32 = ACMD41_HCS | 0x00FF_8000;
/// OCR bit 31: initialization complete.
const OCR_READY: u32 = 0x8000_0000;
/// CMD6 argument: switch (not just check) group 1 to function 1, high speed.
const CMD6_SWITCH_HIGH_SPEED: u32 = 0x80FF_FF01;
/// ACMD6 argument for a four-bit bus.
const ACMD6_BUS_WIDTH_4: u32 = 0x02;

/// Card-status bits that spell trouble after a transfer.
const STATUS_ANY_ERROR: u32 = 0xFDF9_E008;
/// Card-status bit 8: the card can accept data.
const STATUS_READY_FOR_DATA: u32 = 1 << 8;

/// What kind of response a command expects.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// No response at all (CMD0).
    None,
    /// A 48-bit response carrying a 32-bit payload.
    Short,
    /// A 48-bit response, with the card allowed to hold busy afterwards.
    ShortBusy,
    /// A 136-bit response (CID/CSD).
    Long,
}

/// Data bus width.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusWidth {
    /// One data line, the power-up default.
    One,
    /// Four data lines.
    Four,
}

/// The host controller peripheral the parallel driver runs on.
///
/// Implementations wrap a vendor SDMMC/SDIO peripheral: command register
/// writes, response registers, clock divider, bus-width field and the DMA
/// channel for bulk transfer. Hardware CRC failures surface as bus errors.
pub trait SdioBus {
    /// The errors the host controller can produce.
    type Error: Debug;

    /// Issue a command and collect a short response (if any).
    fn send_command(&mut self, cmd: u8, arg: u32, kind: ResponseKind)
        -> Result<u32, Self::Error>;

    /// Issue a command expecting a 136-bit response. `[0]` holds the most
    /// significant word.
    fn send_command_long(&mut self, cmd: u8, arg: u32) -> Result<[u32; 4], Self::Error>;

    /// DMA one or more 512-byte sectors from the card. The data path must
    /// already have been set up by the matching read command.
    fn read_blocks(&mut self, sectors: &mut [Sector]) -> Result<(), Self::Error>;

    /// DMA one or more 512-byte sectors to the card.
    fn write_blocks(&mut self, sectors: &[Sector]) -> Result<(), Self::Error>;

    /// Receive a short (sub-sector) data payload, e.g. the 64-byte CMD6
    /// status block.
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Reconfigure the number of data lines.
    fn set_bus_width(&mut self, width: BusWidth) -> Result<(), Self::Error>;

    /// Reconfigure the bus clock.
    fn set_clock_hz(&mut self, hz: u32) -> Result<(), Self::Error>;

    /// Sample the socket's presence signal.
    fn card_present(&mut self) -> bool;
}

/// Options for bringing up a card on the parallel transport.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug)]
pub struct SdioOptions {
    /// Attempt the CMD6 switch to the 50 MHz function. On rejection or a
    /// failed status read the driver stays at the base clock.
    pub try_high_speed: bool,
}

impl Default for SdioOptions {
    fn default() -> Self {
        SdioOptions {
            try_high_speed: true,
        }
    }
}

/// What we hold on to once a card has come up.
#[derive(Debug, Copy, Clone)]
struct EnumeratedCard {
    info: CardInfo,
    ocr: u32,
    rca: u16,
}

/// An SD card socket on a four-bit host controller.
pub struct SdSdio<BUS>
where
    BUS: SdioBus,
{
    bus: BUS,
    options: SdioOptions,
    card: Option<EnumeratedCard>,
}

impl<BUS> SdSdio<BUS>
where
    BUS: SdioBus,
{
    /// Create a new driver for this socket, using the default options.
    pub fn new(bus: BUS) -> Self {
        Self::new_with_options(bus, SdioOptions::default())
    }

    /// Create a new driver for this socket with the given options.
    pub fn new_with_options(bus: BUS, options: SdioOptions) -> Self {
        SdSdio {
            bus,
            options,
            card: None,
        }
    }

    /// Give back the host controller.
    pub fn free(self) -> BUS {
        self.bus
    }

    /// What we learned about the card at the last successful `init`.
    pub fn card_info(&self) -> Option<&CardInfo> {
        self.card.as_ref().map(|c| &c.info)
    }

    /// The relative card address assigned during enumeration.
    pub fn rca(&self) -> Option<u16> {
        self.card.as_ref().map(|c| c.rca)
    }

    /// The operating-conditions register captured at `init`.
    pub fn ocr(&self) -> Option<u32> {
        self.card.as_ref().map(|c| c.ocr)
    }

    fn command(&mut self, cmd: u8, arg: u32, kind: ResponseKind) -> Result<u32, Error> {
        self.bus
            .send_command(cmd, arg, kind)
            .map_err(|_e| Error::Transport)
    }

    /// An application-specific command addressed to the selected card.
    fn acmd(&mut self, rca: u16, cmd: u8, arg: u32) -> Result<u32, Error> {
        self.command(CMD55, u32::from(rca) << 16, ResponseKind::Short)?;
        self.command(cmd, arg, ResponseKind::Short)
    }

    fn check_status(&self, cmd: u8, status: u32) -> Result<u32, Error> {
        if status & (1 << 22) != 0 {
            Err(Error::IllegalCommand(cmd))
        } else if status & STATUS_ANY_ERROR != 0 {
            Err(Error::WriteError)
        } else {
            Ok(status)
        }
    }

    /// The wire address for `start`, per the card's capacity class.
    fn address(&self, start: SectorIdx) -> Result<(u32, u16), Error> {
        let card = self.card.as_ref().ok_or(Error::NotInitialized)?;
        let address = match card.info.capacity_class {
            CapacityClass::Standard => start.0 * Sector::LEN as u32,
            CapacityClass::High => start.0,
        };
        Ok((address, card.rca))
    }

    /// Try the CMD6 function switch to high speed. Any rejection or status
    /// read failure leaves the card at the base clock.
    fn negotiate_clock(&mut self) -> Result<u32, Error> {
        if !self.options.try_high_speed {
            return Ok(BASE_CLOCK_HZ);
        }
        if self
            .command(CMD6, CMD6_SWITCH_HIGH_SPEED, ResponseKind::Short)
            .is_err()
        {
            warn!("Card rejected the function switch, staying at base clock");
            return Ok(BASE_CLOCK_HZ);
        }
        let mut status = [0u8; 64];
        if self.bus.read_bytes(&mut status).is_err() {
            warn!("Function-switch status read failed, staying at base clock");
            return Ok(BASE_CLOCK_HZ);
        }
        // Byte 16, low nibble: the function group 1 selection the card
        // actually made. 0xF means the switch was refused.
        if status[16] & 0x0F != 0x01 {
            debug!("Card declined high speed");
            return Ok(BASE_CLOCK_HZ);
        }
        self.bus
            .set_clock_hz(HIGH_SPEED_CLOCK_HZ)
            .map_err(|_e| Error::Transport)?;
        Ok(HIGH_SPEED_CLOCK_HZ)
    }

    fn enumerate(&mut self) -> Result<EnumeratedCard, Error> {
        self.bus
            .set_clock_hz(BASE_CLOCK_HZ)
            .map_err(|_e| Error::Transport)?;
        self.bus
            .set_bus_width(BusWidth::One)
            .map_err(|_e| Error::Transport)?;

        self.command(CMD0, 0, ResponseKind::None)?;

        // A card that answers CMD8 is v2 and must echo the check pattern;
        // a v1 card simply does not respond.
        let v2_card = match self.command(CMD8, CMD8_CHECK_PATTERN, ResponseKind::Short) {
            Ok(echo) => {
                if echo & 0xFFF != CMD8_CHECK_PATTERN {
                    return Err(Error::VoltageMismatch);
                }
                true
            }
            Err(_) => false,
        };

        // ACMD41 until the card reports power-up complete. The card is not
        // yet addressed, so CMD55 goes to RCA zero.
        let arg = if v2_card { ACMD41_ARG } else { ACMD41_ARG & !ACMD41_HCS };
        let mut delay = Delay::new();
        let ocr = loop {
            let ocr = self.acmd(0, ACMD41, arg)?;
            if ocr & OCR_READY != 0 {
                break ocr;
            }
            delay.delay(Error::TimeoutACommand(ACMD41))?;
        };
        let capacity_class = if ocr & OCR_CCS != 0 {
            CapacityClass::High
        } else {
            CapacityClass::Standard
        };

        // Enumerate: all-send-CID, then ask the card to publish an address.
        let _cid = self
            .bus
            .send_command_long(CMD2, 0)
            .map_err(|_e| Error::Transport)?;
        let r6 = self.command(CMD3, 0, ResponseKind::Short)?;
        let rca = (r6 >> 16) as u16;
        debug!("Card assigned RCA {:04x}", rca);

        // The CSD can only be read while the card is unselected.
        let raw = self
            .bus
            .send_command_long(CMD9, u32::from(rca) << 16)
            .map_err(|_e| Error::RegisterReadError)?;
        let mut csd_bytes = [0u8; 16];
        for (word_idx, word) in raw.iter().enumerate() {
            csd_bytes[word_idx * 4..word_idx * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        let csd = Csd::parse(csd_bytes).map_err(Error::UnsupportedCsdVersion)?;
        let num_sectors = csd.num_sectors();
        if num_sectors == SectorCount(0) {
            return Err(Error::ZeroCapacity);
        }

        // Select the card and widen the bus.
        self.command(CMD7, u32::from(rca) << 16, ResponseKind::ShortBusy)?;
        self.acmd(rca, ACMD6, ACMD6_BUS_WIDTH_4)?;
        self.bus
            .set_bus_width(BusWidth::Four)
            .map_err(|_e| Error::Transport)?;

        let clock_hz = self.negotiate_clock()?;
        debug!("Card online at {} Hz, {} sectors", clock_hz, num_sectors.0);

        Ok(EnumeratedCard {
            info: CardInfo {
                num_sectors,
                capacity_class,
                interface: "sd-4bit",
                clock_hz,
            },
            ocr,
            rca,
        })
    }
}

impl<BUS> BlockDevice for SdSdio<BUS>
where
    BUS: SdioBus,
{
    type Error = Error;

    /// Initializes the card into a known state. Any previous card state is
    /// discarded first, so this is also how a re-inserted card comes back.
    fn init(&mut self) -> Result<CardInfo, Self::Error> {
        self.card = None;
        let card = self.enumerate()?;
        self.card = Some(card);
        Ok(card.info)
    }

    /// Read one or more sectors, starting at the given sector index.
    fn read_sectors(
        &mut self,
        start: SectorIdx,
        sectors: &mut [Sector],
    ) -> Result<(), Self::Error> {
        let (address, _rca) = self.address(start)?;
        if sectors.len() == 1 {
            self.command(CMD17, address, ResponseKind::Short)?;
            self.bus.read_blocks(sectors).map_err(|_e| Error::ReadError)
        } else {
            self.command(CMD18, address, ResponseKind::Short)?;
            let result = self.bus.read_blocks(sectors).map_err(|_e| Error::ReadError);
            self.command(CMD12, 0, ResponseKind::ShortBusy)?;
            result
        }
    }

    /// Write one or more sectors, starting at the given sector index.
    ///
    /// A status query follows every write: DMA completion only proves the
    /// bytes left the controller, not that programming succeeded.
    fn write_sectors(&mut self, start: SectorIdx, sectors: &[Sector]) -> Result<(), Self::Error> {
        let (address, rca) = self.address(start)?;
        if sectors.len() == 1 {
            self.command(CMD24, address, ResponseKind::Short)?;
            self.bus
                .write_blocks(sectors)
                .map_err(|_e| Error::WriteError)?;
        } else {
            self.command(CMD25, address, ResponseKind::Short)?;
            self.bus
                .write_blocks(sectors)
                .map_err(|_e| Error::WriteError)?;
            self.command(CMD12, 0, ResponseKind::ShortBusy)?;
        }
        let status = self.command(CMD13, u32::from(rca) << 16, ResponseKind::Short)?;
        self.check_status(CMD13, status)?;
        Ok(())
    }

    /// Poll card status until it is ready for data again.
    fn sync(&mut self) -> Result<(), Self::Error> {
        let rca = self.card.as_ref().ok_or(Error::NotInitialized)?.rca;
        let mut delay = Delay::new();
        loop {
            let status = self.command(CMD13, u32::from(rca) << 16, ResponseKind::Short)?;
            let status = self.check_status(CMD13, status)?;
            if status & STATUS_READY_FOR_DATA != 0 {
                return Ok(());
            }
            delay.delay(Error::TimeoutWaitNotBusy)?;
        }
    }

    /// Sample the socket's presence signal.
    fn card_present(&mut self) -> bool {
        self.bus.card_present()
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
