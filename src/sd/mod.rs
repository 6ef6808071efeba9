//! embedded-datalog - SD/MMC card drivers
//!
//! Implements the SD/MMC command protocol over the two supported transports:
//! a single-bit serial (SPI) variant and a four-bit parallel (SDIO) variant.
//! Both expose the same [`BlockDevice`] contract and share the command
//! numbering, CRC architecture and CSD decode.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod busy;
pub mod csd;
pub mod proto;
mod sdio;

use busy::SdSpiBusy;

use core::fmt::Debug;

use crate::block_device::{
    BlockDevice, CapacityClass, CardInfo, Sector, SectorCount, SectorIdx,
};
use csd::Csd;
use proto::*;

pub use sdio::{BusWidth, ResponseKind, SdSdio, SdioBus, SdioOptions};

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::{InputPin, OutputPin};
#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

const DEFAULT_DELAY_COUNT: u32 = 32_000;

/// The possible errors the card drivers can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the underlying bus peripheral
    Transport,
    /// We failed to enable CRC checking on the SD card
    CantEnableCrc,
    /// We didn't get a response when reading data from the card
    TimeoutReadBuffer,
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// We didn't get a response when executing this application-specific command
    TimeoutACommand(u8),
    /// The card did not echo the interface-condition check pattern
    VoltageMismatch,
    /// The card rejected this command as illegal
    IllegalCommand(u8),
    /// We failed to read a card register
    RegisterReadError,
    /// The CSD structure version is not 0 or 1
    UnsupportedCsdVersion(u8),
    /// The card registers decoded to zero usable sectors
    ZeroCapacity,
    /// We got a CRC mismatch on a data payload
    Crc {
        /// The CRC the card sent
        received: u16,
        /// The CRC we computed over the payload
        computed: u16,
    },
    /// Error reading from the card
    ReadError,
    /// Error writing to the card
    WriteError,
    /// The card has not been initialized (or was removed)
    NotInitialized,
    /// Couldn't find the card
    CardNotFound,
    /// Couldn't set a GPIO pin
    GpioError,
}

/// A bounded busy-wait used for all response polling. Retries are counted,
/// not timed, and exhaustion converts to the given error.
struct Delay(u32);

impl Delay {
    fn new() -> Delay {
        Delay(DEFAULT_DELAY_COUNT)
    }

    fn delay(&mut self, err: Error) -> Result<(), Error> {
        if self.0 == 0 {
            Err(err)
        } else {
            let dummy_var: u32 = 0;
            for _ in 0..100 {
                unsafe { core::ptr::read_volatile(&dummy_var) };
            }
            self.0 -= 1;
            Ok(())
        }
    }
}

/// Options for bringing up a card on the serial transport.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug)]
pub struct SdSpiOptions {
    /// Some cards don't support CRC mode. At least a 512MiB Transcend one.
    pub require_crc: bool,
    /// Most card-detect switches pull the pin low when a card is seated.
    pub detect_active_low: bool,
    /// The SPI clock the bus runs at, reported in `CardInfo` for
    /// diagnostics only.
    pub bus_clock_hz: u32,
}

impl Default for SdSpiOptions {
    fn default() -> Self {
        SdSpiOptions {
            require_crc: true,
            detect_active_low: true,
            bus_clock_hz: 25_000_000,
        }
    }
}

/// What we hold on to once a card has come up.
#[derive(Debug, Copy, Clone)]
struct AcquiredCard {
    info: CardInfo,
    ocr: u32,
    csd: Csd,
}

/// An SD card socket on an SPI bus, with a separate chip select (so we can
/// clock bytes out without CS asserted, which is what puts the card into
/// SPI mode) and a card-detect pin.
///
/// Constructed once per socket; `init` is called again for every insertion.
pub struct SdSpi<SPI, CS, DETECT>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DETECT: InputPin,
{
    spi: SPI,
    cs: CS,
    detect: DETECT,
    options: SdSpiOptions,
    card: Option<AcquiredCard>,
}

impl<SPI, CS, DETECT> SdSpi<SPI, CS, DETECT>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DETECT: InputPin,
{
    /// Create a new driver for this socket, using the default options.
    pub fn new(spi: SPI, cs: CS, detect: DETECT) -> Self {
        Self::new_with_options(spi, cs, detect, SdSpiOptions::default())
    }

    /// Create a new driver for this socket with the given options.
    pub fn new_with_options(spi: SPI, cs: CS, detect: DETECT, options: SdSpiOptions) -> Self {
        SdSpi {
            spi,
            cs,
            detect,
            options,
            card: None,
        }
    }

    /// Give back the bus, chip select and detect pin.
    pub fn free(self) -> (SPI, CS, DETECT) {
        (self.spi, self.cs, self.detect)
    }

    /// What we learned about the card at the last successful `init`.
    pub fn card_info(&self) -> Option<&CardInfo> {
        self.card.as_ref().map(|c| &c.info)
    }

    /// The operating-conditions register captured at `init`.
    pub fn ocr(&self) -> Option<u32> {
        self.card.as_ref().map(|c| c.ocr)
    }

    /// The CSD captured at `init`.
    pub fn csd(&self) -> Option<&Csd> {
        self.card.as_ref().map(|c| &c.csd)
    }

    /// Can this card erase single blocks? Decoded from the cached CSD.
    pub fn erase_single_block_enabled(&self) -> Result<bool, Error> {
        self.card
            .as_ref()
            .map(|c| c.csd.erase_single_block_enabled())
            .ok_or(Error::NotInitialized)
    }

    fn discard_byte(&mut self) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Run a command sequence with chip select asserted.
    ///
    /// Chip select is always deasserted, even if an error occurred in `f`.
    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut SdSpiBusy<SPI, CS>) -> Result<R, Error>,
    {
        let mut busy = SdSpiBusy::new(&mut self.spi, &mut self.cs)?;
        f(&mut busy)
    }

    /// The wire address for `start`: standard-capacity cards are
    /// byte-addressed, high-capacity cards sector-addressed.
    fn address(&self, start: SectorIdx) -> Result<u32, Error> {
        let card = self.card.as_ref().ok_or(Error::NotInitialized)?;
        Ok(match card.info.capacity_class {
            CapacityClass::Standard => start.0 * Sector::LEN as u32,
            CapacityClass::High => start.0,
        })
    }

    fn acquire(&mut self) -> Result<AcquiredCard, Error> {
        trace!("Reset card..");

        // Supply minimum of 74 clock cycles without CS asserted.
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        for _ in 0..10 {
            self.discard_byte()?;
        }

        let require_crc = self.options.require_crc;
        let bus_clock_hz = self.options.bus_clock_hz;
        let mut busy = SdSpiBusy::new(&mut self.spi, &mut self.cs)?;

        // Enter SPI mode
        let mut delay = Delay::new();
        let mut attempts = 32;
        while attempts > 0 {
            trace!("Enter SPI mode, attempt: {}..", 32i32 - attempts);
            match busy.card_command(CMD0, 0) {
                Err(Error::TimeoutCommand(0)) => {
                    // Try again?
                    warn!("Timed out, trying again..");
                    attempts -= 1;
                }
                Err(e) => {
                    return Err(e);
                }
                Ok(r) if r == R1::IDLE_STATE.bits() => {
                    break;
                }
                Ok(r) => {
                    // Try again
                    warn!("Got response: {:x}, trying again..", r);
                }
            }

            delay.delay(Error::TimeoutCommand(CMD0))?;
        }
        if attempts == 0 {
            return Err(Error::CardNotFound);
        }

        // Enable CRC
        debug!("Enable CRC: {}", require_crc);
        if busy.card_command(CMD59, 1)? != R1::IDLE_STATE.bits() && require_crc {
            return Err(Error::CantEnableCrc);
        }

        // Check the interface conditions. A card that rejects CMD8 as
        // illegal is a v1 (standard-capacity only) card; a card that
        // answers but does not echo the check pattern is incompatible.
        let mut capacity_class = CapacityClass::Standard;
        let r1 = R1::from_bits_truncate(busy.card_command(CMD8, CMD8_CHECK_PATTERN)?);
        let v2_card = if r1.contains(R1::ILLEGAL_COMMAND) {
            false
        } else {
            busy.receive()?;
            busy.receive()?;
            busy.receive()?;
            let echo = busy.receive()?;
            if echo != (CMD8_CHECK_PATTERN & 0xFF) as u8 {
                return Err(Error::VoltageMismatch);
            }
            true
        };
        debug!("Card answers CMD8: {}", v2_card);

        // Start initialization, announcing high-capacity support to cards
        // that can take it.
        let arg = if v2_card { ACMD41_HCS } else { 0 };
        let mut delay = Delay::new();
        while busy.card_acmd(ACMD41, arg)? != R1::READY_STATE.bits() {
            delay.delay(Error::TimeoutACommand(ACMD41))?;
        }

        // Capture the operating-conditions register. The CCS bit tells us
        // whether the card is sector-addressed.
        let r1 = R1::from_bits_truncate(busy.card_command(CMD58, 0)?);
        if r1.contains(R1::ILLEGAL_COMMAND) {
            return Err(Error::IllegalCommand(CMD58));
        }
        if r1 != R1::READY_STATE {
            return Err(Error::RegisterReadError);
        }
        let mut ocr = 0u32;
        for _ in 0..4 {
            ocr = (ocr << 8) | u32::from(busy.receive()?);
        }
        if v2_card && (ocr & OCR_CCS) != 0 {
            capacity_class = CapacityClass::High;
        }
        debug!("OCR: {:08x}, class: {:?}", ocr, capacity_class);

        // Capture the CSD and derive the capacity, exactly once.
        if busy.card_command(CMD9, 0)? != R1::READY_STATE.bits() {
            return Err(Error::RegisterReadError);
        }
        let mut raw_csd = [0u8; 16];
        busy.read_data(&mut raw_csd)?;
        let csd = Csd::parse(raw_csd).map_err(Error::UnsupportedCsdVersion)?;

        let num_sectors = csd.num_sectors();
        if num_sectors == SectorCount(0) {
            return Err(Error::ZeroCapacity);
        }
        debug!("Card has {} sectors", num_sectors.0);

        Ok(AcquiredCard {
            info: CardInfo {
                num_sectors,
                capacity_class,
                interface: "sd-spi",
                clock_hz: bus_clock_hz,
            },
            ocr,
            csd,
        })
    }
}

impl<SPI, CS, DETECT> BlockDevice for SdSpi<SPI, CS, DETECT>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DETECT: InputPin,
{
    type Error = Error;

    /// Initializes the card into a known state. Any previous card state is
    /// discarded first, so this is also how a re-inserted card comes back.
    fn init(&mut self) -> Result<CardInfo, Self::Error> {
        self.card = None;
        let result = self.acquire();
        // One trailing clock with CS high lets the card release the bus.
        let _ = self.discard_byte();
        let card = result?;
        self.card = Some(card);
        Ok(card.info)
    }

    /// Read one or more sectors, starting at the given sector index.
    fn read_sectors(
        &mut self,
        start: SectorIdx,
        sectors: &mut [Sector],
    ) -> Result<(), Self::Error> {
        let address = self.address(start)?;
        self.with_chip_select(|s| {
            if sectors.len() == 1 {
                // Start a single-sector read
                s.card_command(CMD17, address)?;
                s.read_data(&mut sectors[0].contents)?;
            } else {
                // Start a multi-sector read
                s.card_command(CMD18, address)?;
                for sector in sectors.iter_mut() {
                    s.read_data(&mut sector.contents)?;
                }
                // Stop the read
                s.card_command(CMD12, 0)?;
            }
            Ok(())
        })
    }

    /// Write one or more sectors, starting at the given sector index.
    ///
    /// The busy line only reports that programming finished, not that it
    /// succeeded, so every write ends with a status query.
    fn write_sectors(&mut self, start: SectorIdx, sectors: &[Sector]) -> Result<(), Self::Error> {
        let address = self.address(start)?;
        self.with_chip_select(|s| {
            if sectors.len() == 1 {
                // Start a single-sector write
                s.card_command(CMD24, address)?;
                s.write_data(DATA_START_TOKEN, &sectors[0].contents)?;
            } else {
                // Start a multi-sector write
                s.card_command(CMD25, address)?;
                for sector in sectors.iter() {
                    s.wait_not_busy()?;
                    s.write_data(WRITE_MULTIPLE_TOKEN, &sector.contents)?;
                }
                // Stop the write
                s.wait_not_busy()?;
                s.send(STOP_TRAN_TOKEN)?;
            }
            s.wait_not_busy()?;
            if s.card_command(CMD13, 0)? != 0x00 {
                return Err(Error::WriteError);
            }
            if s.receive()? != 0x00 {
                return Err(Error::WriteError);
            }
            Ok(())
        })
    }

    /// Wait for any in-flight programming to complete.
    fn sync(&mut self) -> Result<(), Self::Error> {
        if self.card.is_none() {
            return Err(Error::NotInitialized);
        }
        self.with_chip_select(|s| s.wait_not_busy())
    }

    /// Sample the card-detect pin.
    fn card_present(&mut self) -> bool {
        let level = if self.options.detect_active_low {
            self.detect.is_low()
        } else {
            self.detect.is_high()
        };
        level.unwrap_or(false)
    }
}

#[cfg(test)]
mod test;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
