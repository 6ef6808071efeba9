use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};

use super::proto::*;
use super::{Delay, Error};

/// How many filler bytes we will clock past while waiting for a command
/// response. The protocol minimum (Ncr) is 8 bytes, but real cards have
/// been seen to need a window several times larger than that, so this is
/// deliberately generous.
const NCR_WINDOW: usize = 512;

/// A struct used to ensure that communication only occurs
/// when CS is low.
///
/// This struct is responsible for ensuring that all SPI, CRC, and
/// other communication-layer functionalities are performed correctly.
pub struct SdSpiBusy<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: &'spi mut SPI,
    cs: &'cs mut CS,
}

impl<'spi, 'cs, SPI, CS> Drop for SdSpiBusy<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    fn drop(&mut self) {
        self.cs_high().ok();
    }
}

impl<'spi, 'cs, SPI, CS> SdSpiBusy<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    pub fn new(spi: &'spi mut SPI, cs: &'cs mut CS) -> Result<Self, Error> {
        let mut me = Self { spi, cs };
        me.cs_low()?;
        Ok(me)
    }

    fn cs_high(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::GpioError)
    }

    fn cs_low(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::GpioError)
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Spin until the card stops holding the data line low, or we spin too
    /// many times and timeout. The card signals programming in progress by
    /// holding the line low.
    pub fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut delay = Delay::new();
        loop {
            let s = self.receive()?;
            if s == 0xFF {
                break;
            }
            delay.delay(Error::TimeoutWaitNotBusy)?;
        }
        Ok(())
    }

    /// Perform a command: a 6-byte frame of command code, 32-bit big-endian
    /// argument and CRC7 with the stop bit, then poll the Ncr window for a
    /// status byte with the top bit clear.
    pub fn card_command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.wait_not_busy()?;
        let mut buf = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        buf[5] = crc7(&buf[0..5]);

        for b in buf.iter() {
            self.send(*b)?;
        }

        // The card's read pipeline is mid-flight when the stop command goes
        // out, so one junk byte follows it before the response window.
        if command == CMD12 {
            let _junk = self.receive()?;
        }

        for _ in 0..NCR_WINDOW {
            let result = self.receive()?;
            if R1::is_response(result) {
                return Ok(result);
            }
        }

        Err(Error::TimeoutCommand(command))
    }

    /// Perform an application-specific command.
    pub fn card_acmd(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.card_command(CMD55, 0)?;
        self.card_command(command, arg)
    }

    /// Read one data payload from the card. Always fills the given buffer,
    /// so make sure it's the right size.
    ///
    /// The CRC-16 is folded in byte-by-byte as the payload crosses the bus;
    /// a mismatch with the trailing two bytes is a data-integrity error,
    /// distinct from a protocol error.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        // Get first non-FF byte.
        let mut delay = Delay::new();
        let status = loop {
            let s = self.receive()?;
            if s != 0xFF {
                break s;
            }
            delay.delay(Error::TimeoutReadBuffer)?;
        };
        if status != DATA_START_TOKEN {
            return Err(Error::ReadError);
        }

        let mut crc = Crc16::new();
        for b in buffer.iter_mut() {
            let byte = self.receive()?;
            crc.update(byte);
            *b = byte;
        }

        let mut received = u16::from(self.receive()?);
        received <<= 8;
        received |= u16::from(self.receive()?);

        let computed = crc.get();
        if received != computed {
            return Err(Error::Crc { received, computed });
        }

        Ok(())
    }

    /// Write one data payload to the card, preceded by `token` and followed
    /// by the CRC-16, folded in as the bytes go out.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        self.send(token)?;
        let mut crc = Crc16::new();
        for &b in buffer.iter() {
            crc.update(b);
            self.send(b)?;
        }
        let crc = crc.get();
        self.send((crc >> 8) as u8)?;
        self.send(crc as u8)?;
        let status = self.receive()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            Err(Error::WriteError)
        } else {
            Ok(())
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
