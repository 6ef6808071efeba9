//! Host-side tests for the serial transport, driven by a model of a card
//! that parses command frames off the bus and answers from canned tables.

use std::collections::VecDeque;

use super::proto::{self, crc16};
use super::{Error, SdSpi, SdSpiOptions};
use crate::block_device::{BlockDevice, CapacityClass, Sector, SectorCount, SectorIdx};

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::{InputPin, OutputPin};

/// CSD captured from a 32 GB card.
const CSD_32GB: [u8; 16] = hex_literal::hex!("400e00325b590000edc87f800a404001");

struct FakeCs;

impl OutputPin for FakeCs {
    type Error = ();
    fn set_low(&mut self) -> Result<(), ()> {
        Ok(())
    }
    fn set_high(&mut self) -> Result<(), ()> {
        Ok(())
    }
}

struct FakeDetect(bool);

impl InputPin for FakeDetect {
    type Error = ();
    fn is_high(&self) -> Result<bool, ()> {
        Ok(!self.0)
    }
    fn is_low(&self) -> Result<bool, ()> {
        Ok(self.0)
    }
}

/// What the model should do differently from a healthy card.
#[derive(Default)]
struct Quirks {
    bad_cmd8_echo: bool,
    csd: Option<[u8; 16]>,
    corrupt_read_crc: bool,
    fail_write_status: bool,
}

struct FakeCard {
    replies: VecDeque<u8>,
    frame: Vec<u8>,
    quirks: Quirks,
    sector: [u8; 512],
    commands: Vec<u8>,
    write_capture: Option<Vec<u8>>,
    write_arg: u32,
    written: Vec<(u32, Vec<u8>)>,
}

impl FakeCard {
    fn new(quirks: Quirks) -> Self {
        let mut sector = [0u8; 512];
        for (i, b) in sector.iter_mut().enumerate() {
            *b = i as u8;
        }
        FakeCard {
            replies: VecDeque::new(),
            frame: Vec::new(),
            quirks,
            sector,
            commands: Vec::new(),
            write_capture: None,
            write_arg: 0,
            written: Vec::new(),
        }
    }

    fn push_payload(&mut self, payload: &[u8], corrupt: bool) {
        // A couple of filler bytes ahead of the start token, like a card
        // that needs a moment.
        self.replies.push_back(0xFF);
        self.replies.push_back(0xFF);
        self.replies.push_back(proto::DATA_START_TOKEN);
        self.replies.extend(payload.iter().cloned());
        let mut crc = crc16(payload);
        if corrupt {
            crc ^= 0x0001;
        }
        self.replies.push_back((crc >> 8) as u8);
        self.replies.push_back(crc as u8);
    }

    fn handle_command(&mut self, cmd: u8, arg: u32) {
        self.commands.push(cmd);
        match cmd {
            proto::CMD0 | proto::CMD59 | proto::CMD55 => self.replies.push_back(0x01),
            proto::CMD8 => {
                self.replies.push_back(0x01);
                let echo = if self.quirks.bad_cmd8_echo { 0x55 } else { 0xAA };
                self.replies.extend([0x00, 0x00, 0x01, echo]);
            }
            proto::ACMD41 => self.replies.push_back(0x00),
            proto::CMD58 => {
                self.replies.push_back(0x00);
                // Powered up, CCS set: a sector-addressed card.
                self.replies.extend([0xC0, 0xFF, 0x80, 0x00]);
            }
            proto::CMD9 => {
                self.replies.push_back(0x00);
                let csd = self.quirks.csd.unwrap_or(CSD_32GB);
                self.push_payload(&csd, false);
            }
            proto::CMD17 => {
                assert_eq!(arg, 42, "sector-addressed read of sector 42");
                self.replies.push_back(0x00);
                let payload = self.sector;
                let corrupt = self.quirks.corrupt_read_crc;
                self.push_payload(&payload, corrupt);
            }
            proto::CMD18 => {
                assert_eq!(arg, 42, "sector-addressed read starting at 42");
                self.replies.push_back(0x00);
                // Two sectors queued; the host must stop with CMD12.
                for idx in 0..2u8 {
                    let mut payload = self.sector;
                    payload[0] = idx;
                    self.push_payload(&payload, false);
                }
            }
            proto::CMD12 => {
                // One stuff byte precedes the stop response.
                self.replies.push_back(0xFF);
                self.replies.push_back(0x00);
            }
            proto::CMD24 => {
                self.replies.push_back(0x00);
                self.write_arg = arg;
                self.write_capture = Some(Vec::new());
            }
            proto::CMD13 => {
                self.replies.push_back(0x00);
                let status = if self.quirks.fail_write_status { 0x02 } else { 0x00 };
                self.replies.push_back(status);
            }
            _ => panic!("model got unexpected CMD{}", cmd),
        }
    }

    fn exchange(&mut self, out: u8) -> u8 {
        let reply = self.replies.pop_front().unwrap_or(0xFF);
        if let Some(mut capture) = self.write_capture.take() {
            // A write payload in flight: token, 512 data bytes, CRC16.
            // The host clocks 0xFF filler (Ncr polling, inter-byte gaps)
            // before the start token; capture begins at the first
            // non-filler byte.
            if !capture.is_empty() || out != 0xFF {
                capture.push(out);
            }
            if capture.len() == 1 + 512 + 2 {
                assert_eq!(capture[0], proto::DATA_START_TOKEN);
                let payload = capture[1..513].to_vec();
                let received = u16::from(capture[513]) << 8 | u16::from(capture[514]);
                assert_eq!(received, crc16(&payload), "write payload carried a bad CRC16");
                self.written.push((self.write_arg, payload));
                self.replies.push_back(proto::DATA_RES_ACCEPTED);
            } else {
                self.write_capture = Some(capture);
            }
            return reply;
        }
        if self.frame.is_empty() {
            // Outside a frame, anything that isn't filler starts one.
            if out != 0xFF {
                self.frame.push(out);
            }
        } else {
            self.frame.push(out);
            if self.frame.len() == 6 {
                let cmd = self.frame[0] & 0x3F;
                let arg = u32::from_be_bytes([
                    self.frame[1],
                    self.frame[2],
                    self.frame[3],
                    self.frame[4],
                ]);
                assert_eq!(
                    self.frame[5],
                    proto::crc7(&self.frame[0..5]),
                    "CMD{} frame carried a bad CRC7",
                    cmd
                );
                self.frame.clear();
                self.handle_command(cmd, arg);
            }
        }
        reply
    }
}

impl Transfer<u8> for FakeCard {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        for word in words.iter_mut() {
            *word = self.exchange(*word);
        }
        Ok(words)
    }
}

fn driver(quirks: Quirks) -> SdSpi<FakeCard, FakeCs, FakeDetect> {
    SdSpi::new_with_options(
        FakeCard::new(quirks),
        FakeCs,
        FakeDetect(true),
        SdSpiOptions::default(),
    )
}

#[test]
fn init_discovers_capacity() {
    let mut sd = driver(Quirks::default());
    let info = sd.init().unwrap();
    assert_eq!(info.capacity_class, CapacityClass::High);
    assert_eq!(info.num_sectors, SectorCount((0xEDC8 + 1) * 1024));
    assert_eq!(info.interface, "sd-spi");
    assert_eq!(sd.ocr(), Some(0xC0FF_8000));
    assert!(sd.erase_single_block_enabled().unwrap());
}

#[test]
fn single_sector_read() {
    let mut sd = driver(Quirks::default());
    sd.init().unwrap();
    let sector = sd.read_sector(SectorIdx(42)).unwrap();
    assert_eq!(sector.contents[0], 0);
    assert_eq!(sector.contents[255], 255);
    assert_eq!(sector.contents[511], 255);
}

#[test]
fn multi_sector_read_sends_stop() {
    let mut sd = driver(Quirks::default());
    sd.init().unwrap();

    let mut sectors = [Sector::new(), Sector::new()];
    sd.read_sectors(SectorIdx(42), &mut sectors).unwrap();
    assert_eq!(sectors[0].contents[0], 0);
    assert_eq!(sectors[1].contents[0], 1);
    assert_eq!(sectors[0].contents[10], 10);

    let (card, _cs, _detect) = sd.free();
    assert!(card.commands.contains(&proto::CMD18));
    assert!(card.commands.contains(&proto::CMD12));
    assert!(!card.commands.contains(&proto::CMD17));
}

#[test]
fn single_sector_write_confirms_status() {
    let mut sd = driver(Quirks::default());
    sd.init().unwrap();

    let mut sector = Sector::new();
    for (i, b) in sector.contents.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(3);
    }
    sd.write_sectors(SectorIdx(7), core::slice::from_ref(&sector)).unwrap();

    let (card, _cs, _detect) = sd.free();
    assert_eq!(card.written.len(), 1);
    assert_eq!(card.written[0].0, 7);
    assert_eq!(card.written[0].1[..], sector.contents[..]);
    // The busy poll alone does not confirm the write; CMD13 must follow.
    assert!(card.commands.contains(&proto::CMD24));
    assert!(card.commands.contains(&proto::CMD13));
}

#[test]
fn write_rejected_by_status_query() {
    let mut sd = driver(Quirks {
        fail_write_status: true,
        ..Quirks::default()
    });
    sd.init().unwrap();

    let sector = Sector::new();
    assert_eq!(
        sd.write_sectors(SectorIdx(7), core::slice::from_ref(&sector)).unwrap_err(),
        Error::WriteError
    );
}

#[test]
fn crc_mismatch_is_reported() {
    let mut sd = driver(Quirks {
        corrupt_read_crc: true,
        ..Quirks::default()
    });
    sd.init().unwrap();
    match sd.read_sector(SectorIdx(42)) {
        Err(Error::Crc { received, computed }) => {
            assert_eq!(received ^ computed, 0x0001);
        }
        other => panic!("expected CRC error, got {:?}", other),
    }
}

#[test]
fn cmd8_echo_mismatch_fails_init() {
    let mut sd = driver(Quirks {
        bad_cmd8_echo: true,
        ..Quirks::default()
    });
    assert_eq!(sd.init().unwrap_err(), Error::VoltageMismatch);
    assert!(sd.card_info().is_none());
}

#[test]
fn unsupported_csd_version_fails_init() {
    let mut csd = [0u8; 16];
    csd[0] = 0x80;
    let mut sd = driver(Quirks {
        csd: Some(csd),
        ..Quirks::default()
    });
    assert_eq!(sd.init().unwrap_err(), Error::UnsupportedCsdVersion(2));
}

#[test]
fn io_before_init_is_rejected() {
    let mut sd = driver(Quirks::default());
    assert_eq!(sd.read_sector(SectorIdx(0)).unwrap_err(), Error::NotInitialized);
    assert_eq!(
        sd.write_sectors(SectorIdx(0), &[Sector::new()]).unwrap_err(),
        Error::NotInitialized
    );
    assert_eq!(sd.sync().unwrap_err(), Error::NotInitialized);
}

#[test]
fn detect_pin_reports_presence() {
    let mut sd = driver(Quirks::default());
    assert!(sd.card_present());
}
