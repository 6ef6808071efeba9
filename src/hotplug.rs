//! embedded-datalog - hotplug lifecycle manager
//!
//! A polling state machine that drives a [`BlockDevice`] through insertion
//! detection, power-up, initialization and a self-test, then announces
//! "card online" / "card offline" to its owner. Everything above this
//! layer only learns that the device became unavailable and later
//! available again; physical card churn stays contained here.
//!
//! The machine is paced externally: the owner calls [`poll`](Hotplug::poll)
//! at a fixed cadence, and every delay in here is counted in polls, not
//! wall-clock time.

use crate::block_device::{BlockDevice, CardInfo, SectorIdx};

#[cfg(feature = "log")]
use log::{debug, info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, info, warn};

/// The lifecycle states. I/O against the card is only permitted in
/// `Verifying` and `Operational`.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HotplugState {
    /// No card in the socket.
    NoCard,
    /// The presence pin reads inserted; waiting for the reading to hold.
    MaybeCard,
    /// Card confirmed present; letting the supply settle.
    PowerUp,
    /// Running the card initialization sequence.
    InitCard,
    /// Initialized; running the read/write self-test.
    Verifying,
    /// Card fully online and announced to the owner.
    Operational,
}

/// Lifecycle notifications, delivered to the owner exactly once per
/// insertion cycle (plus one `init_failed` per failed attempt).
pub trait HotplugHooks {
    /// The card passed its self-test and is ready for I/O.
    fn card_online(&mut self, info: &CardInfo);

    /// The card went away (or failed for good); stop all I/O.
    fn card_offline(&mut self);

    /// An initialization attempt failed; a status indication (e.g. an LED
    /// pattern) can be driven from here between retries.
    fn init_failed(&mut self, attempt: u8) {
        let _ = attempt;
    }
}

/// Tuning for the polling state machine, all counted in polls.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub struct HotplugConfig {
    /// Consecutive present samples before an insertion is trusted.
    pub debounce_polls: u8,
    /// Polls to wait after insertion for the card supply to settle.
    pub settle_polls: u8,
    /// Initialization attempts before giving up until re-insertion.
    pub max_init_attempts: u8,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        HotplugConfig {
            debounce_polls: 3,
            settle_polls: 5,
            max_init_attempts: 4,
        }
    }
}

/// The hotplug lifecycle manager. Owns the block device; the owner reaches
/// the device through [`device`](Hotplug::device), which only answers while
/// the card is online.
pub struct Hotplug<BD, H>
where
    BD: BlockDevice,
    H: HotplugHooks,
{
    device: BD,
    hooks: H,
    config: HotplugConfig,
    state: HotplugState,
    counter: u8,
    attempts: u8,
    /// Set when the retry allowance is exhausted; the card is treated as
    /// absent until a poll actually samples it absent.
    gave_up: bool,
    info: Option<CardInfo>,
}

impl<BD, H> Hotplug<BD, H>
where
    BD: BlockDevice,
    H: HotplugHooks,
{
    /// Create a manager for this socket, using the default tuning.
    pub fn new(device: BD, hooks: H) -> Self {
        Self::new_with_config(device, hooks, HotplugConfig::default())
    }

    /// Create a manager for this socket with the given tuning.
    pub fn new_with_config(device: BD, hooks: H, config: HotplugConfig) -> Self {
        Hotplug {
            device,
            hooks,
            config,
            state: HotplugState::NoCard,
            counter: 0,
            attempts: 0,
            gave_up: false,
            info: None,
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> HotplugState {
        self.state
    }

    /// The live device, while the card is online.
    pub fn device(&mut self) -> Option<&mut BD> {
        match self.state {
            HotplugState::Operational => Some(&mut self.device),
            _ => None,
        }
    }

    /// What the last successful initialization found.
    pub fn card_info(&self) -> Option<&CardInfo> {
        self.info.as_ref()
    }

    /// Nondestructive read/write self-test: read a sector, write the same
    /// bytes back, read again and compare. `Ok(false)` means the bytes did
    /// not survive the round trip.
    fn self_test(&mut self) -> Result<bool, BD::Error> {
        let original = self.device.read_sector(SectorIdx(0))?;
        self.device
            .write_sectors(SectorIdx(0), core::slice::from_ref(&original))?;
        self.device.sync()?;
        let readback = self.device.read_sector(SectorIdx(0))?;
        Ok(readback.contents[..] == original.contents[..])
    }

    /// Run one step of the state machine. Call at a fixed cadence.
    ///
    /// Returns the state after the step, mostly useful for tests and
    /// status displays; the real outputs are the hook invocations.
    pub fn poll(&mut self) -> HotplugState {
        let present = self.device.card_present();

        // Removal wins from any state past NoCard.
        if !present && self.state != HotplugState::NoCard {
            if self.state == HotplugState::Operational {
                info!("Card removed, going offline");
                self.hooks.card_offline();
            }
            self.state = HotplugState::NoCard;
            self.info = None;
            self.counter = 0;
            self.attempts = 0;
            self.gave_up = false;
            return self.state;
        }

        self.state = match self.state {
            HotplugState::NoCard => {
                if !present {
                    // A genuine absence re-arms an exhausted socket.
                    self.gave_up = false;
                    HotplugState::NoCard
                } else if self.gave_up {
                    // Still the same seated card we gave up on.
                    HotplugState::NoCard
                } else {
                    self.counter = 1;
                    HotplugState::MaybeCard
                }
            }
            HotplugState::MaybeCard => {
                // Mechanical card-detect switches bounce; trust the pin
                // only after it holds across consecutive polls.
                self.counter += 1;
                if self.counter >= self.config.debounce_polls {
                    debug!("Card presence debounced");
                    self.counter = 0;
                    HotplugState::PowerUp
                } else {
                    HotplugState::MaybeCard
                }
            }
            HotplugState::PowerUp => {
                self.counter += 1;
                if self.counter >= self.config.settle_polls {
                    self.counter = 0;
                    self.attempts = 0;
                    HotplugState::InitCard
                } else {
                    HotplugState::PowerUp
                }
            }
            HotplugState::InitCard => match self.device.init() {
                Ok(info) => {
                    debug!(
                        "Card initialized: {} sectors on {}",
                        info.num_sectors.0, info.interface
                    );
                    self.info = Some(info);
                    HotplugState::Verifying
                }
                Err(e) => {
                    self.attempts += 1;
                    warn!("Init attempt {} failed: {:?}", self.attempts, e);
                    self.hooks.init_failed(self.attempts);
                    if self.attempts >= self.config.max_init_attempts {
                        // Give up until the card is physically cycled.
                        self.gave_up = true;
                        HotplugState::NoCard
                    } else {
                        HotplugState::InitCard
                    }
                }
            },
            HotplugState::Verifying => {
                let verdict = self.self_test();
                match verdict {
                    Ok(true) => {
                        // InitCard always stores the info before handing over.
                        if let Some(info) = self.info.as_ref() {
                            info!(
                                "Card online: {} MiB via {}",
                                info.capacity_bytes() / (1024 * 1024),
                                info.interface
                            );
                            self.hooks.card_online(info);
                        }
                        HotplugState::Operational
                    }
                    Ok(false) | Err(_) => {
                        self.attempts += 1;
                        if let Err(e) = verdict {
                            warn!("Self-test failed: {:?}", e);
                        } else {
                            warn!("Self-test readback mismatch");
                        }
                        self.hooks.init_failed(self.attempts);
                        if self.attempts >= self.config.max_init_attempts {
                            self.gave_up = true;
                            HotplugState::NoCard
                        } else {
                            HotplugState::InitCard
                        }
                    }
                }
            }
            HotplugState::Operational => HotplugState::Operational,
        };
        self.state
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
