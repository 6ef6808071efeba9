//! # embedded-datalog
//!
//! > A data-logging storage engine for Embedded Rust
//!
//! This crate carries high-rate telemetry from interrupt handlers on a
//! dual-core microcontroller all the way to numbered log files on a
//! removable SD card. It is written in pure-Rust, is `#![no_std]` and does
//! not use `alloc` or `collections` to keep the memory footprint low.
//!
//! The pieces, from the card upwards:
//!
//! * [`sd::SdSpi`] and [`sd::SdSdio`] drive SD and SDHC cards over SPI or
//!   a native 4-bit bus, both behind the [`BlockDevice`] trait.
//! * [`Hotplug`] wraps a [`BlockDevice`] in an insertion/removal state
//!   machine, so card churn never reaches the layers above.
//! * [`RingLog`] is the lock-light ring buffer producers on either core
//!   (including ISRs) append telemetry into.
//! * [`StorageAdapter`](fs::storage::StorageAdapter) binds a
//!   [`BlockDevice`] to an embedded filesystem's block callbacks, and
//!   [`LogFileController`] drains the ring into that filesystem in
//!   sync-boundary-sized write cycles.
//!
//! ## Using the crate
//!
//! ```rust,ignore
//! # struct DummySpi;
//! # struct DummyCsPin;
//! # struct DummyDetectPin;
//! static EVENTS: embedded_datalog::RingLog<4096> = embedded_datalog::RingLog::new();
//!
//! let mut card = embedded_datalog::SdSpi::new(spi, cs, detect);
//! let info = card.init()?;
//! let mut drain = EVENTS.claim_consumer().unwrap();
//! // ... mount the filesystem over a StorageAdapter, then from the
//! // drain task:
//! controller.poll(&mut fs, &mut drain, &mut clock);
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]
// #![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[macro_use]
mod structure;

pub mod block_device;
pub mod fs;
pub mod hotplug;
pub mod logfile;
pub mod ringlog;
pub mod sd;

pub use crate::block_device::{
    BlockDevice, CapacityClass, CardInfo, MemoryBlockDevice, Sector, SectorCount, SectorIdx,
};
pub use crate::fs::{storage::StorageAdapter, Filesystem};
pub use crate::hotplug::{Hotplug, HotplugConfig, HotplugHooks, HotplugState};
pub use crate::logfile::{
    ControllerConfig, ControllerStats, LogFileController, Monotonic, RotationHook,
};
pub use crate::ringlog::{Consumer, LogDrain, RingLog};
pub use crate::sd::Error as SdError;
pub use crate::sd::{SdSdio, SdSpi, SdioBus};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
