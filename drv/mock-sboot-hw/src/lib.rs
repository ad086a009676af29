// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated boot hardware.
//!
//! Host-side stand-ins for the FRAM chip, the dual-bank flash, the hash
//! accelerator and the SoC, with knobs for injecting the failures the boot
//! core has to survive. Nothing here is built for the target.

use drv_sboot_api::{FlashLayout, Region};
use embedded_hal::blocking::delay::DelayMs;

pub mod flash;
pub mod fram;
pub mod hash;
pub mod platform;

pub use flash::SimFlash;
pub use fram::{MemStore, SimFm25};
pub use hash::SimHashAccelerator;
pub use platform::{PlatformEvent, SimNscHooks, SimPlatform};

const KIB: u32 = 1024;

/// A shrunken version of the board layout: same shape, 16 KiB banks, so
/// whole-bank hashing stays quick in tests.
pub const SMALL_LAYOUT: FlashLayout = FlashLayout {
    base: 0x0c00_0000,
    bank_size: 16 * KIB,
    trusted: Region {
        offset: 0,
        size: 6 * KIB,
    },
    nsc: Region {
        offset: 6 * KIB,
        size: 2 * KIB,
    },
    untrusted: Region {
        offset: 8 * KIB,
        size: 8 * KIB,
    },
    program_granule: 16,
    sector_size: KIB,
};

/// Deterministic filler for a firmware image.
pub fn image(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct SimDelay {
    total: u32,
}

impl SimDelay {
    pub fn total_ms(&self) -> u32 {
        self.total
    }
}

impl DelayMs<u8> for SimDelay {
    fn delay_ms(&mut self, ms: u8) {
        self.total += u32::from(ms);
    }
}
