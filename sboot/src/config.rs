// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board configuration, generated from `boot.toml` by the build script.

use drv_sboot_api::{EcdsaPublicKey, FlashLayout, Region, SchemaVersion};

/// What to do after a recoverable fault.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapPolicy {
    /// Toggle the bank swap option and reset.
    Reset,
    /// Stop where we are; for boards on a debugger.
    Halt,
}

include!(concat!(env!("OUT_DIR"), "/consts.rs"));

static_assertions::const_assert!(LOG_RING_SIZE.is_power_of_two());
static_assertions::const_assert!(FRAM_SIZE >= 512);

/// The knobs the boot path runs with.
#[derive(Copy, Clone, Debug)]
pub struct Settings {
    pub compiled: SchemaVersion,
    pub layout: FlashLayout,
    pub fram_size: usize,
    pub signing_key: EcdsaPublicKey,
    pub suspend_tick: bool,
    pub swap_policy: SwapPolicy,
}

impl Settings {
    pub const BOARD: Self = Self {
        compiled: COMPILED_VERSION,
        layout: FLASH_LAYOUT,
        fram_size: FRAM_SIZE,
        signing_key: SIGNING_KEY,
        suspend_tick: SUSPEND_SECURE_TICK,
        swap_policy: SWAP_POLICY,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_layout_is_consistent() {
        assert_eq!(FLASH_LAYOUT.validate(4), Ok(()));
    }
}
