// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State kept in RAM across a reset.
//!
//! Retained RAM holds garbage after a power cycle, so the state is framed by
//! a header with a magic and a version; anything else reads as "cold boot".

use drv_sboot_api::BootError;
use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

pub const RETAINED_MAGIC: [u8; 8] = *b"SBOOTRAM";
pub const RETAINED_VERSION: u16 = 1;

#[derive(Serialize, Deserialize, SerializedSize)]
struct RetainedHeader {
    magic: [u8; 8],
    version: u16,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub struct RetainedState {
    /// Set on entry to the crash handler, cleared at handoff.
    pub in_crash_handler: bool,
    /// Error code of the fault that last entered the crash handler.
    pub last_fault: Option<u8>,
    /// Warm resets seen since the last power cycle.
    pub warm_resets: u32,
}

impl RetainedState {
    /// Bytes of retained RAM needed.
    pub const SIZE: usize = RetainedHeader::MAX_SIZE + Self::MAX_SIZE;

    /// `None` if `buf` doesn't hold a state we wrote.
    pub fn load(buf: &[u8]) -> Option<Self> {
        let (header, rest) =
            hubpack::deserialize::<RetainedHeader>(buf).ok()?;
        if header.magic != RETAINED_MAGIC || header.version != RETAINED_VERSION
        {
            return None;
        }
        let (state, _) = hubpack::deserialize::<Self>(rest).ok()?;
        Some(state)
    }

    pub fn store(&self, buf: &mut [u8]) -> Result<(), BootError> {
        if buf.len() < Self::SIZE {
            return Err(BootError::ParameterInvalid);
        }
        let header = RetainedHeader {
            magic: RETAINED_MAGIC,
            version: RETAINED_VERSION,
        };
        let n = hubpack::serialize(buf, &header)
            .map_err(|_| BootError::ParameterInvalid)?;
        hubpack::serialize(&mut buf[n..], self)
            .map_err(|_| BootError::ParameterInvalid)?;
        Ok(())
    }

    /// Wipes the buffer, marker included.
    pub fn clear(buf: &mut [u8]) {
        buf.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_a_warm_reset() {
        let mut ram = [0u8; 64];
        let s = RetainedState {
            in_crash_handler: true,
            last_fault: Some(7),
            warm_resets: 3,
        };
        s.store(&mut ram).unwrap();
        assert_eq!(RetainedState::load(&ram), Some(s));
    }

    #[test]
    fn power_on_garbage_reads_as_cold() {
        assert_eq!(RetainedState::load(&[0xa5; 64]), None);
        assert_eq!(RetainedState::load(&[0; 64]), None);

        let mut ram = [0u8; 64];
        RetainedState::default().store(&mut ram).unwrap();
        ram[8] ^= 0xff; // version
        assert_eq!(RetainedState::load(&ram), None);
    }

    #[test]
    fn clear_removes_the_marker() {
        let mut ram = [0u8; 64];
        RetainedState::default().store(&mut ram).unwrap();
        RetainedState::clear(&mut ram);
        assert_eq!(RetainedState::load(&ram), None);
    }

    #[test]
    fn too_small_a_buffer() {
        let mut ram = [0u8; 4];
        assert_eq!(
            RetainedState::default().store(&mut ram),
            Err(BootError::ParameterInvalid)
        );
    }
}
