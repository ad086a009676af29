// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A hash accelerator that takes a few polls to finish and can be told to
//! misbehave.

use std::collections::VecDeque;

use drv_sboot_api::{BootError, CryptoHashEngine, Sha256Digest};
use sha2::{Digest, Sha256};

pub struct SimHashAccelerator {
    hasher: Option<Sha256>,
    latency: u32,
    remaining: u32,
    start_faults: VecDeque<BootError>,
    stalled: bool,
    starts: usize,
}

impl Default for SimHashAccelerator {
    fn default() -> Self {
        Self::new(2)
    }
}

impl SimHashAccelerator {
    /// `latency` is the number of `WouldBlock`s `finish` returns first.
    pub fn new(latency: u32) -> Self {
        Self {
            hasher: None,
            latency,
            remaining: 0,
            start_faults: VecDeque::new(),
            stalled: false,
            starts: 0,
        }
    }

    /// Queues an error for a future `start`.
    pub fn fail_start(&mut self, e: BootError) {
        self.start_faults.push_back(e);
    }

    /// `finish` never completes.
    pub fn stall(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    pub fn starts(&self) -> usize {
        self.starts
    }
}

impl CryptoHashEngine for SimHashAccelerator {
    const WORD_SIZE: usize = 4;

    fn start(&mut self) -> Result<(), BootError> {
        self.starts += 1;
        if let Some(e) = self.start_faults.pop_front() {
            return Err(e);
        }
        self.hasher = Some(Sha256::new());
        self.remaining = self.latency;
        Ok(())
    }

    fn feed(&mut self, data: &[u8]) -> Result<(), BootError> {
        let h = self.hasher.as_mut().ok_or(BootError::ParameterInvalid)?;
        h.update(data);
        Ok(())
    }

    fn finish(&mut self) -> nb::Result<Sha256Digest, BootError> {
        if self.hasher.is_none() {
            return Err(nb::Error::Other(BootError::ParameterInvalid));
        }
        if self.stalled || self.remaining > 0 {
            self.remaining = self.remaining.saturating_sub(1);
            return Err(nb::Error::WouldBlock);
        }
        let h = self.hasher.take().ok_or(nb::Error::WouldBlock)?;
        Ok(h.finalize().into())
    }
}
