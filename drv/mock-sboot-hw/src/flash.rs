// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated dual-bank internal flash.

use std::ops::Range;

use drv_sboot_api::{BootError, FlashController, FlashLayout};

/// Both banks as seen through the address map: the executing bank at
/// `layout.base`, the other right after it.
pub struct SimFlash {
    layout: FlashLayout,
    mem: Vec<u8>,
    locked: bool,
    fault: Option<BootError>,
    programs: Vec<Range<u32>>,
    erases: Vec<u32>,
}

impl SimFlash {
    /// Fully erased, locked flash.
    pub fn new(layout: FlashLayout) -> Self {
        Self {
            layout,
            mem: vec![0xff; 2 * layout.bank_size as usize],
            locked: true,
            fault: None,
            programs: Vec::new(),
            erases: Vec::new(),
        }
    }

    fn index(&self, addr: u32, len: usize) -> Result<Range<usize>, BootError> {
        let start = addr
            .checked_sub(self.layout.base)
            .ok_or(BootError::AddressOutOfRange)? as usize;
        let end = start + len;
        if end > self.mem.len() {
            return Err(BootError::AddressOutOfRange);
        }
        Ok(start..end)
    }

    /// Writes straight into the array, as a programmer fixture would.
    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let r = self.index(addr, data.len()).unwrap();
        self.mem[r].copy_from_slice(data);
    }

    pub fn bytes(&self, addr: u32, len: usize) -> &[u8] {
        let r = self.index(addr, len).unwrap();
        &self.mem[r]
    }

    /// Flips the low bit of one byte.
    pub fn corrupt(&mut self, addr: u32) {
        let r = self.index(addr, 1).unwrap();
        self.mem[r.start] ^= 0x01;
    }

    /// What a reset with the swap option toggled does to the address map.
    pub fn swap_banks(&mut self) {
        self.mem.rotate_left(self.layout.bank_size as usize);
        self.locked = true;
    }

    /// The next erase or program fails with `e`.
    pub fn fail_next(&mut self, e: BootError) {
        self.fault = Some(e);
    }

    pub fn programmed(&self) -> &[Range<u32>] {
        &self.programs
    }

    pub fn erased(&self) -> &[u32] {
        &self.erases
    }

    pub fn clear_history(&mut self) {
        self.programs.clear();
        self.erases.clear();
    }
}

impl FlashController for SimFlash {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), BootError> {
        let r = self.index(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[r]);
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), BootError> {
        self.locked = false;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), BootError> {
        self.locked = true;
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.locked
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), BootError> {
        if self.locked {
            return Err(BootError::LockStateError);
        }
        if let Some(e) = self.fault.take() {
            return Err(e);
        }
        if addr.wrapping_sub(self.layout.base) % self.layout.sector_size != 0 {
            return Err(BootError::AlignmentViolation);
        }
        let r = self.index(addr, self.layout.sector_size as usize)?;
        self.mem[r].fill(0xff);
        self.erases.push(addr);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), BootError> {
        if self.locked {
            return Err(BootError::LockStateError);
        }
        if let Some(e) = self.fault.take() {
            return Err(e);
        }
        let g = self.layout.program_granule;
        if addr % g != 0 || data.len() % g as usize != 0 {
            return Err(BootError::AlignmentViolation);
        }
        let r = self.index(addr, data.len())?;
        if self.mem[r.clone()].iter().any(|b| *b != 0xff) {
            // Programming over unerased quad-words is a flash error.
            return Err(BootError::IoFailure);
        }
        self.mem[r].copy_from_slice(data);
        self.programs.push(addr..addr + data.len() as u32);
        Ok(())
    }
}
