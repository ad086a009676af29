// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A driver for the Cypress/Infineon FM25CL64B SPI ferroelectric RAM (FRAM).
//!
//! The chip is 8 KiB with 13-bit addressing. Its status register carries the
//! write enable latch and the block-protect bits, and the BP bits are
//! themselves guarded by the WPEN bit together with the WP pin: with WPEN set
//! and WP low, the status register cannot be written. This driver keeps WP
//! low except while deliberately changing the protected range.
//!
//! See <https://www.infineon.com/dgdl/Infineon-FM25CL64B_64-Kbit_(8_K_8)_Serial_(SPI)_F-RAM-DataSheet-v13_00-EN.pdf>

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use drv_sboot_api::{BlockProtect, BootError, ByteStore};
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

/// The FRAM is not ready for commands until this long after power-up (tPU).
pub const POWER_UP_MS: u8 = 1;

/// A FM25CL64B on an SPI bus, with its chip select and write protect pins.
///
/// By default, the write enable latch on the FRAM is not set, so this type
/// cannot be written to. To write to the chip, first call
/// [`Fm25::write_enable`], which returns a [`WritableFram`].
#[must_use = "a Fm25 does nothing unless read from or written to"]
pub struct Fm25<SPI, CS, WP> {
    spi: SPI,
    cs: CS,
    wp: WP,
}

/// A FM25CL64B with its write enable latch set.
///
/// This type is returned by [`Fm25::write_enable`], and will unset the write
/// latch when it's dropped. This way, the FRAM remains in the write-protected
/// state when you're not actively trying to write to it.
#[must_use = "a WritableFram does nothing if constructed but not written to"]
pub struct WritableFram<'fram, SPI, CS, WP>(&'fram mut Fm25<SPI, CS, WP>)
where
    SPI: Write<u8> + Transfer<u8, Error = <SPI as Write<u8>>::Error>,
    BootError: From<<SPI as Write<u8>>::Error>,
    CS: OutputPin,
    WP: OutputPin;

/// Holds chip select asserted; releases it on drop.
struct Selected<'fram, SPI, CS: OutputPin> {
    spi: &'fram mut SPI,
    cs: &'fram mut CS,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Opcode {
    /// Set the write enable latch (WREN)
    SetWriteEn = 0b0000_0110,
    /// Reset the write enable latch (WRDI)
    ResetWriteEn = 0b0000_0100,
    /// Read the status register (RDSR)
    ReadStatus = 0b0000_0101,
    /// Write to the status register (WRSR)
    WriteStatus = 0b0000_0001,
    /// Read from memory (READ)
    Read = 0b0000_0011,
    /// Write to memory (WRITE)
    Write = 0b0000_0010,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Write enable latch
        const WEL = 1 << 1;
        /// Block protect 0
        const BP0 = 1 << 2;
        /// Block protect 1
        const BP1 = 1 << 3;
        /// Status register write protect enabled
        const WPEN = 1 << 7;
    }
}

impl Status {
    /// Bits that survive a WRSR.
    const WRITABLE: Status = Status::BP0.union(Status::BP1).union(Status::WPEN);

    pub fn block_protect(self) -> BlockProtect {
        match (self.contains(Status::BP1), self.contains(Status::BP0)) {
            (false, false) => BlockProtect::None,
            (false, true) => BlockProtect::UpperQuarter,
            (true, false) => BlockProtect::UpperHalf,
            (true, true) => BlockProtect::All,
        }
    }

    fn from_block_protect(protect: BlockProtect) -> Self {
        match protect {
            BlockProtect::None => Status::empty(),
            BlockProtect::UpperQuarter => Status::BP0,
            BlockProtect::UpperHalf => Status::BP1,
            BlockProtect::All => Status::BP0 | Status::BP1,
        }
    }
}

const KIB: usize = 1024;

impl<SPI, CS, WP> Fm25<SPI, CS, WP>
where
    SPI: Write<u8> + Transfer<u8, Error = <SPI as Write<u8>>::Error>,
    BootError: From<<SPI as Write<u8>>::Error>,
    CS: OutputPin,
    WP: OutputPin,
{
    /// The size in bytes of this FRAM chip.
    pub const SIZE: usize = 8 * KIB;

    /// The highest address in this FRAM chip's address space.
    pub const MAX_ADDR: usize = Self::SIZE - 1;

    /// Constructs a new driver, waiting out the chip's power-up time first.
    ///
    /// The write enable latch is always clear on power-up, but we may be
    /// constructed after a warm reset, so clear it here anyway.
    pub fn new(
        spi: SPI,
        cs: CS,
        wp: WP,
        delay: &mut impl DelayMs<u8>,
    ) -> Result<Self, BootError> {
        delay.delay_ms(POWER_UP_MS);

        let mut fram = Self { spi, cs, wp };
        fram.cs.set_high().map_err(|_| BootError::IoFailure)?;
        fram.wp.set_low().map_err(|_| BootError::IoFailure)?;
        fram.do_write_disable()?;
        Ok(fram)
    }

    /// Reads the status register.
    pub fn status(&mut self) -> Result<Status, BootError> {
        let mut sel = self.select()?;
        sel.write(&[Opcode::ReadStatus as u8])?;
        let mut buf = [0u8];
        sel.transfer(&mut buf)?;
        Ok(Status::from_bits_retain(buf[0]))
    }

    /// Set the write enable latch, returning a [`WritableFram`] type that
    /// unsets the write enable latch when it's dropped.
    ///
    /// This mutably borrows `self` so that only a single instance of
    /// `WritableFram` can exist for this FRAM chip at any time.
    pub fn write_enable(
        &mut self,
    ) -> Result<WritableFram<'_, SPI, CS, WP>, BootError> {
        self.do_write_enable()?;
        Ok(WritableFram(self))
    }

    /// Read bytes from the FRAM starting at `addr` into `buf`.
    ///
    /// Unlike the chip itself, this refuses to roll over the end of the
    /// address space: [`BootError::AddressOutOfRange`] instead.
    pub fn read(
        &mut self,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<(), BootError> {
        Self::bounds_check(addr, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let mut sel = self.start_rw_command(Opcode::Read, addr)?;
        buf.fill(0);
        sel.transfer(buf)?;
        Ok(())
    }

    pub fn block_protect(&mut self) -> Result<BlockProtect, BootError> {
        Ok(self.status()?.block_protect())
    }

    /// Changes the protected range, leaving WPEN set so that the range cannot
    /// be changed again without driving WP.
    ///
    /// The status register is read back afterwards; if it doesn't hold what
    /// we wrote, [`BootError::LockStateError`].
    pub fn set_block_protect(
        &mut self,
        protect: BlockProtect,
    ) -> Result<(), BootError> {
        let wanted = Status::from_block_protect(protect) | Status::WPEN;

        self.wp.set_high().map_err(|_| BootError::IoFailure)?;
        let written = self
            .write_enable()
            .and_then(|w| w.write_status(wanted));
        // WP goes back low no matter how the write went.
        let lowered = self.wp.set_low().map_err(|_| BootError::IoFailure);
        written?;
        lowered?;

        let actual = self.status()? & Status::WRITABLE;
        if actual != wanted {
            return Err(BootError::LockStateError);
        }
        Ok(())
    }

    fn select(&mut self) -> Result<Selected<'_, SPI, CS>, BootError> {
        self.cs.set_low().map_err(|_| BootError::IoFailure)?;
        Ok(Selected {
            spi: &mut self.spi,
            cs: &mut self.cs,
        })
    }

    /// Starts a read or write command with an address, returning a guard
    /// that holds CS low.
    fn start_rw_command(
        &mut self,
        cmd: Opcode,
        addr: usize,
    ) -> Result<Selected<'_, SPI, CS>, BootError> {
        let [hi, lo] = ((addr & Self::MAX_ADDR) as u16).to_be_bytes();
        let mut sel = self.select()?;
        sel.write(&[cmd as u8, hi, lo])?;
        Ok(sel)
    }

    fn bounds_check(addr: usize, len: usize) -> Result<(), BootError> {
        let end = addr.checked_add(len).ok_or(BootError::AddressOutOfRange)?;
        if addr > Self::MAX_ADDR || end > Self::SIZE {
            return Err(BootError::AddressOutOfRange);
        }
        Ok(())
    }

    fn do_write_enable(&mut self) -> Result<(), BootError> {
        self.select()?.write(&[Opcode::SetWriteEn as u8])
    }

    fn do_write_disable(&mut self) -> Result<(), BootError> {
        self.select()?.write(&[Opcode::ResetWriteEn as u8])
    }
}

impl<SPI, CS, WP> WritableFram<'_, SPI, CS, WP>
where
    SPI: Write<u8> + Transfer<u8, Error = <SPI as Write<u8>>::Error>,
    BootError: From<<SPI as Write<u8>>::Error>,
    CS: OutputPin,
    WP: OutputPin,
{
    /// Write bytes from `buf` to the FRAM, starting at `addr`.
    ///
    /// The chip clears WEL at the end of every WRITE, so the latch is set
    /// again first; this keeps repeated writes through one guard working.
    pub fn write(&mut self, addr: usize, buf: &[u8]) -> Result<(), BootError> {
        Fm25::<SPI, CS, WP>::bounds_check(addr, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        self.0.do_write_enable()?;
        let mut sel = self.0.start_rw_command(Opcode::Write, addr)?;
        sel.write(buf)
    }

    /// Read bytes from the FRAM starting at `addr` into `buf`.
    pub fn read(
        &mut self,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<(), BootError> {
        self.0.read(addr, buf)
    }

    /// Writes the status register. Consumes the guard since the chip clears
    /// WEL afterwards.
    fn write_status(self, status: Status) -> Result<(), BootError> {
        let bits = (status & Status::WRITABLE).bits();
        self.0
            .select()?
            .write(&[Opcode::WriteStatus as u8, bits])?;
        self.write_disable()
    }

    /// Unset the write enable latch on the FRAM.
    pub fn write_disable(self) -> Result<(), BootError> {
        let r = self.0.do_write_disable();
        if r.is_ok() {
            // Don't do it again.
            core::mem::forget(self);
        }
        r
    }
}

impl<SPI, CS, WP> Drop for WritableFram<'_, SPI, CS, WP>
where
    SPI: Write<u8> + Transfer<u8, Error = <SPI as Write<u8>>::Error>,
    BootError: From<<SPI as Write<u8>>::Error>,
    CS: OutputPin,
    WP: OutputPin,
{
    fn drop(&mut self) {
        // Put the FRAM back the way we found it.
        let _ = self.0.do_write_disable();
    }
}

impl<SPI, CS> Selected<'_, SPI, CS>
where
    SPI: Write<u8> + Transfer<u8, Error = <SPI as Write<u8>>::Error>,
    BootError: From<<SPI as Write<u8>>::Error>,
    CS: OutputPin,
{
    fn write(&mut self, bytes: &[u8]) -> Result<(), BootError> {
        Write::write(&mut *self.spi, bytes).map_err(BootError::from)
    }

    fn transfer(&mut self, buf: &mut [u8]) -> Result<(), BootError> {
        Transfer::transfer(&mut *self.spi, buf)
            .map(|_| ())
            .map_err(BootError::from)
    }
}

impl<SPI, CS: OutputPin> Drop for Selected<'_, SPI, CS> {
    fn drop(&mut self) {
        let _ = self.cs.set_high();
    }
}

impl<SPI, CS, WP> ByteStore for Fm25<SPI, CS, WP>
where
    SPI: Write<u8> + Transfer<u8, Error = <SPI as Write<u8>>::Error>,
    BootError: From<<SPI as Write<u8>>::Error>,
    CS: OutputPin,
    WP: OutputPin,
{
    fn size(&self) -> usize {
        Self::SIZE
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), BootError> {
        Fm25::read(self, addr, buf)
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), BootError> {
        let mut w = self.write_enable()?;
        w.write(addr, data)?;
        w.write_disable()
    }

    fn protection(&mut self) -> Result<BlockProtect, BootError> {
        self.block_protect()
    }

    fn set_protection(
        &mut self,
        protect: BlockProtect,
    ) -> Result<(), BootError> {
        self.set_block_protect(protect)
    }
}
