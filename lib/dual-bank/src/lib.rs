// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dual-bank firmware management.
//!
//! [`BankManager`] owns the internal flash. It checks bank contents against
//! the digests in the metadata store, repairs a bank by copying from the
//! other one, and runs the staged update of the standby untrusted image.
//!
//! Every flash write goes through the same destination check, which refuses
//! anything touching the trusted domain of the bank we are executing from.
//! Repairs of the trusted domain only ever target the other bank.

#![cfg_attr(not(test), no_std)]

use core::ops::Range;

use crash_log::{log_entry, LogSink};
use drv_sboot_api::{
    BankId, BankSelector, BootError, ByteStore, CryptoHashEngine, Domain,
    FlashController, FlashLayout, Sha256Digest,
};
use fw_integrity::IntegrityEngine;
use fw_metadata::MetadataStore;

mod update;

pub use update::UpdateSession;

/// Attempts at a hash before a transport error is passed up.
pub const RETRY_BUDGET: u32 = 3;

/// Largest program unit we copy or buffer at once.
pub(crate) const CHUNK: usize = 256;

/// Flash opened for programming; locks again when dropped.
struct FlashUnlock<'f, F: FlashController> {
    flash: &'f mut F,
}

impl<'f, F: FlashController> FlashUnlock<'f, F> {
    fn new(flash: &'f mut F) -> Result<Self, BootError> {
        flash.unlock()?;
        Ok(Self { flash })
    }

    fn flash(&mut self) -> &mut F {
        self.flash
    }

    fn lock(self) -> Result<(), BootError> {
        let r = self.flash.lock();
        // Locking again on drop would only repeat the failure.
        core::mem::forget(self);
        r.map_err(|_| BootError::LockStateError)
    }
}

impl<F: FlashController> Drop for FlashUnlock<'_, F> {
    fn drop(&mut self) {
        let _ = self.flash.lock();
    }
}

pub struct BankManager<'a, F> {
    flash: F,
    layout: FlashLayout,
    selector: BankSelector,
    pub(crate) session: Option<UpdateSession>,
    log: &'a dyn LogSink,
}

impl<'a, F: FlashController> BankManager<'a, F> {
    pub fn new(
        flash: F,
        layout: FlashLayout,
        selector: BankSelector,
        log: &'a dyn LogSink,
    ) -> Result<Self, BootError> {
        if CHUNK as u32 % layout.program_granule != 0 {
            return Err(BootError::ParameterInvalid);
        }
        Ok(Self {
            flash,
            layout,
            selector,
            session: None,
            log,
        })
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn selector(&self) -> BankSelector {
        self.selector
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    pub(crate) fn log(&self) -> &'a dyn LogSink {
        self.log
    }

    /// Hashes a region, retrying transport failures up to [`RETRY_BUDGET`]
    /// times.
    pub fn hash<H: CryptoHashEngine>(
        &self,
        integrity: &mut IntegrityEngine<H>,
        bank: BankId,
        domain: Domain,
    ) -> Result<Sha256Digest, BootError> {
        let mut attempt = 1;
        loop {
            match integrity.hash_region(&self.flash, bank, domain) {
                Err(e) if e.is_retryable() && attempt < RETRY_BUDGET => {
                    log_entry!(
                        self.log,
                        "hash {bank:?}/{domain:?} attempt {attempt}: {e:?}"
                    );
                    attempt += 1;
                }
                r => return r,
            }
        }
    }

    /// Valid if flagged valid, both banks store the same trusted digest, and
    /// the bank's contents hash to it.
    pub fn check_trusted<H, S>(
        &self,
        integrity: &mut IntegrityEngine<H>,
        meta: &MetadataStore<S>,
        bank: BankId,
    ) -> Result<bool, BootError>
    where
        H: CryptoHashEngine,
        S: ByteStore,
    {
        if !meta.is_valid(bank, Domain::Trusted) {
            log_entry!(self.log, "{bank:?} trusted not flagged valid");
            return Ok(false);
        }
        if !meta.stored_digests_agree(Domain::Trusted) {
            log_entry!(self.log, "stored trusted digests disagree");
            return Ok(false);
        }
        let d = self.hash(integrity, bank, Domain::Trusted)?;
        let ok = meta.compare_digest(bank, Domain::Trusted, &d);
        if !ok {
            log_entry!(self.log, "{bank:?} trusted digest mismatch");
        }
        Ok(ok)
    }

    /// Valid if flagged valid and the bank's contents hash to the stored
    /// digest.
    pub fn check_untrusted<H, S>(
        &self,
        integrity: &mut IntegrityEngine<H>,
        meta: &MetadataStore<S>,
        bank: BankId,
    ) -> Result<bool, BootError>
    where
        H: CryptoHashEngine,
        S: ByteStore,
    {
        if !meta.is_valid(bank, Domain::Untrusted) {
            log_entry!(self.log, "{bank:?} untrusted not flagged valid");
            return Ok(false);
        }
        let d = self.hash(integrity, bank, Domain::Untrusted)?;
        let ok = meta.compare_digest(bank, Domain::Untrusted, &d);
        if !ok {
            log_entry!(self.log, "{bank:?} untrusted digest mismatch");
        }
        Ok(ok)
    }

    /// Mirrors the executing trusted image into the other bank.
    pub fn repair_trusted_other_bank<H, S>(
        &mut self,
        integrity: &mut IntegrityEngine<H>,
        meta: &mut MetadataStore<S>,
    ) -> Result<(), BootError>
    where
        H: CryptoHashEngine,
        S: ByteStore,
    {
        let from = self.selector.current();
        let to = self.selector.other();
        self.repair(integrity, meta, Domain::Trusted, from, to)
    }

    /// Copies the untrusted image of `from` over that of `to`.
    pub fn repair_untrusted<H, S>(
        &mut self,
        integrity: &mut IntegrityEngine<H>,
        meta: &mut MetadataStore<S>,
        from: BankId,
        to: BankId,
    ) -> Result<(), BootError>
    where
        H: CryptoHashEngine,
        S: ByteStore,
    {
        if from == to {
            return Err(BootError::ParameterInvalid);
        }
        self.repair(integrity, meta, Domain::Untrusted, from, to)
    }

    fn repair<H, S>(
        &mut self,
        integrity: &mut IntegrityEngine<H>,
        meta: &mut MetadataStore<S>,
        domain: Domain,
        from: BankId,
        to: BankId,
    ) -> Result<(), BootError>
    where
        H: CryptoHashEngine,
        S: ByteStore,
    {
        log_entry!(self.log, "repair {domain:?} {from:?} -> {to:?}");

        // The destination stays invalid until it has been re-verified.
        meta.set_valid(to, domain, false);
        meta.dump()?;
        integrity.invalidate(to, domain);

        self.erase_region(to, domain)?;
        self.copy_region(domain, from, to)?;

        meta.copy_digest(from, to, domain);
        let d = self.hash(integrity, to, domain)?;
        if !meta.compare_digest(to, domain, &d) {
            log_entry!(self.log, "repair {domain:?} {to:?}: copy mismatch");
            meta.dump()?;
            return Err(BootError::IntegrityMismatch);
        }
        meta.set_valid(to, domain, true);
        meta.record_repair();
        meta.dump()?;
        log_entry!(self.log, "repair {domain:?} {to:?}: ok");
        Ok(())
    }

    fn copy_region(
        &mut self,
        domain: Domain,
        from: BankId,
        to: BankId,
    ) -> Result<(), BootError> {
        let src = self.layout.region(self.selector, from, domain);
        let dst = self.layout.region(self.selector, to, domain);
        self.check_destination(dst.start, dst.len() as u32)?;

        let mut buf = [0u8; CHUNK];
        let mut open = FlashUnlock::new(&mut self.flash)?;
        let mut off = 0;
        while off < src.len() as u32 {
            let n = (src.len() as u32 - off).min(CHUNK as u32) as usize;
            open.flash().read(src.start + off, &mut buf[..n])?;
            open.flash().program(dst.start + off, &buf[..n])?;
            off += n as u32;
        }
        open.lock()
    }

    /// Rejects a destination that isn't a legal write target.
    ///
    /// The start must be granule aligned, the length a non-zero multiple of
    /// the granule, the whole range inside one (bank, domain) region, and
    /// that region not the trusted domain of the executing bank.
    pub fn check_destination(
        &self,
        start: u32,
        len: u32,
    ) -> Result<(BankId, Domain), BootError> {
        let g = self.layout.program_granule;
        if start % g != 0 {
            return Err(BootError::AlignmentViolation);
        }
        if len == 0 || len % g != 0 {
            return Err(BootError::ParameterInvalid);
        }
        let (bank, domain) = self.layout.locate(self.selector, start, len)?;
        if domain == Domain::Trusted && self.selector.is_current(bank) {
            log_entry!(self.log, "refused write to executing trusted bank");
            return Err(BootError::AddressOutOfRange);
        }
        Ok((bank, domain))
    }

    /// Programs `data` at `addr`. The destination must already be erased;
    /// verifying the result is up to the caller.
    pub fn write_region(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> Result<(), BootError> {
        let len =
            u32::try_from(data.len()).map_err(|_| BootError::ParameterInvalid)?;
        self.check_destination(addr, len)?;
        let mut open = FlashUnlock::new(&mut self.flash)?;
        open.flash().program(addr, data)?;
        open.lock()
    }

    /// Erases a whole (bank, domain) region.
    pub fn erase_region(
        &mut self,
        bank: BankId,
        domain: Domain,
    ) -> Result<(), BootError> {
        let r: Range<u32> = self.layout.region(self.selector, bank, domain);
        self.check_destination(r.start, r.len() as u32)?;
        let sector = self.layout.sector_size;
        let mut open = FlashUnlock::new(&mut self.flash)?;
        for addr in r.step_by(sector as usize) {
            open.flash().erase_sector(addr)?;
        }
        open.lock()
    }

    pub fn into_flash(self) -> F {
        self.flash
    }
}
