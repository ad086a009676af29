// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware integrity checking.
//!
//! [`IntegrityEngine`] hashes flash regions through a [`CryptoHashEngine`],
//! one region at a time, and keeps the result per (bank, domain) slot.
//! There's a single accelerator, so at most one slot is ever in progress; a
//! second request while one is running is `Busy` rather than queued.

#![cfg_attr(not(test), no_std)]

use drv_sboot_api::{
    BankId, BankSelector, BootError, CryptoHashEngine, Domain, EcdsaPublicKey,
    EcdsaSignature, FlashController, FlashLayout, Sha256Digest,
    SignatureVerifier,
};
use zeroize::Zeroize;

mod soft;

pub use soft::{P256Verifier, Sha2Engine};

/// Bytes read from flash and fed to the engine per poll.
const CHUNK: usize = 256;

/// How many times `finish` may report `WouldBlock` before the hash is
/// abandoned with `Timeout`.
pub const DEFAULT_POLL_BUDGET: u32 = 100_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    NotComputed,
    InProgress,
    Complete,
    Error(BootError),
}

#[derive(Copy, Clone, Debug)]
struct DigestSlot {
    state: SlotState,
    digest: Sha256Digest,
}

impl DigestSlot {
    const EMPTY: Self = Self {
        state: SlotState::NotComputed,
        digest: [0; 32],
    };
}

#[derive(Copy, Clone, Debug)]
struct Job {
    bank: BankId,
    domain: Domain,
    cursor: u32,
    end: u32,
    waited: u32,
}

pub struct IntegrityEngine<H> {
    hasher: H,
    layout: FlashLayout,
    selector: BankSelector,
    slots: [[DigestSlot; 2]; 2],
    job: Option<Job>,
    poll_budget: u32,
}

impl<H: CryptoHashEngine> IntegrityEngine<H> {
    /// Fails with `ParameterInvalid` if `layout` doesn't suit the engine,
    /// notably if the trusted domain isn't a whole number of hash words.
    pub fn new(
        hasher: H,
        layout: FlashLayout,
        selector: BankSelector,
    ) -> Result<Self, BootError> {
        layout.validate(H::WORD_SIZE as u32)?;
        Ok(Self {
            hasher,
            layout,
            selector,
            slots: [[DigestSlot::EMPTY; 2]; 2],
            job: None,
            poll_budget: DEFAULT_POLL_BUDGET,
        })
    }

    pub fn with_poll_budget(mut self, budget: u32) -> Self {
        self.poll_budget = budget;
        self
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    pub fn selector(&self) -> BankSelector {
        self.selector
    }

    pub fn hasher_mut(&mut self) -> &mut H {
        &mut self.hasher
    }

    fn slot_mut(&mut self, bank: BankId, domain: Domain) -> &mut DigestSlot {
        &mut self.slots[bank.index()][domain.index()]
    }

    pub fn state(&self, bank: BankId, domain: Domain) -> SlotState {
        self.slots[bank.index()][domain.index()].state
    }

    /// The digest of a slot, once complete.
    pub fn digest(&self, bank: BankId, domain: Domain) -> Option<Sha256Digest> {
        let slot = &self.slots[bank.index()][domain.index()];
        match slot.state {
            SlotState::Complete => Some(slot.digest),
            _ => None,
        }
    }

    /// Forgets a computed digest, e.g. after its region was rewritten.
    pub fn invalidate(&mut self, bank: BankId, domain: Domain) {
        let slot = self.slot_mut(bank, domain);
        if slot.state != SlotState::InProgress {
            slot.state = SlotState::NotComputed;
            slot.digest.zeroize();
        }
    }

    /// Starts hashing `domain` of logical `bank`.
    pub fn begin(
        &mut self,
        bank: BankId,
        domain: Domain,
    ) -> Result<(), BootError> {
        if self.job.is_some() {
            return Err(BootError::Busy);
        }
        if let Err(e) = self.hasher.start() {
            self.slot_mut(bank, domain).state = SlotState::Error(e);
            return Err(e);
        }
        let r = self.layout.region(self.selector, bank, domain);
        let slot = self.slot_mut(bank, domain);
        slot.state = SlotState::InProgress;
        slot.digest.zeroize();
        self.job = Some(Job {
            bank,
            domain,
            cursor: r.start,
            end: r.end,
            waited: 0,
        });
        Ok(())
    }

    /// Advances the hash in progress by one step.
    ///
    /// Each call feeds at most one chunk of flash, or checks once on the
    /// accelerator. An accelerator that keeps saying `WouldBlock` past the
    /// poll budget fails the slot with `Timeout`.
    pub fn poll<F: FlashController>(
        &mut self,
        flash: &F,
    ) -> nb::Result<Sha256Digest, BootError> {
        let Some(mut job) = self.job else {
            return Err(nb::Error::Other(BootError::ParameterInvalid));
        };

        if job.cursor < job.end {
            let mut buf = [0u8; CHUNK];
            let n = (job.end - job.cursor).min(CHUNK as u32) as usize;
            let step = flash
                .read(job.cursor, &mut buf[..n])
                .and_then(|()| self.hasher.feed(&buf[..n]));
            buf.zeroize();
            if let Err(e) = step {
                return Err(nb::Error::Other(self.fail(job, e)));
            }
            job.cursor += n as u32;
            self.job = Some(job);
            return Err(nb::Error::WouldBlock);
        }

        match self.hasher.finish() {
            Ok(digest) => {
                let slot = self.slot_mut(job.bank, job.domain);
                slot.state = SlotState::Complete;
                slot.digest = digest;
                self.job = None;
                Ok(digest)
            }
            Err(nb::Error::WouldBlock) => {
                job.waited += 1;
                if job.waited > self.poll_budget {
                    return Err(nb::Error::Other(
                        self.fail(job, BootError::Timeout),
                    ));
                }
                self.job = Some(job);
                Err(nb::Error::WouldBlock)
            }
            Err(nb::Error::Other(e)) => {
                Err(nb::Error::Other(self.fail(job, e)))
            }
        }
    }

    fn fail(&mut self, job: Job, e: BootError) -> BootError {
        self.slot_mut(job.bank, job.domain).state = SlotState::Error(e);
        self.job = None;
        e
    }

    /// Hashes `domain` of `bank` to completion.
    pub fn hash_region<F: FlashController>(
        &mut self,
        flash: &F,
        bank: BankId,
        domain: Domain,
    ) -> Result<Sha256Digest, BootError> {
        self.begin(bank, domain)?;
        nb::block!(self.poll(flash))
    }

    /// Checks `signature` over `digest` against `key`.
    pub fn verify_signature<V: SignatureVerifier>(
        &self,
        verifier: &mut V,
        digest: &Sha256Digest,
        signature: &EcdsaSignature,
        key: &EcdsaPublicKey,
    ) -> Result<bool, BootError> {
        verifier.verify(digest, signature, key)
    }

    /// Drops every computed digest and any hash in progress.
    pub fn scrub(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.state = SlotState::NotComputed;
            slot.digest.zeroize();
        }
        self.job = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_mock_sboot_hw::{image, SimFlash, SimHashAccelerator, SMALL_LAYOUT};
    use drv_sboot_api::Region;
    use sha2::{Digest, Sha256};

    const SEL: BankSelector = BankSelector::new(false);

    fn setup() -> (IntegrityEngine<SimHashAccelerator>, SimFlash) {
        let mut flash = SimFlash::new(SMALL_LAYOUT);
        let r = SMALL_LAYOUT.region(SEL, BankId::One, Domain::Trusted);
        flash.load(r.start, &image(r.len(), 1));
        let e = IntegrityEngine::new(
            SimHashAccelerator::default(),
            SMALL_LAYOUT,
            SEL,
        )
        .unwrap();
        (e, flash)
    }

    fn expected(
        flash: &SimFlash,
        bank: BankId,
        domain: Domain,
    ) -> Sha256Digest {
        let r = SMALL_LAYOUT.region(SEL, bank, domain);
        Sha256::digest(flash.bytes(r.start, r.len())).into()
    }

    #[test]
    fn hashes_the_whole_region() {
        let (mut e, flash) = setup();
        let d = e.hash_region(&flash, BankId::One, Domain::Trusted).unwrap();
        assert_eq!(d, expected(&flash, BankId::One, Domain::Trusted));
        assert_eq!(e.state(BankId::One, Domain::Trusted), SlotState::Complete);
        assert_eq!(e.digest(BankId::One, Domain::Trusted), Some(d));
        assert_eq!(e.digest(BankId::Two, Domain::Trusted), None);
    }

    #[test]
    fn same_bytes_same_digest_one_byte_differs() {
        let (mut e, mut flash) = setup();
        let a = e.hash_region(&flash, BankId::One, Domain::Trusted).unwrap();
        let b = e.hash_region(&flash, BankId::One, Domain::Trusted).unwrap();
        assert_eq!(a, b);
        flash.corrupt(SMALL_LAYOUT.base + 100);
        let c = e.hash_region(&flash, BankId::One, Domain::Trusted).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn only_one_hash_at_a_time() {
        let (mut e, flash) = setup();
        e.begin(BankId::One, Domain::Trusted).unwrap();
        assert_eq!(
            e.hash_region(&flash, BankId::Two, Domain::Untrusted),
            Err(BootError::Busy)
        );
        assert_eq!(
            e.state(BankId::Two, Domain::Untrusted),
            SlotState::NotComputed
        );
        nb::block!(e.poll(&flash)).unwrap();
        assert!(e.hash_region(&flash, BankId::Two, Domain::Untrusted).is_ok());
    }

    #[test]
    fn bank_mapping_follows_the_selector() {
        let mut flash = SimFlash::new(SMALL_LAYOUT);
        // Physically first bank holds image 1, second holds image 2.
        let span = SMALL_LAYOUT.domain_span(Domain::Untrusted);
        flash.load(
            SMALL_LAYOUT.base + span.offset,
            &image(span.size as usize, 1),
        );
        flash.load(
            SMALL_LAYOUT.base + SMALL_LAYOUT.bank_size + span.offset,
            &image(span.size as usize, 2),
        );

        let mut plain = IntegrityEngine::new(
            SimHashAccelerator::default(),
            SMALL_LAYOUT,
            SEL,
        )
        .unwrap();
        let mut swapped = IntegrityEngine::new(
            SimHashAccelerator::default(),
            SMALL_LAYOUT,
            BankSelector::new(true),
        )
        .unwrap();
        let u = Domain::Untrusted;
        let p1 = plain.hash_region(&flash, BankId::One, u).unwrap();
        let s2 = swapped.hash_region(&flash, BankId::Two, u).unwrap();
        let s1 = swapped.hash_region(&flash, BankId::One, u).unwrap();
        assert_eq!(p1, s2);
        assert_ne!(p1, s1);
    }

    #[test]
    fn stuck_accelerator_times_out() {
        let (e, flash) = setup();
        let mut e = e.with_poll_budget(5);
        e.hasher_mut().stall(true);
        assert_eq!(
            e.hash_region(&flash, BankId::One, Domain::Trusted),
            Err(BootError::Timeout)
        );
        assert_eq!(
            e.state(BankId::One, Domain::Trusted),
            SlotState::Error(BootError::Timeout)
        );
        // The engine is free again.
        e.hasher_mut().stall(false);
        assert!(e.hash_region(&flash, BankId::One, Domain::Trusted).is_ok());
    }

    #[test]
    fn start_failure_marks_the_slot() {
        let (mut e, flash) = setup();
        e.hasher_mut().fail_start(BootError::IoFailure);
        assert_eq!(
            e.hash_region(&flash, BankId::One, Domain::Trusted),
            Err(BootError::IoFailure)
        );
        assert_eq!(
            e.state(BankId::One, Domain::Trusted),
            SlotState::Error(BootError::IoFailure)
        );
    }

    #[test]
    fn trusted_size_must_be_whole_words() {
        let mut layout = SMALL_LAYOUT;
        // Still sector aligned in this layout's terms, but not word aligned.
        layout.sector_size = 2;
        layout.program_granule = 2;
        layout.nsc = Region {
            offset: layout.trusted.end(),
            size: 2 * 1024 - 2,
        };
        layout.untrusted = Region {
            offset: layout.nsc.end(),
            size: 8 * 1024,
        };
        assert_eq!(
            IntegrityEngine::new(SimHashAccelerator::default(), layout, SEL)
                .err(),
            Some(BootError::ParameterInvalid)
        );
    }

    #[test]
    fn invalidate_and_scrub() {
        let (mut e, flash) = setup();
        e.hash_region(&flash, BankId::One, Domain::Trusted).unwrap();
        e.invalidate(BankId::One, Domain::Trusted);
        assert_eq!(e.digest(BankId::One, Domain::Trusted), None);

        e.hash_region(&flash, BankId::One, Domain::Trusted).unwrap();
        e.begin(BankId::One, Domain::Untrusted).unwrap();
        e.scrub();
        assert_eq!(e.digest(BankId::One, Domain::Trusted), None);
        assert_eq!(
            e.state(BankId::One, Domain::Untrusted),
            SlotState::NotComputed
        );
        assert!(e.begin(BankId::One, Domain::Trusted).is_ok());
    }

    #[test]
    fn software_engine_agrees_with_accelerator() {
        let (mut hw, flash) = setup();
        let mut sw =
            IntegrityEngine::new(Sha2Engine::default(), SMALL_LAYOUT, SEL)
                .unwrap();
        assert_eq!(
            hw.hash_region(&flash, BankId::One, Domain::Trusted),
            sw.hash_region(&flash, BankId::One, Domain::Trusted)
        );
    }
}
