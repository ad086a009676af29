// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Staged replacement of the standby untrusted image.
//!
//! `start_update` checks the signature over the expected digest, records the
//! update as pending in the metadata store and erases the target.
//! `write_update` appends bytes, programming whole chunks as they fill.
//! `finish_update` pads the tail with erased bytes, hashes the entire region
//! and flips the bank valid only if that matches. A power loss anywhere in
//! between leaves the pending marker behind for the next boot to find.

use crash_log::log_entry;
use drv_sboot_api::{
    BankId, BootError, ByteStore, CryptoHashEngine, Domain, EcdsaPublicKey,
    EcdsaSignature, FlashController, Sha256Digest, SignatureVerifier,
};
use fw_integrity::IntegrityEngine;
use fw_metadata::MetadataStore;
use zeroize::Zeroize;

use crate::{BankManager, CHUNK};

/// An update in progress.
#[derive(Zeroize)]
pub struct UpdateSession {
    #[zeroize(skip)]
    bank: BankId,
    expected: Sha256Digest,
    cursor: u32,
    end: u32,
    buf: [u8; CHUNK],
    buffered: usize,
}

impl UpdateSession {
    pub fn bank(&self) -> BankId {
        self.bank
    }

    /// Bytes accepted so far.
    pub fn received(&self, region_start: u32) -> u32 {
        self.cursor - region_start + self.buffered as u32
    }
}

impl<F: FlashController> BankManager<'_, F> {
    pub fn update_in_progress(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&UpdateSession> {
        self.session.as_ref()
    }

    /// Opens an update of the other bank's untrusted image.
    pub fn start_update<H, S, V>(
        &mut self,
        integrity: &mut IntegrityEngine<H>,
        meta: &mut MetadataStore<S>,
        verifier: &mut V,
        key: &EcdsaPublicKey,
        digest: &Sha256Digest,
        signature: &EcdsaSignature,
    ) -> Result<(), BootError>
    where
        H: CryptoHashEngine,
        S: ByteStore,
        V: SignatureVerifier,
    {
        if self.session.is_some() {
            return Err(BootError::Busy);
        }
        if !integrity.verify_signature(verifier, digest, signature, key)? {
            log_entry!(self.log(), "update refused: bad signature");
            return Err(BootError::IntegrityMismatch);
        }

        let bank = self.selector().other();
        meta.begin_pending_update(bank, digest);
        meta.set_valid(bank, Domain::Untrusted, false);
        meta.dump()?;
        integrity.invalidate(bank, Domain::Untrusted);

        self.erase_region(bank, Domain::Untrusted)?;

        let r = self.layout().region(self.selector(), bank, Domain::Untrusted);
        self.session = Some(UpdateSession {
            bank,
            expected: *digest,
            cursor: r.start,
            end: r.end,
            buf: [0; CHUNK],
            buffered: 0,
        });
        log_entry!(self.log(), "update of {bank:?} started");
        Ok(())
    }

    /// Appends `bytes` to the image.
    ///
    /// Data that would run past the end of the region is refused as a whole
    /// with `AddressOutOfRange`; the session stays open.
    pub fn write_update(&mut self, mut bytes: &[u8]) -> Result<(), BootError> {
        let Some(s) = self.session.as_ref() else {
            return Err(BootError::UpdateNotStarted);
        };
        let room = (s.end - s.cursor) as usize - s.buffered;
        if bytes.len() > room {
            return Err(BootError::AddressOutOfRange);
        }

        while !bytes.is_empty() {
            let Some(s) = self.session.as_mut() else {
                return Err(BootError::UpdateNotStarted);
            };
            let n = bytes.len().min(CHUNK - s.buffered);
            s.buf[s.buffered..s.buffered + n].copy_from_slice(&bytes[..n]);
            s.buffered += n;
            bytes = &bytes[n..];
            if s.buffered == CHUNK {
                self.program_buffered()?;
            }
        }
        Ok(())
    }

    fn program_buffered(&mut self) -> Result<(), BootError> {
        let g = self.layout().program_granule as usize;
        let Some(s) = self.session.as_mut() else {
            return Err(BootError::UpdateNotStarted);
        };
        if s.buffered == 0 {
            return Ok(());
        }
        let len = s.buffered.div_ceil(g) * g;
        s.buf[s.buffered..len].fill(0xff);
        let (addr, chunk) = (s.cursor, s.buf);
        self.write_region(addr, &chunk[..len])?;

        if let Some(s) = self.session.as_mut() {
            s.cursor += len as u32;
            s.buffered = 0;
            s.buf.zeroize();
        }
        Ok(())
    }

    /// Closes the update, marking the bank valid if its contents match the
    /// digest given at start.
    pub fn finish_update<H, S>(
        &mut self,
        integrity: &mut IntegrityEngine<H>,
        meta: &mut MetadataStore<S>,
    ) -> Result<(), BootError>
    where
        H: CryptoHashEngine,
        S: ByteStore,
    {
        if self.session.is_none() {
            return Err(BootError::UpdateNotStarted);
        }
        let flushed = self.program_buffered();
        let Some(mut s) = self.session.take() else {
            return Err(BootError::UpdateNotStarted);
        };
        let bank = s.bank;
        let expected = s.expected;
        s.zeroize();
        meta.clear_pending_update();
        if let Err(e) = flushed {
            meta.dump()?;
            return Err(e);
        }

        let d = self.hash(integrity, bank, Domain::Untrusted)?;
        meta.set_digest(bank, Domain::Untrusted, &expected);
        let ok = meta.compare_digest(bank, Domain::Untrusted, &d);
        meta.set_valid(bank, Domain::Untrusted, ok);
        meta.dump()?;
        if ok {
            log_entry!(self.log(), "update of {bank:?} complete");
            Ok(())
        } else {
            log_entry!(self.log(), "update of {bank:?}: digest mismatch");
            Err(BootError::IntegrityMismatch)
        }
    }

    /// Drops an open update. The target stays invalid.
    pub fn abort_update<S: ByteStore>(
        &mut self,
        meta: &mut MetadataStore<S>,
    ) -> Result<(), BootError> {
        let Some(mut s) = self.session.take() else {
            return Err(BootError::UpdateNotStarted);
        };
        log_entry!(self.log(), "update of {:?} aborted", s.bank);
        s.zeroize();
        meta.clear_pending_update();
        meta.dump()
    }

    /// Forgets any open update without touching the metadata.
    pub fn scrub_session(&mut self) {
        if let Some(mut s) = self.session.take() {
            s.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{clock, region, rig, Rig};
    use crash_log::LogRing;
    use drv_mock_sboot_hw::{image, SimFlash};
    use fw_integrity::P256Verifier;
    use fw_metadata::PendingUpdate;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::{Signature, SigningKey};
    use sha2::{Digest, Sha256};

    const KEY_ONE: EcdsaPublicKey = EcdsaPublicKey {
        x: [
            0x6b, 0x17, 0xd1, 0xf2, 0xe1, 0x2c, 0x42, 0x47, 0xf8, 0xbc, 0xe6,
            0xe5, 0x63, 0xa4, 0x40, 0xf2, 0x77, 0x03, 0x7d, 0x81, 0x2d, 0xeb,
            0x33, 0xa0, 0xf4, 0xa1, 0x39, 0x45, 0xd8, 0x98, 0xc2, 0x96,
        ],
        y: [
            0x4f, 0xe3, 0x42, 0xe2, 0xfe, 0x1a, 0x7f, 0x9b, 0x8e, 0xe7, 0xeb,
            0x4a, 0x7c, 0x0f, 0x9e, 0x16, 0x2b, 0xce, 0x33, 0x57, 0x6b, 0x31,
            0x5e, 0xce, 0xcb, 0xb6, 0x40, 0x68, 0x37, 0xbf, 0x51, 0xf5,
        ],
    };

    fn sign(digest: &Sha256Digest) -> EcdsaSignature {
        let mut one = [0u8; 32];
        one[31] = 1;
        let key = SigningKey::from_slice(&one).unwrap();
        let sig: Signature = key.sign_prehash(digest).unwrap();
        let (r, s) = sig.split_bytes();
        EcdsaSignature {
            r: r.as_slice().try_into().unwrap(),
            s: s.as_slice().try_into().unwrap(),
        }
    }

    /// An image and the digest of the region it lands in, erased tail
    /// included.
    fn payload(len: usize) -> (Vec<u8>, Sha256Digest) {
        let img = image(len, 9);
        let r = region(BankId::Two, Domain::Untrusted);
        let mut whole = img.clone();
        whole.resize(r.len(), 0xff);
        (img, Sha256::digest(&whole).into())
    }

    fn start(
        m: &mut BankManager<'_, SimFlash>,
        r: &mut Rig,
        digest: &Sha256Digest,
    ) -> Result<(), BootError> {
        m.start_update(
            &mut r.integrity,
            &mut r.meta,
            &mut P256Verifier,
            &KEY_ONE,
            digest,
            &sign(digest),
        )
    }

    #[test]
    fn full_update() {
        let log = LogRing::<4096>::new(clock);
        let (mut m, mut r) = rig(&log);
        let (img, digest) = payload(3000);

        start(&mut m, &mut r, &digest).unwrap();
        assert_eq!(
            r.meta.pending_update(),
            Some(PendingUpdate {
                bank: BankId::Two,
                expected: digest
            })
        );
        // Odd-sized pieces, as a transport would deliver them.
        for piece in img.chunks(77) {
            m.write_update(piece).unwrap();
        }
        m.finish_update(&mut r.integrity, &mut r.meta).unwrap();

        assert!(!m.update_in_progress());
        assert_eq!(r.meta.pending_update(), None);
        assert!(r.meta.is_valid(BankId::Two, Domain::Untrusted));
        assert!(m
            .check_untrusted(&mut r.integrity, &r.meta, BankId::Two)
            .unwrap());
        let u = region(BankId::Two, Domain::Untrusted);
        assert_eq!(m.flash().bytes(u.start, img.len()), &img[..]);
        assert!(m.flash().is_locked());
    }

    #[test]
    fn bad_signature_touches_nothing() {
        let log = LogRing::<4096>::new(clock);
        let (mut m, mut r) = rig(&log);
        let (_, digest) = payload(100);
        let mut sig = sign(&digest);
        sig.s[31] ^= 1;
        assert_eq!(
            m.start_update(
                &mut r.integrity,
                &mut r.meta,
                &mut P256Verifier,
                &KEY_ONE,
                &digest,
                &sig
            ),
            Err(BootError::IntegrityMismatch)
        );
        assert!(!m.update_in_progress());
        assert!(m.flash().erased().is_empty());
        assert_eq!(r.meta.pending_update(), None);
    }

    #[test]
    fn mismatched_image_is_not_marked_valid() {
        let log = LogRing::<4096>::new(clock);
        let (mut m, mut r) = rig(&log);
        let (mut img, digest) = payload(500);
        img[10] ^= 0xff;
        start(&mut m, &mut r, &digest).unwrap();
        m.write_update(&img).unwrap();
        assert_eq!(
            m.finish_update(&mut r.integrity, &mut r.meta),
            Err(BootError::IntegrityMismatch)
        );
        assert!(!r.meta.is_valid(BankId::Two, Domain::Untrusted));
        assert_eq!(r.meta.pending_update(), None);
    }

    #[test]
    fn session_rules() {
        let log = LogRing::<4096>::new(clock);
        let (mut m, mut r) = rig(&log);
        assert_eq!(m.write_update(&[1]), Err(BootError::UpdateNotStarted));
        assert_eq!(
            m.finish_update(&mut r.integrity, &mut r.meta),
            Err(BootError::UpdateNotStarted)
        );
        assert_eq!(
            m.abort_update(&mut r.meta),
            Err(BootError::UpdateNotStarted)
        );

        let (_, digest) = payload(10);
        start(&mut m, &mut r, &digest).unwrap();
        assert_eq!(start(&mut m, &mut r, &digest), Err(BootError::Busy));

        let size = region(BankId::Two, Domain::Untrusted).len();
        assert_eq!(
            m.write_update(&vec![0; size + 1]),
            Err(BootError::AddressOutOfRange)
        );
        m.write_update(&vec![0; size]).unwrap();
        assert_eq!(m.write_update(&[0]), Err(BootError::AddressOutOfRange));
        assert!(m.update_in_progress());

        m.abort_update(&mut r.meta).unwrap();
        assert!(!m.update_in_progress());
        assert_eq!(r.meta.pending_update(), None);
        assert!(!r.meta.is_valid(BankId::Two, Domain::Untrusted));
    }

    #[test]
    fn update_never_targets_the_executing_bank() {
        let log = LogRing::<4096>::new(clock);
        let (mut m, mut r) = rig(&log);
        let (img, digest) = payload(600);
        start(&mut m, &mut r, &digest).unwrap();
        assert_eq!(m.session().map(UpdateSession::bank), Some(BankId::Two));
        m.write_update(&img).unwrap();
        m.finish_update(&mut r.integrity, &mut r.meta).unwrap();
        let other = m.layout().bank_base(m.selector(), BankId::Two);
        assert!(m.flash().programmed().iter().all(|p| p.start >= other));
    }
}
