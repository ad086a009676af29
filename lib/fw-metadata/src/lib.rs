// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent firmware trust state.
//!
//! The [`MetadataRecord`] lives at the very top of a small [`ByteStore`],
//! with the [`BootCounters`] immediately below it. Both sit inside the
//! store's write-protected range; the range is opened only for the duration
//! of a dump, through a guard that relocks on every exit path.
//!
//! ```text
//!  0                      protect.start()    counters   record   size
//!  |   crash log dump ... |   (unused)     |  16 bytes | record |
//! ```

#![cfg_attr(not(test), no_std)]

use core::hash::Hasher;

use drv_sboot_api::{
    BankId, BankSelector, BlockProtect, BootError, ByteStore, Domain,
    SchemaVersion, Sha256Digest, DEVICE_UID_SZ,
};
use hubpack::SerializedSize;

mod guard;
mod record;
pub mod retained;

use guard::Unlocked;
pub use record::{
    BootCounters, DigestEntry, MetadataRecord, PendingUpdate, UpdateRecord,
    UPDATE_RECORD_CAPACITY,
};

static_assertions::const_assert!(MetadataRecord::MAX_SIZE <= 256);
static_assertions::const_assert!(BootCounters::MAX_SIZE <= 32);

/// Derives the 32-bit device id from the hardware unique identifier.
pub fn device_id(uid: &[u8; DEVICE_UID_SZ]) -> u32 {
    let mut h = fnv::FnvHasher::default();
    h.write(uid);
    let h = h.finish();
    (h ^ (h >> 32)) as u32
}

/// Compares two digests without an early exit.
fn digests_equal(a: &Sha256Digest, b: &Sha256Digest) -> bool {
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Which dirty items a [`MetadataStore::flush`] wrote out.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Flushed {
    pub record: bool,
    pub counters: bool,
}

pub struct MetadataStore<S> {
    store: S,
    device_id: u32,
    protect: BlockProtect,
    record: MetadataRecord,
    counters: BootCounters,
    first_boot: bool,
    record_dirty: bool,
    counters_dirty: bool,
}

impl<S: ByteStore> MetadataStore<S> {
    /// Wraps `store`. Nothing is read until [`MetadataStore::load`].
    ///
    /// Fails with `ParameterInvalid` if the store is too small to keep the
    /// record and counters in its upper half.
    pub fn new(store: S, device_id: u32) -> Result<Self, BootError> {
        let size = store.size();
        let counters_addr = size
            .checked_sub(MetadataRecord::MAX_SIZE + BootCounters::MAX_SIZE)
            .ok_or(BootError::ParameterInvalid)?;
        let protect = match BlockProtect::smallest_covering(size, counters_addr)
        {
            BlockProtect::All | BlockProtect::None => {
                return Err(BootError::ParameterInvalid)
            }
            p => p,
        };
        Ok(Self {
            store,
            device_id,
            protect,
            record: MetadataRecord::UNPROVISIONED,
            counters: BootCounters::default(),
            first_boot: true,
            record_dirty: false,
            counters_dirty: false,
        })
    }

    fn record_addr(&self) -> usize {
        self.store.size() - MetadataRecord::MAX_SIZE
    }

    fn counters_addr(&self) -> usize {
        self.record_addr() - BootCounters::MAX_SIZE
    }

    /// The range that stays write-protected outside of dumps.
    pub fn protection(&self) -> BlockProtect {
        self.protect
    }

    /// Reads the record and counters.
    ///
    /// Only transport failures are errors. Contents that don't decode are
    /// taken as an unprovisioned device, which routes the boot to
    /// provisioning. Also makes sure the protected range is engaged.
    pub fn load(&mut self) -> Result<(), BootError> {
        let mut buf = [0u8; MetadataRecord::MAX_SIZE];
        self.store.read(self.record_addr(), &mut buf)?;
        self.record = match hubpack::deserialize::<MetadataRecord>(&buf) {
            Ok((r, _)) => r,
            Err(_) => MetadataRecord::UNPROVISIONED,
        };

        let mut buf = [0u8; BootCounters::MAX_SIZE];
        self.store.read(self.counters_addr(), &mut buf)?;
        self.counters = match hubpack::deserialize::<BootCounters>(&buf) {
            Ok((c, _)) => c,
            Err(_) => BootCounters::default(),
        };

        self.first_boot = self.record.device_id != self.device_id;
        self.record_dirty = false;
        self.counters_dirty = false;

        if self.store.protection()? != self.protect {
            self.store.set_protection(self.protect)?;
        }
        Ok(())
    }

    /// True if the loaded record was written for another device, or never
    /// written at all.
    pub fn is_first_boot(&self) -> bool {
        self.first_boot
    }

    /// True if the record must be (re)built: it belongs to another device,
    /// its schema is older than `compiled`, or an earlier provisioning never
    /// reached [`MetadataStore::finish_provisioning`].
    pub fn needs_provisioning(&self, compiled: SchemaVersion) -> bool {
        self.first_boot
            || self.record.provisioning
            || self.record.version < compiled
    }

    /// Fails with `RollbackDetected` if `compiled` is older than the version
    /// stored on this device.
    pub fn check_version_rollback(
        &self,
        compiled: SchemaVersion,
    ) -> Result<(), BootError> {
        if compiled < self.record.version {
            Err(BootError::RollbackDetected)
        } else {
            Ok(())
        }
    }

    /// Rebuilds the record for this device and firmware version.
    ///
    /// Everything except the update record is reset; the update record
    /// survives a version upgrade but not a change of device. The trusted
    /// digest of the executing bank is stored as valid, and the record is
    /// marked as provisioning until [`MetadataStore::finish_provisioning`].
    /// Both the record and the counters are dumped.
    pub fn configure(
        &mut self,
        selector: BankSelector,
        compiled: SchemaVersion,
        trusted_digest: &Sha256Digest,
    ) -> Result<(), BootError> {
        let update_record = if self.first_boot {
            UpdateRecord::EMPTY
        } else {
            self.record.update_record
        };
        self.record = MetadataRecord {
            version: compiled,
            device_id: self.device_id,
            provisioning: true,
            update_record,
            ..MetadataRecord::UNPROVISIONED
        };
        *self.record.slot_mut(selector.current(), Domain::Trusted) =
            DigestEntry {
                valid: true,
                digest: *trusted_digest,
            };
        self.counters = BootCounters::default();
        self.dump()?;
        self.dump_counters()
    }

    /// Closes a provisioning started by [`MetadataStore::configure`] and
    /// writes the record out.
    pub fn finish_provisioning(&mut self) -> Result<(), BootError> {
        self.record.provisioning = false;
        self.dump()
    }

    /// Writes the record out and verifies it by reading it back.
    pub fn dump(&mut self) -> Result<(), BootError> {
        let mut buf = [0u8; MetadataRecord::MAX_SIZE];
        let n = hubpack::serialize(&mut buf, &self.record)
            .map_err(|_| BootError::ParameterInvalid)?;
        let addr = self.record_addr();
        self.write_protected(addr, &buf[..n])?;
        self.record_dirty = false;
        Ok(())
    }

    pub fn dump_counters(&mut self) -> Result<(), BootError> {
        let mut buf = [0u8; BootCounters::MAX_SIZE];
        let n = hubpack::serialize(&mut buf, &self.counters)
            .map_err(|_| BootError::ParameterInvalid)?;
        let addr = self.counters_addr();
        self.write_protected(addr, &buf[..n])?;
        self.counters_dirty = false;
        Ok(())
    }

    fn write_protected(
        &mut self,
        addr: usize,
        data: &[u8],
    ) -> Result<(), BootError> {
        const CHUNK: usize = 64;

        let mut open = Unlocked::new(&mut self.store, self.protect)?;
        open.store().write(addr, data)?;

        let mut check = [0u8; CHUNK];
        for (i, want) in data.chunks(CHUNK).enumerate() {
            let got = &mut check[..want.len()];
            open.store().read(addr + i * CHUNK, got)?;
            if got != want {
                return Err(BootError::IoFailure);
            }
        }
        open.relock()
    }

    /// Writes whatever is dirty.
    pub fn flush(&mut self) -> Result<Flushed, BootError> {
        let mut done = Flushed::default();
        if self.record_dirty {
            self.dump()?;
            done.record = true;
        }
        if self.counters_dirty {
            self.dump_counters()?;
            done.counters = true;
        }
        Ok(done)
    }

    pub fn is_dirty(&self) -> bool {
        self.record_dirty || self.counters_dirty
    }

    pub fn record(&self) -> &MetadataRecord {
        &self.record
    }

    pub fn counters(&self) -> BootCounters {
        self.counters
    }

    pub fn set_digest(
        &mut self,
        bank: BankId,
        domain: Domain,
        digest: &Sha256Digest,
    ) {
        self.record.slot_mut(bank, domain).digest = *digest;
        self.record_dirty = true;
    }

    /// True if the stored digest for `(bank, domain)` equals `digest`.
    pub fn compare_digest(
        &self,
        bank: BankId,
        domain: Domain,
        digest: &Sha256Digest,
    ) -> bool {
        digests_equal(&self.record.slot(bank, domain).digest, digest)
    }

    /// Copies the stored digest of `from` over that of `to`, in `domain`.
    pub fn copy_digest(&mut self, from: BankId, to: BankId, domain: Domain) {
        let d = self.record.slot(from, domain).digest;
        self.record.slot_mut(to, domain).digest = d;
        self.record_dirty = true;
    }

    /// True if both banks store the same digest for `domain`.
    pub fn stored_digests_agree(&self, domain: Domain) -> bool {
        digests_equal(
            &self.record.slot(BankId::One, domain).digest,
            &self.record.slot(BankId::Two, domain).digest,
        )
    }

    pub fn set_valid(&mut self, bank: BankId, domain: Domain, valid: bool) {
        self.record.slot_mut(bank, domain).valid = valid;
        self.record_dirty = true;
    }

    pub fn is_valid(&self, bank: BankId, domain: Domain) -> bool {
        self.record.is_valid(bank, domain)
    }

    pub fn is_crashed(&self) -> bool {
        self.record.crashed
    }

    pub fn mark_crashed(&mut self) {
        self.record.crashed = true;
        self.record_dirty = true;
    }

    pub fn clear_crashed(&mut self) {
        self.record.crashed = false;
        self.record_dirty = true;
    }

    pub fn record_boot(&mut self) {
        self.counters.boot_count = self.counters.boot_count.wrapping_add(1);
        self.counters_dirty = true;
    }

    pub fn record_crash(&mut self) {
        self.counters.crash_count = self.counters.crash_count.wrapping_add(1);
        self.counters_dirty = true;
    }

    pub fn record_swap(&mut self) {
        self.counters.swap_count = self.counters.swap_count.wrapping_add(1);
        self.counters_dirty = true;
    }

    pub fn record_repair(&mut self) {
        self.counters.repair_count =
            self.counters.repair_count.wrapping_add(1);
        self.counters_dirty = true;
    }

    pub fn pending_update(&self) -> Option<PendingUpdate> {
        self.record.pending_update
    }

    pub fn begin_pending_update(
        &mut self,
        bank: BankId,
        expected: &Sha256Digest,
    ) {
        self.record.pending_update = Some(PendingUpdate {
            bank,
            expected: *expected,
        });
        self.record_dirty = true;
    }

    pub fn clear_pending_update(&mut self) {
        if self.record.pending_update.take().is_some() {
            self.record_dirty = true;
        }
    }

    /// Replaces the update record. It is written out by the next flush.
    pub fn save_update_record(
        &mut self,
        bytes: &[u8],
    ) -> Result<(), BootError> {
        let r = UpdateRecord::new(bytes).ok_or(BootError::ParameterInvalid)?;
        if r != self.record.update_record {
            self.record.update_record = r;
            self.record_dirty = true;
        }
        Ok(())
    }

    /// The saved update record; empty on a device's first boot.
    pub fn load_update_record(&self) -> &[u8] {
        self.record.update_record.as_bytes()
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_mock_sboot_hw::MemStore;
    use proptest::prelude::*;

    const ID: u32 = 0x1234_5678;
    const V1: SchemaVersion = SchemaVersion::new(1, 2, 0);
    const SEL: BankSelector = BankSelector::new(false);

    fn fresh() -> MetadataStore<MemStore> {
        let mut m = MetadataStore::new(MemStore::new(8192), ID).unwrap();
        m.load().unwrap();
        m
    }

    fn provisioned() -> MetadataStore<MemStore> {
        let mut m = fresh();
        m.configure(SEL, V1, &[7; 32]).unwrap();
        m.finish_provisioning().unwrap();
        m
    }

    fn reopen(m: MetadataStore<MemStore>) -> MetadataStore<MemStore> {
        let mut m = MetadataStore::new(m.into_store(), ID).unwrap();
        m.load().unwrap();
        m
    }

    #[test]
    fn blank_or_garbage_store_needs_provisioning() {
        let m = fresh();
        assert!(m.is_first_boot());
        assert!(m.needs_provisioning(V1));
        assert_eq!(m.record(), &MetadataRecord::UNPROVISIONED);

        let mut store = MemStore::new(8192);
        store.bytes_mut().fill(0xa5);
        let mut m = MetadataStore::new(store, ID).unwrap();
        m.load().unwrap();
        assert!(m.is_first_boot());
    }

    #[test]
    fn load_engages_protection() {
        let m = fresh();
        assert_eq!(m.protection(), BlockProtect::UpperQuarter);
        let store = m.into_store();
        assert_eq!(store.current_protection(), BlockProtect::UpperQuarter);
    }

    #[test]
    fn load_propagates_transport_errors() {
        let mut store = MemStore::new(8192);
        store.fail_next_read(BootError::Timeout);
        let mut m = MetadataStore::new(store, ID).unwrap();
        assert_eq!(m.load(), Err(BootError::Timeout));
    }

    #[test]
    fn configure_survives_reload() {
        let m = reopen(provisioned());
        assert!(!m.is_first_boot());
        assert!(!m.needs_provisioning(V1));
        assert!(m.needs_provisioning(SchemaVersion::new(1, 3, 0)));
        assert_eq!(m.record().version(), V1);
        assert_eq!(m.record().device_id(), ID);
        assert!(m.is_valid(BankId::One, Domain::Trusted));
        assert!(!m.is_valid(BankId::Two, Domain::Trusted));
        assert!(m.compare_digest(BankId::One, Domain::Trusted, &[7; 32]));
        assert_eq!(m.counters(), BootCounters::default());
    }

    #[test]
    fn unfinished_provisioning_is_resumed() {
        let mut m = fresh();
        m.configure(SEL, V1, &[7; 32]).unwrap();
        // Reset before the other bank was mirrored.
        let mut m = reopen(m);
        assert!(!m.is_first_boot());
        assert!(m.record().provisioning());
        assert!(m.needs_provisioning(V1));

        m.finish_provisioning().unwrap();
        let m = reopen(m);
        assert!(!m.record().provisioning());
        assert!(!m.needs_provisioning(V1));
    }

    #[test]
    fn other_device_is_first_boot() {
        let m = provisioned();
        let mut m = MetadataStore::new(m.into_store(), ID + 1).unwrap();
        m.load().unwrap();
        assert!(m.is_first_boot());
    }

    #[test]
    fn configure_uses_the_executing_bank() {
        let mut m = fresh();
        m.configure(BankSelector::new(true), V1, &[1; 32]).unwrap();
        assert!(m.is_valid(BankId::Two, Domain::Trusted));
        assert!(!m.is_valid(BankId::One, Domain::Trusted));
    }

    #[test]
    fn stays_locked_after_dump() {
        let mut m = provisioned();
        m.set_valid(BankId::Two, Domain::Untrusted, true);
        m.dump().unwrap();
        let store = m.store_mut();
        assert_eq!(store.current_protection(), BlockProtect::UpperQuarter);

        // The protected range really is protected.
        let before = store.bytes()[8191];
        store.write(8191, &[!before]).unwrap();
        assert_eq!(store.bytes()[8191], before);
    }

    #[test]
    fn relock_failure_is_reported() {
        let mut m = provisioned();
        m.store_mut().refuse_lock(true);
        m.mark_crashed();
        assert_eq!(m.dump(), Err(BootError::LockStateError));
        assert!(m.is_dirty());
    }

    #[test]
    fn write_failure_still_relocks() {
        let mut m = provisioned();
        m.store_mut().fail_next_write(BootError::IoFailure);
        m.mark_crashed();
        assert_eq!(m.dump(), Err(BootError::IoFailure));
        assert_eq!(
            m.store_mut().current_protection(),
            BlockProtect::UpperQuarter
        );
    }

    #[test]
    fn readback_failure_still_relocks() {
        let mut m = provisioned();
        m.store_mut().fail_next_read(BootError::Timeout);
        m.mark_crashed();
        assert_eq!(m.dump(), Err(BootError::Timeout));
        assert_eq!(
            m.store_mut().current_protection(),
            BlockProtect::UpperQuarter
        );
    }

    #[test]
    fn rollback_at_patch_boundary() {
        let m = provisioned();
        assert_eq!(
            m.check_version_rollback(SchemaVersion::new(1, 1, 9)),
            Err(BootError::RollbackDetected)
        );
        assert_eq!(m.check_version_rollback(V1), Ok(()));
        let v2 = SchemaVersion::new(2, 0, 0);
        assert_eq!(m.check_version_rollback(v2), Ok(()));
    }

    proptest! {
        #[test]
        fn rollback_is_monotonic(
            stored in any::<(u8, u8, u8)>(),
            compiled in any::<(u8, u8, u8)>(),
        ) {
            let s = SchemaVersion::new(stored.0, stored.1, stored.2);
            let c = SchemaVersion::new(compiled.0, compiled.1, compiled.2);
            let mut m = fresh();
            m.configure(SEL, s, &[0; 32]).unwrap();
            prop_assert_eq!(
                m.check_version_rollback(c).is_ok(),
                compiled >= stored
            );
        }
    }

    #[test]
    fn digest_bookkeeping() {
        let mut m = provisioned();
        assert!(!m.stored_digests_agree(Domain::Trusted));
        m.copy_digest(BankId::One, BankId::Two, Domain::Trusted);
        assert!(m.stored_digests_agree(Domain::Trusted));
        assert!(m.compare_digest(BankId::Two, Domain::Trusted, &[7; 32]));

        m.set_digest(BankId::Two, Domain::Untrusted, &[3; 32]);
        assert!(!m.compare_digest(BankId::Two, Domain::Untrusted, &[4; 32]));
        assert!(m.compare_digest(BankId::Two, Domain::Untrusted, &[3; 32]));
    }

    #[test]
    fn update_record_round_trip() {
        let mut m = provisioned();
        assert_eq!(m.load_update_record(), &[] as &[u8]);
        assert_eq!(
            m.save_update_record(&[0; 65]),
            Err(BootError::ParameterInvalid)
        );
        m.save_update_record(b"lease 10.0.0.7").unwrap();
        assert_eq!(
            m.flush().unwrap(),
            Flushed {
                record: true,
                counters: false
            }
        );

        let mut m = reopen(m);
        assert_eq!(m.load_update_record(), b"lease 10.0.0.7");

        // A version upgrade keeps it.
        m.configure(SEL, SchemaVersion::new(1, 3, 0), &[7; 32]).unwrap();
        assert_eq!(m.load_update_record(), b"lease 10.0.0.7");

        // A new device does not.
        let mut m = MetadataStore::new(m.into_store(), ID + 1).unwrap();
        m.load().unwrap();
        m.configure(SEL, V1, &[7; 32]).unwrap();
        assert!(m.load_update_record().is_empty());
    }

    #[test]
    fn flush_writes_only_dirty_items() {
        let mut m = provisioned();
        let writes = m.store_mut().write_count();
        assert_eq!(m.flush().unwrap(), Flushed::default());
        assert_eq!(m.store_mut().write_count(), writes);

        m.save_update_record(b"same").unwrap();
        m.flush().unwrap();
        let writes = m.store_mut().write_count();
        // Unchanged contents don't dirty the record.
        m.save_update_record(b"same").unwrap();
        assert!(!m.is_dirty());

        m.record_boot();
        assert_eq!(
            m.flush().unwrap(),
            Flushed {
                record: false,
                counters: true
            }
        );
        assert_eq!(m.store_mut().write_count(), writes + 1);
    }

    #[test]
    fn counters_persist() {
        let mut m = provisioned();
        m.record_boot();
        m.record_boot();
        m.record_crash();
        m.record_swap();
        m.record_repair();
        m.dump_counters().unwrap();
        let m = reopen(m);
        assert_eq!(
            m.counters(),
            BootCounters {
                boot_count: 2,
                crash_count: 1,
                swap_count: 1,
                repair_count: 1,
            }
        );
    }

    #[test]
    fn pending_update_marker() {
        let mut m = provisioned();
        m.begin_pending_update(BankId::Two, &[9; 32]);
        m.dump().unwrap();
        let mut m = reopen(m);
        assert_eq!(
            m.pending_update(),
            Some(PendingUpdate {
                bank: BankId::Two,
                expected: [9; 32]
            })
        );
        m.clear_pending_update();
        assert!(m.is_dirty());
        assert_eq!(m.pending_update(), None);
    }

    #[test]
    fn crashed_flag_persists() {
        let mut m = provisioned();
        m.mark_crashed();
        m.dump().unwrap();
        let mut m = reopen(m);
        assert!(m.is_crashed());
        m.clear_crashed();
        m.dump().unwrap();
        assert!(!reopen(m).is_crashed());
    }

    #[test]
    fn protection_choice_follows_store_size() {
        let m = MetadataStore::new(MemStore::new(8192), ID).unwrap();
        assert_eq!(m.protection(), BlockProtect::UpperQuarter);
        let m = MetadataStore::new(MemStore::new(512), ID).unwrap();
        assert_eq!(m.protection(), BlockProtect::UpperHalf);
        assert_eq!(
            MetadataStore::new(MemStore::new(256), ID).err(),
            Some(BootError::ParameterInvalid)
        );
    }

    #[test]
    fn device_id_is_stable_and_discriminating() {
        let a = device_id(b"SIMUID000001");
        assert_eq!(a, device_id(b"SIMUID000001"));
        assert_ne!(a, device_id(b"SIMUID000002"));
    }
}
