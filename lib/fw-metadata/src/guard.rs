// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_sboot_api::{BlockProtect, BootError, ByteStore};

/// A byte store with its protected range opened up.
///
/// Protection is re-engaged when this is dropped, so every exit path out of
/// a write sequence relocks. Use [`Unlocked::relock`] to find out whether
/// relocking actually worked.
#[must_use = "dropping an Unlocked immediately relocks the store"]
pub(crate) struct Unlocked<'s, S: ByteStore> {
    store: &'s mut S,
    relock: BlockProtect,
}

impl<'s, S: ByteStore> Unlocked<'s, S> {
    pub fn new(
        store: &'s mut S,
        relock: BlockProtect,
    ) -> Result<Self, BootError> {
        store.set_protection(BlockProtect::None)?;
        Ok(Self { store, relock })
    }

    pub fn store(&mut self) -> &mut S {
        self.store
    }

    /// Re-engages protection.
    ///
    /// Any failure here is a [`BootError::LockStateError`]: the protected
    /// range may still be open, and the record must not be trusted. A
    /// second attempt is made on drop.
    pub fn relock(self) -> Result<(), BootError> {
        match self.store.set_protection(self.relock) {
            Ok(()) => {
                // Don't do it again.
                core::mem::forget(self);
                Ok(())
            }
            Err(_) => Err(BootError::LockStateError),
        }
    }
}

impl<S: ByteStore> Drop for Unlocked<'_, S> {
    fn drop(&mut self) {
        let _ = self.store.set_protection(self.relock);
    }
}
