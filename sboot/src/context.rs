// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crash_log::LogSink;
use drv_sboot_api::{
    BankSelector, BootError, ByteStore, CryptoHashEngine, FlashController,
};
use dual_bank::BankManager;
use fw_integrity::IntegrityEngine;
use fw_metadata::MetadataStore;

use crate::config::Settings;

/// Trusted state, built once at boot and owned by whoever runs next: the
/// orchestrator, then the trust-boundary gateway.
pub struct TrustedContext<'a, S, F, H> {
    pub meta: MetadataStore<S>,
    pub integrity: IntegrityEngine<H>,
    pub banks: BankManager<'a, F>,
}

impl<'a, S, F, H> TrustedContext<'a, S, F, H>
where
    S: ByteStore,
    F: FlashController,
    H: CryptoHashEngine,
{
    /// Assembles the parts. No hardware is touched; this only fails on
    /// configuration that doesn't fit the parts.
    pub fn new(
        store: S,
        flash: F,
        hasher: H,
        settings: &Settings,
        selector: BankSelector,
        device_id: u32,
        log: &'a dyn LogSink,
    ) -> Result<Self, BootError> {
        if store.size() != settings.fram_size {
            return Err(BootError::ParameterInvalid);
        }
        Ok(Self {
            meta: MetadataStore::new(store, device_id)?,
            integrity: IntegrityEngine::new(hasher, settings.layout, selector)?,
            banks: BankManager::new(flash, settings.layout, selector, log)?,
        })
    }

    /// Wipes every digest computed in RAM and any open update.
    pub fn scrub(&mut self) {
        self.integrity.scrub();
        self.banks.scrub_session();
    }
}
