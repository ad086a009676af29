// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry points callable from the untrusted world.
//!
//! Every call runs with the trusted tick resumed, and suspends it again on
//! the way out if the board asks for that. Calls that touch trusted state
//! take the context with `try_lock` and return `Busy` if another thread has
//! it; they never spin. `write_log` takes no lock at all.

use core::fmt;

use crash_log::log_entry;
use drv_sboot_api::{
    BootError, ByteStore, CryptoHashEngine, EcdsaSignature, FlashController,
    NscHooks, Sha256Digest,
};
use fw_integrity::P256Verifier;
use fw_metadata::{Flushed, UPDATE_RECORD_CAPACITY};

use crate::config::Settings;
use crate::context::TrustedContext;
use crate::BootLog;

pub type UpdateRecordBuf = heapless::Vec<u8, UPDATE_RECORD_CAPACITY>;

pub struct NscGateway<'a, S, F, H> {
    ctx: spin::Mutex<TrustedContext<'a, S, F, H>>,
    log: &'a BootLog,
    hooks: &'a dyn NscHooks,
    settings: Settings,
}

impl<'a, S, F, H> NscGateway<'a, S, F, H>
where
    S: ByteStore,
    F: FlashController,
    H: CryptoHashEngine,
{
    pub fn new(
        ctx: TrustedContext<'a, S, F, H>,
        log: &'a BootLog,
        hooks: &'a dyn NscHooks,
        settings: Settings,
    ) -> Self {
        Self {
            ctx: spin::Mutex::new(ctx),
            log,
            hooks,
            settings,
        }
    }

    fn entry<R>(&self, body: impl FnOnce() -> R) -> R {
        self.hooks.resume_tick();
        let r = body();
        if self.settings.suspend_tick {
            self.hooks.suspend_tick();
        }
        r
    }

    fn with_context<R>(
        &self,
        body: impl FnOnce(
            &mut TrustedContext<'a, S, F, H>,
        ) -> Result<R, BootError>,
    ) -> Result<R, BootError> {
        self.entry(|| {
            let mut ctx = self.ctx.try_lock().ok_or(BootError::Busy)?;
            body(&mut *ctx)
        })
    }

    /// Direct access to the context, if nobody else holds it.
    pub fn try_context(
        &self,
    ) -> Option<spin::MutexGuard<'_, TrustedContext<'a, S, F, H>>> {
        self.ctx.try_lock()
    }

    /// Takes the context back out, as a reset would.
    pub fn into_context(self) -> TrustedContext<'a, S, F, H> {
        self.ctx.into_inner()
    }

    pub fn save_update_record(&self, bytes: &[u8]) -> Result<(), BootError> {
        self.with_context(|ctx| ctx.meta.save_update_record(bytes))
    }

    pub fn load_update_record(&self) -> Result<UpdateRecordBuf, BootError> {
        self.with_context(|ctx| {
            UpdateRecordBuf::from_slice(ctx.meta.load_update_record())
                .map_err(|_| BootError::ParameterInvalid)
        })
    }

    /// Writes out dirty metadata and counters, and reports any latched ECC
    /// fault to the log.
    pub fn run_background_maintenance(&self) -> Result<Flushed, BootError> {
        self.with_context(|ctx| {
            if let Some(ecc) = self.hooks.take_ecc_fault() {
                log_entry!(
                    self.log,
                    "ecc fault at {:#x} double={}",
                    ecc.address,
                    ecc.double
                );
            }
            ctx.meta.flush()
        })
    }

    pub fn write_log(&self, args: fmt::Arguments<'_>) -> Result<(), BootError> {
        self.entry(|| self.log.write(args))
    }

    /// Opens an update of the standby untrusted image. The signature is
    /// checked against the board's compiled-in key.
    pub fn start_update(
        &self,
        digest: &Sha256Digest,
        signature: &EcdsaSignature,
    ) -> Result<(), BootError> {
        let key = self.settings.signing_key;
        self.with_context(|ctx| {
            let TrustedContext {
                meta,
                integrity,
                banks,
            } = ctx;
            banks.start_update(
                integrity,
                meta,
                &mut P256Verifier,
                &key,
                digest,
                signature,
            )
        })
    }

    pub fn write_update(&self, bytes: &[u8]) -> Result<(), BootError> {
        self.with_context(|ctx| ctx.banks.write_update(bytes))
    }

    pub fn finish_update(&self) -> Result<(), BootError> {
        self.with_context(|ctx| {
            let TrustedContext {
                meta,
                integrity,
                banks,
            } = ctx;
            banks.finish_update(integrity, meta)
        })
    }

    pub fn abort_update(&self) -> Result<(), BootError> {
        self.with_context(|ctx| ctx.banks.abort_update(&mut ctx.meta))
    }
}
