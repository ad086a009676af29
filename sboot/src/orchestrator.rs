// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot state machine.
//!
//! ```text
//!  Init -> PeripheralsReady -> MetadataLoaded -+-> FirstBootProvision -+
//!                                              |                       |
//!                                              +-> NormalVerify -------+
//!                                                                      v
//!                               Handoff <- UntrustedCheck <- TrustedOk
//! ```
//!
//! Any state can fall into `ErrorCrashSwap`, which either requests a bank
//! swap through a reset or halts.

use crash_log::{dump, log_entry};
use drv_sboot_api::{
    BankId, BootError, ByteStore, CryptoHashEngine, Domain, ErrorClass,
    FlashController, Platform,
};
use fw_metadata::retained::RetainedState;

use crate::config::{Settings, SwapPolicy};
use crate::context::TrustedContext;
use crate::BootLog;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootState {
    Init,
    PeripheralsReady,
    MetadataLoaded,
    FirstBootProvision,
    NormalVerify,
    TrustedOk,
    UntrustedCheck,
    Handoff,
    ErrorCrashSwap,
}

/// How a boot ends.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootOutcome {
    /// Everything verified; run the untrusted image.
    Handoff,
    /// Reset with the bank swap option toggled.
    SwapAndReset,
    Halt,
}

/// A fault on the way through the state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Fault {
    error: BootError,
    /// Nothing left to swap to, or swapping can't help.
    terminal: bool,
}

impl Fault {
    fn terminal(error: BootError) -> Self {
        Self {
            error,
            terminal: true,
        }
    }
}

impl From<BootError> for Fault {
    fn from(error: BootError) -> Self {
        Self {
            error,
            terminal: error.class() == ErrorClass::Programmer,
        }
    }
}

/// Bytes of the previous crash dump looked at during boot.
const PREVIOUS_LOG_WINDOW: usize = 512;

pub struct Orchestrator<'a, 'p, P, S, F, H> {
    platform: &'p mut P,
    ctx: TrustedContext<'a, S, F, H>,
    log: &'a BootLog,
    settings: Settings,
    state: BootState,
    history: heapless::Vec<BootState, 12>,
    retained: RetainedState,
    in_crash: bool,
}

impl<'a, 'p, P, S, F, H> Orchestrator<'a, 'p, P, S, F, H>
where
    P: Platform,
    S: ByteStore,
    F: FlashController,
    H: CryptoHashEngine,
{
    /// The `Init` state: assembles the trusted context and picks up any
    /// state retained across a warm reset.
    pub fn new(
        platform: &'p mut P,
        store: S,
        flash: F,
        hasher: H,
        log: &'a BootLog,
        settings: Settings,
    ) -> Result<Self, BootError> {
        let selector = platform.bank_selector();
        let id = fw_metadata::device_id(&platform.device_uid());
        let ctx = TrustedContext::new(
            store, flash, hasher, &settings, selector, id, log,
        )?;

        let retained = match RetainedState::load(platform.retained_ram()) {
            Some(mut r) => {
                r.warm_resets = r.warm_resets.wrapping_add(1);
                log_entry!(
                    log,
                    "warm reset {}, last fault {:?}",
                    r.warm_resets,
                    r.last_fault
                );
                r
            }
            None => RetainedState::default(),
        };
        // Nothing useful to do if retained RAM is too small; crash
        // re-entry is still caught by the persisted flag.
        let _ = retained.store(platform.retained_ram());

        let mut history = heapless::Vec::new();
        let _ = history.push(BootState::Init);
        log_entry!(log, "sboot {} on {:?}", settings.compiled, selector);

        Ok(Self {
            platform,
            ctx,
            log,
            settings,
            state: BootState::Init,
            history,
            retained,
            in_crash: false,
        })
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[BootState] {
        &self.history
    }

    pub fn context(&self) -> &TrustedContext<'a, S, F, H> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut TrustedContext<'a, S, F, H> {
        &mut self.ctx
    }

    pub fn platform(&mut self) -> &mut P {
        self.platform
    }

    pub fn into_context(self) -> TrustedContext<'a, S, F, H> {
        self.ctx
    }

    fn enter(&mut self, state: BootState) {
        log_entry!(self.log, "{:?} -> {:?}", self.state, state);
        self.state = state;
        let _ = self.history.push(state);
    }

    /// Runs from `Init` to an outcome.
    pub fn run(&mut self) -> BootOutcome {
        match self.verify() {
            Ok(()) => BootOutcome::Handoff,
            Err(fault) => self.crash_with(fault),
        }
    }

    fn verify(&mut self) -> Result<(), Fault> {
        self.platform.bring_up()?;
        self.enter(BootState::PeripheralsReady);

        self.ctx.meta.load()?;
        self.enter(BootState::MetadataLoaded);
        self.after_load();

        let compiled = self.settings.compiled;
        if !self.ctx.meta.is_first_boot() {
            // A rollback is treated as an attack: no repair.
            self.ctx.meta.check_version_rollback(compiled)?;
        }
        if self.ctx.meta.needs_provisioning(compiled) {
            self.enter(BootState::FirstBootProvision);
            self.provision()?;
        } else {
            self.enter(BootState::NormalVerify);
            self.verify_trusted()?;
        }

        self.enter(BootState::TrustedOk);
        self.enter(BootState::UntrustedCheck);
        self.check_untrusted()?;

        self.enter(BootState::Handoff);
        self.handoff()?;
        Ok(())
    }

    /// Housekeeping once the record is in: previous crash, ECC, and any
    /// update interrupted by a reset.
    fn after_load(&mut self) {
        let c = self.ctx.meta.counters();
        log_entry!(
            self.log,
            "boots {} crashes {} swaps {} repairs {}",
            c.boot_count,
            c.crash_count,
            c.swap_count,
            c.repair_count
        );

        if self.ctx.meta.is_crashed() {
            self.report_previous_crash();
        }

        if let Some(ecc) = self.platform.take_ecc_fault() {
            // Remediation is left to a reprogramming strategy we don't have.
            log_entry!(
                self.log,
                "ecc fault at {:#x} double={}",
                ecc.address,
                ecc.double
            );
        }

        if let Some(p) = self.ctx.meta.pending_update() {
            log_entry!(self.log, "update of {:?} was interrupted", p.bank);
            self.ctx.meta.set_valid(p.bank, Domain::Untrusted, false);
            self.ctx.meta.clear_pending_update();
        }
    }

    fn report_previous_crash(&mut self) {
        let mut buf = [0u8; PREVIOUS_LOG_WINDOW];
        if self.ctx.meta.store_mut().read(0, &mut buf).is_err() {
            return;
        }
        let mut count = 0;
        let mut last = None;
        for e in dump::entries(&buf).map_while(Result::ok) {
            count += 1;
            last = Some(e);
        }
        match last {
            Some(e) => log_entry!(
                self.log,
                "previous crash: {count}+ entries, last @{}: {}",
                e.timestamp,
                e.text
            ),
            None => log_entry!(self.log, "previous crash: no log"),
        }
    }

    fn provision(&mut self) -> Result<(), Fault> {
        let sel = self.ctx.banks.selector();
        let (cur, other) = (sel.current(), sel.other());
        let TrustedContext {
            meta,
            integrity,
            banks,
        } = &mut self.ctx;

        let td = banks.hash(integrity, cur, Domain::Trusted)?;
        meta.configure(sel, self.settings.compiled, &td)?;
        banks.repair_trusted_other_bank(integrity, meta)?;

        let ud = banks.hash(integrity, cur, Domain::Untrusted)?;
        meta.set_digest(cur, Domain::Untrusted, &ud);
        meta.set_valid(cur, Domain::Untrusted, true);
        meta.dump()?;
        banks.repair_untrusted(integrity, meta, cur, other)?;
        meta.finish_provisioning()?;
        log_entry!(self.log, "provisioned");
        Ok(())
    }

    fn verify_trusted(&mut self) -> Result<(), Fault> {
        let sel = self.ctx.banks.selector();
        let TrustedContext {
            meta,
            integrity,
            banks,
        } = &mut self.ctx;

        if !banks.check_trusted(integrity, meta, sel.current())? {
            // Never run or repair from unverified trusted code. Either the
            // other bank takes over after a reset, or nothing does.
            return if banks.check_trusted(integrity, meta, sel.other())? {
                Err(Fault::from(BootError::IntegrityMismatch))
            } else {
                Err(Fault::terminal(BootError::IntegrityMismatch))
            };
        }
        if !banks.check_trusted(integrity, meta, sel.other())? {
            banks.repair_trusted_other_bank(integrity, meta)?;
        }
        Ok(())
    }

    fn check_untrusted(&mut self) -> Result<(), Fault> {
        let TrustedContext {
            meta,
            integrity,
            banks,
        } = &mut self.ctx;

        let one = banks.check_untrusted(integrity, meta, BankId::One)?;
        let two = banks.check_untrusted(integrity, meta, BankId::Two)?;
        match (one, two) {
            (true, true) => Ok(()),
            (true, false) => {
                banks.repair_untrusted(
                    integrity,
                    meta,
                    BankId::One,
                    BankId::Two,
                )?;
                Ok(())
            }
            (false, true) => {
                banks.repair_untrusted(
                    integrity,
                    meta,
                    BankId::Two,
                    BankId::One,
                )?;
                Ok(())
            }
            (false, false) => {
                Err(Fault::terminal(BootError::IntegrityMismatch))
            }
        }
    }

    fn handoff(&mut self) -> Result<(), Fault> {
        if self.ctx.meta.is_crashed() {
            log_entry!(self.log, "recovered; crash handling re-armed");
            self.ctx.meta.clear_crashed();
        }
        self.ctx.meta.record_boot();
        self.ctx.meta.flush()?;

        self.retained.in_crash_handler = false;
        let _ = self.retained.store(self.platform.retained_ram());

        self.ctx.integrity.scrub();
        if self.settings.suspend_tick {
            self.platform.suspend_tick();
        }
        Ok(())
    }

    /// The fatal path, for faults raised outside the state machine.
    pub fn crash(&mut self, error: BootError) -> BootOutcome {
        self.crash_with(Fault::from(error))
    }

    fn crash_with(&mut self, fault: Fault) -> BootOutcome {
        let from = self.state;
        self.enter(BootState::ErrorCrashSwap);
        self.platform.disable_interrupts();
        self.platform.set_fault_indicator(true);
        log_entry!(self.log, "fault {:?} in {:?}", fault.error, from);

        let repeated = self.in_crash
            || self.retained.in_crash_handler
            || self.ctx.meta.is_crashed();
        self.in_crash = true;
        self.retained.in_crash_handler = true;
        self.retained.last_fault = Some(u8::from(fault.error));
        let _ = self.retained.store(self.platform.retained_ram());

        let loaded = self.history.contains(&BootState::MetadataLoaded);
        // Only a bank whose trusted image is on record as valid is worth
        // resetting into.
        let other = self.ctx.banks.selector().other();
        let fallback =
            loaded && self.ctx.meta.is_valid(other, Domain::Trusted);
        let swap = !repeated
            && !fault.terminal
            && fallback
            && self.settings.swap_policy == SwapPolicy::Reset;
        if repeated {
            log_entry!(self.log, "repeated crash; halting");
        } else if !fallback {
            log_entry!(self.log, "{other:?} trusted not valid; halting");
        }

        // Interrupts are off: nothing else is writing the ring.
        if let Err(e) = self.log.dump_to_store(self.ctx.meta.store_mut()) {
            log_entry!(self.log, "log dump failed: {e:?}");
        }

        // Before the record is loaded, a flush would overwrite it with a
        // blank one.
        if loaded {
            self.ctx.meta.mark_crashed();
            self.ctx.meta.record_crash();
            if swap {
                self.ctx.meta.record_swap();
            }
            // There's no further fallback if the store is gone.
            if let Err(e) = self.ctx.meta.flush() {
                log_entry!(self.log, "crash state not persisted: {e:?}");
            }
        }

        self.ctx.scrub();

        if swap {
            BootOutcome::SwapAndReset
        } else {
            BootOutcome::Halt
        }
    }
}
