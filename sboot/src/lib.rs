// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure-world boot and update manager.
//!
//! On every reset [`boot_main`] decides whether the executing bank's trusted
//! image may run, repairs whatever the other bank is missing, checks both
//! untrusted images, and hands off. Anything it can't fix ends in a bank
//! swap through a reset, or a halt. After handoff the trusted state lives on
//! in an [`NscGateway`] serving the untrusted world.
//!
//! The board supplies the hardware through the traits in `drv-sboot-api`.

#![cfg_attr(not(test), no_std)]

use crash_log::{log_entry, LogRing};
use drv_sboot_api::{ByteStore, CryptoHashEngine, FlashController, Platform};

pub mod config;
mod context;
mod nsc;
mod orchestrator;

pub use config::{Settings, SwapPolicy};
pub use context::TrustedContext;
pub use nsc::{NscGateway, UpdateRecordBuf};
pub use orchestrator::{BootOutcome, BootState, Orchestrator};

/// The log ring as sized for this board.
pub type BootLog = LogRing<{ config::LOG_RING_SIZE }>;

/// Boots, then leaves through the outcome: into the untrusted world, into a
/// reset with banks swapped, or into a halt.
///
/// On handoff, `install` receives the trusted context first, so the board
/// can put it behind its trust-boundary gateway.
pub fn boot_main<'a, P, S, F, H>(
    platform: &mut P,
    store: S,
    flash: F,
    hasher: H,
    log: &'a BootLog,
    settings: Settings,
    install: impl FnOnce(TrustedContext<'a, S, F, H>),
) -> !
where
    P: Platform,
    S: ByteStore,
    F: FlashController,
    H: CryptoHashEngine,
{
    let orchestrator =
        Orchestrator::new(&mut *platform, store, flash, hasher, log, settings);
    let outcome = match orchestrator {
        Ok(mut o) => {
            let outcome = o.run();
            if outcome == BootOutcome::Handoff {
                install(o.into_context());
            }
            outcome
        }
        Err(e) => {
            log_entry!(log, "init failed: {e:?}");
            BootOutcome::Halt
        }
    };

    match outcome {
        BootOutcome::Handoff => platform.enter_untrusted(),
        BootOutcome::SwapAndReset => platform.reset_into_other_bank(),
        BootOutcome::Halt => {
            platform.set_fault_indicator(true);
            platform.halt()
        }
    }
}
