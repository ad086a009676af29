// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use drv_sboot_api::{
    BankSelector, BootError, EccFault, NscHooks, Platform, DEVICE_UID_SZ,
};

/// Things the boot core asked the SoC to do, in order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlatformEvent {
    BroughtUp,
    InterruptsDisabled,
    FaultIndicator(bool),
    TickSuspended,
    TickResumed,
}

pub struct SimPlatform {
    pub selector: BankSelector,
    pub uid: [u8; DEVICE_UID_SZ],
    pub retained: Vec<u8>,
    pub ecc: Option<EccFault>,
    pub bring_up_error: Option<BootError>,
    events: Vec<PlatformEvent>,
}

impl SimPlatform {
    pub fn new(swapped: bool) -> Self {
        Self {
            selector: BankSelector::new(swapped),
            uid: *b"SIMUID000001",
            retained: vec![0; 64],
            ecc: None,
            bring_up_error: None,
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[PlatformEvent] {
        &self.events
    }

    pub fn fault_indicator(&self) -> bool {
        self.events
            .iter()
            .rev()
            .find_map(|e| match e {
                PlatformEvent::FaultIndicator(on) => Some(*on),
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn tick_running(&self) -> bool {
        !matches!(
            self.events
                .iter()
                .rev()
                .find(|e| matches!(
                    e,
                    PlatformEvent::TickSuspended | PlatformEvent::TickResumed
                )),
            Some(PlatformEvent::TickSuspended)
        )
    }

    /// A power cycle: retained RAM is lost.
    pub fn power_cycle(&mut self) {
        self.retained.fill(0xa5);
        self.events.clear();
    }
}

impl Platform for SimPlatform {
    fn bring_up(&mut self) -> Result<(), BootError> {
        if let Some(e) = self.bring_up_error.take() {
            return Err(e);
        }
        self.events.push(PlatformEvent::BroughtUp);
        Ok(())
    }

    fn bank_selector(&self) -> BankSelector {
        self.selector
    }

    fn device_uid(&self) -> [u8; DEVICE_UID_SZ] {
        self.uid
    }

    fn retained_ram(&mut self) -> &mut [u8] {
        &mut self.retained
    }

    fn disable_interrupts(&mut self) {
        self.events.push(PlatformEvent::InterruptsDisabled);
    }

    fn set_fault_indicator(&mut self, asserted: bool) {
        self.events.push(PlatformEvent::FaultIndicator(asserted));
    }

    fn suspend_tick(&mut self) {
        self.events.push(PlatformEvent::TickSuspended);
    }

    fn resume_tick(&mut self) {
        self.events.push(PlatformEvent::TickResumed);
    }

    fn take_ecc_fault(&mut self) -> Option<EccFault> {
        self.ecc.take()
    }

    fn reset_into_other_bank(&mut self) -> ! {
        panic!("reset into other bank");
    }

    fn halt(&mut self) -> ! {
        panic!("halted");
    }

    fn enter_untrusted(&mut self) -> ! {
        panic!("entered untrusted world");
    }
}

/// Trust-boundary hooks that count what they were asked to do.
#[derive(Default)]
pub struct SimNscHooks {
    running: AtomicBool,
    suspends: AtomicUsize,
    resumes: AtomicUsize,
    ecc: Mutex<Option<EccFault>>,
}

impl SimNscHooks {
    /// Starts out as the boot path leaves it: tick suspended.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn suspends(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn latch_ecc(&self, fault: EccFault) {
        *self.ecc.lock().unwrap() = Some(fault);
    }
}

impl NscHooks for SimNscHooks {
    fn suspend_tick(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.suspends.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_tick(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn take_ecc_fault(&self) -> Option<EccFault> {
        self.ecc.lock().unwrap().take()
    }
}
