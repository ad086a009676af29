// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated FRAM: a bit-level FM25CL64B behind mock SPI and GPIO, and a
//! plain in-memory [`ByteStore`] for tests that don't care about the wire.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};

use drv_sboot_api::{BlockProtect, BootError, ByteStore};
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

pub const FM25_SIZE: usize = 8192;

const WREN: u8 = 0x06;
const WRDI: u8 = 0x04;
const RDSR: u8 = 0x05;
const WRSR: u8 = 0x01;
const READ: u8 = 0x03;
const WRITE: u8 = 0x02;

const WEL: u8 = 1 << 1;
const BP0: u8 = 1 << 2;
const BP1: u8 = 1 << 3;
const WPEN: u8 = 1 << 7;
const SR_WRITABLE: u8 = BP0 | BP1 | WPEN;

/// Errors the mock SPI bus can be told to produce.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusFault {
    Timeout,
    Nack,
}

impl From<BusFault> for BootError {
    fn from(f: BusFault) -> Self {
        match f {
            BusFault::Timeout => BootError::Timeout,
            BusFault::Nack => BootError::IoFailure,
        }
    }
}

struct Chip {
    mem: Vec<u8>,
    status: u8,
    wp_high: bool,
    selected: bool,
    txn: Vec<u8>,
    clear_wel_on_deselect: bool,
    fault: Option<BusFault>,
    status_stuck: bool,
}

impl Chip {
    fn protected(&self, addr: usize) -> bool {
        let bp = match (self.status & BP1 != 0, self.status & BP0 != 0) {
            (false, false) => BlockProtect::None,
            (false, true) => BlockProtect::UpperQuarter,
            (true, false) => BlockProtect::UpperHalf,
            (true, true) => BlockProtect::All,
        };
        bp.covers(FM25_SIZE, addr)
    }

    fn select(&mut self) {
        self.selected = true;
        self.txn.clear();
    }

    fn deselect(&mut self) {
        self.selected = false;
        self.txn.clear();
        if self.clear_wel_on_deselect {
            self.status &= !WEL;
            self.clear_wel_on_deselect = false;
        }
    }

    /// Shifts one byte in, returns the byte shifted out.
    fn clock(&mut self, mosi: u8) -> u8 {
        if !self.selected {
            return 0xff;
        }
        self.txn.push(mosi);
        let n = self.txn.len();
        match self.txn[0] {
            WREN if n == 1 => {
                self.status |= WEL;
                0
            }
            WRDI if n == 1 => {
                self.status &= !WEL;
                0
            }
            RDSR if n >= 2 => self.status,
            WRSR if n == 2 => {
                let locked = self.status & WPEN != 0 && !self.wp_high;
                if self.status & WEL != 0 && !locked && !self.status_stuck {
                    self.status =
                        (self.status & !SR_WRITABLE) | (mosi & SR_WRITABLE);
                }
                self.clear_wel_on_deselect = true;
                0
            }
            READ if n >= 4 => {
                let addr = self.addr(n);
                self.mem[addr]
            }
            WRITE if n >= 4 => {
                let addr = self.addr(n);
                if self.status & WEL != 0 && !self.protected(addr) {
                    self.mem[addr] = mosi;
                }
                self.clear_wel_on_deselect = true;
                0
            }
            _ => 0,
        }
    }

    fn addr(&self, n: usize) -> usize {
        let base = usize::from(u16::from_be_bytes([self.txn[1], self.txn[2]]));
        (base + (n - 4)) & (FM25_SIZE - 1)
    }
}

/// Handle on a simulated FM25CL64B. Clones share the same chip.
#[derive(Clone)]
pub struct SimFm25 {
    chip: Arc<Mutex<Chip>>,
}

/// The SPI side of a [`SimFm25`].
pub struct SimSpi {
    chip: Arc<Mutex<Chip>>,
}

#[derive(Copy, Clone, Debug)]
enum PinKind {
    ChipSelect,
    WriteProtect,
}

/// A GPIO wired to a [`SimFm25`].
pub struct SimPin {
    chip: Arc<Mutex<Chip>>,
    kind: PinKind,
}

impl Default for SimFm25 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFm25 {
    /// A fresh chip: all zeroes, no protection, WP low.
    pub fn new() -> Self {
        Self {
            chip: Arc::new(Mutex::new(Chip {
                mem: vec![0; FM25_SIZE],
                status: 0,
                wp_high: false,
                selected: false,
                txn: Vec::new(),
                clear_wel_on_deselect: false,
                fault: None,
                status_stuck: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Chip> {
        self.chip.lock().unwrap()
    }

    /// SPI bus, chip select and write protect lines.
    pub fn bus(&self) -> (SimSpi, SimPin, SimPin) {
        (
            SimSpi {
                chip: self.chip.clone(),
            },
            SimPin {
                chip: self.chip.clone(),
                kind: PinKind::ChipSelect,
            },
            SimPin {
                chip: self.chip.clone(),
                kind: PinKind::WriteProtect,
            },
        )
    }

    pub fn peek(&self, addr: usize) -> u8 {
        self.lock().mem[addr]
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().mem.clone()
    }

    /// Writes directly into the array, ignoring protection.
    pub fn poke(&self, addr: usize, data: &[u8]) {
        self.lock().mem[addr..addr + data.len()].copy_from_slice(data);
    }

    pub fn fill(&self, byte: u8) {
        self.lock().mem.fill(byte);
    }

    pub fn status(&self) -> u8 {
        self.lock().status
    }

    pub fn wp_is_high(&self) -> bool {
        self.lock().wp_high
    }

    pub fn selected(&self) -> bool {
        self.lock().selected
    }

    /// The next bus operation fails with `fault`.
    pub fn inject_fault(&self, fault: BusFault) {
        self.lock().fault = Some(fault);
    }

    /// Makes WRSR silently ineffective.
    pub fn set_status_stuck(&self, stuck: bool) {
        self.lock().status_stuck = stuck;
    }

    /// Issues WREN + WRSR with WP held low, as errant firmware might.
    pub fn raw_write_status_with_wp_low(&self, bits: u8) {
        let mut chip = self.lock();
        chip.wp_high = false;
        for txn in [&[WREN][..], &[WRSR, bits][..]] {
            chip.select();
            for b in txn {
                chip.clock(*b);
            }
            chip.deselect();
        }
    }
}

impl SimSpi {
    fn run(
        &mut self,
        words: &mut dyn Iterator<Item = &mut u8>,
    ) -> Result<(), BusFault> {
        let mut chip = self.chip.lock().unwrap();
        if let Some(f) = chip.fault.take() {
            return Err(f);
        }
        for w in words {
            *w = chip.clock(*w);
        }
        Ok(())
    }
}

impl Write<u8> for SimSpi {
    type Error = BusFault;

    fn write(&mut self, words: &[u8]) -> Result<(), BusFault> {
        let mut scratch = words.to_vec();
        self.run(&mut scratch.iter_mut())
    }
}

impl Transfer<u8> for SimSpi {
    type Error = BusFault;

    fn transfer<'w>(
        &mut self,
        words: &'w mut [u8],
    ) -> Result<&'w [u8], BusFault> {
        self.run(&mut words.iter_mut())?;
        Ok(words)
    }
}

impl OutputPin for SimPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        let mut chip = self.chip.lock().unwrap();
        match self.kind {
            PinKind::ChipSelect => chip.select(),
            PinKind::WriteProtect => chip.wp_high = false,
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        let mut chip = self.chip.lock().unwrap();
        match self.kind {
            PinKind::ChipSelect => chip.deselect(),
            PinKind::WriteProtect => chip.wp_high = true,
        }
        Ok(())
    }
}

/// An in-memory byte store with FRAM-like protection semantics and fault
/// injection.
pub struct MemStore {
    mem: Vec<u8>,
    protect: BlockProtect,
    fail_read: Option<BootError>,
    fail_write: Option<BootError>,
    refuse_lock: bool,
    writes: usize,
}

impl MemStore {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            protect: BlockProtect::None,
            fail_read: None,
            fail_write: None,
            refuse_lock: false,
            writes: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mem
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    pub fn current_protection(&self) -> BlockProtect {
        self.protect
    }

    /// Number of successful `write` calls.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn fail_next_read(&mut self, e: BootError) {
        self.fail_read = Some(e);
    }

    pub fn fail_next_write(&mut self, e: BootError) {
        self.fail_write = Some(e);
    }

    /// Any attempt to enable protection will not take.
    pub fn refuse_lock(&mut self, refuse: bool) {
        self.refuse_lock = refuse;
    }
}

impl ByteStore for MemStore {
    fn size(&self) -> usize {
        self.mem.len()
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), BootError> {
        if let Some(e) = self.fail_read.take() {
            return Err(e);
        }
        let src = self
            .mem
            .get(addr..addr + buf.len())
            .ok_or(BootError::AddressOutOfRange)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), BootError> {
        if let Some(e) = self.fail_write.take() {
            return Err(e);
        }
        if addr + data.len() > self.mem.len() {
            return Err(BootError::AddressOutOfRange);
        }
        let size = self.mem.len();
        for (i, b) in data.iter().enumerate() {
            if !self.protect.covers(size, addr + i) {
                self.mem[addr + i] = *b;
            }
        }
        self.writes += 1;
        Ok(())
    }

    fn protection(&mut self) -> Result<BlockProtect, BootError> {
        Ok(self.protect)
    }

    fn set_protection(
        &mut self,
        protect: BlockProtect,
    ) -> Result<(), BootError> {
        if self.refuse_lock && protect != BlockProtect::None {
            return Err(BootError::LockStateError);
        }
        self.protect = protect;
        Ok(())
    }
}
