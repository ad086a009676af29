// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API for the secure boot manager.
//!
//! This crate holds the vocabulary shared by every part of the boot core:
//! the error kinds, the naming of banks and domains, the flash region layout,
//! and the traits through which the core reaches hardware. Drivers implement
//! the traits; the boot core is generic over them, which is what lets the
//! whole thing run on a host with simulated parts.

#![cfg_attr(not(test), no_std)]

use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

mod layout;

pub use layout::{FlashLayout, Region};

/// Size in bytes of a SHA-256 digest.
pub const SHA256_SZ: usize = 32;

pub type Sha256Digest = [u8; SHA256_SZ];

/// Size of the device unique identifier, in bytes.
pub const DEVICE_UID_SZ: usize = 12;

/// Errors produced anywhere in the boot core.
///
/// The numeric values are stable; they cross the trust boundary as a single
/// byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum BootError {
    /// Nonvolatile store or flash transport failure.
    IoFailure = 1,
    /// The resource is already in use (e.g. the hash engine).
    Busy = 2,
    Timeout = 3,
    ParameterInvalid = 4,
    AlignmentViolation = 5,
    AddressOutOfRange = 6,
    /// A digest or signature did not match.
    IntegrityMismatch = 7,
    RollbackDetected = 8,
    /// A log ring length field failed its sanity check.
    CorruptionDetected = 9,
    /// A region lock or unlock did not take effect.
    LockStateError = 10,
    /// An update call arrived with no open update session.
    UpdateNotStarted = 11,
}

/// How the boot core is allowed to react to an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport trouble; the caller may retry within its own budget.
    Transport,
    /// Trust state is in question; always reaches the fatal path.
    Integrity,
    /// A bug in the caller. Never retried.
    Programmer,
}

impl BootError {
    pub fn class(self) -> ErrorClass {
        match self {
            BootError::IoFailure | BootError::Busy | BootError::Timeout => {
                ErrorClass::Transport
            }
            BootError::IntegrityMismatch
            | BootError::RollbackDetected
            | BootError::CorruptionDetected
            | BootError::LockStateError => ErrorClass::Integrity,
            BootError::ParameterInvalid
            | BootError::AlignmentViolation
            | BootError::AddressOutOfRange
            | BootError::UpdateNotStarted => ErrorClass::Programmer,
        }
    }

    pub fn is_retryable(self) -> bool {
        self.class() == ErrorClass::Transport
    }
}

impl From<BootError> for u8 {
    fn from(e: BootError) -> Self {
        e as u8
    }
}

impl TryFrom<u8> for BootError {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        num_traits::FromPrimitive::from_u8(code).ok_or(code)
    }
}

/// Logical bank number.
///
/// Which of the two is executing depends on the [`BankSelector`].
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub enum BankId {
    One,
    Two,
}

impl BankId {
    pub const ALL: [BankId; 2] = [BankId::One, BankId::Two];

    pub fn index(self) -> usize {
        match self {
            BankId::One => 0,
            BankId::Two => 1,
        }
    }

    pub fn opposite(self) -> BankId {
        match self {
            BankId::One => BankId::Two,
            BankId::Two => BankId::One,
        }
    }
}

/// Privilege partition of a bank.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub enum Domain {
    Trusted,
    Untrusted,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Trusted, Domain::Untrusted];

    pub fn index(self) -> usize {
        match self {
            Domain::Trusted => 0,
            Domain::Untrusted => 1,
        }
    }
}

/// Maps logical bank numbers to the executing ("current") and standby
/// ("other") banks.
///
/// The value comes from immutable hardware configuration (the bank swap
/// option bit) and only changes across a reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BankSelector {
    swapped: bool,
}

impl BankSelector {
    pub const fn new(swapped: bool) -> Self {
        Self { swapped }
    }

    pub fn is_swapped(self) -> bool {
        self.swapped
    }

    /// The bank we are executing from.
    pub fn current(self) -> BankId {
        if self.swapped {
            BankId::Two
        } else {
            BankId::One
        }
    }

    pub fn other(self) -> BankId {
        self.current().opposite()
    }

    pub fn is_current(self, bank: BankId) -> bool {
        self.current() == bank
    }
}

/// Firmware/record version, ordered lexicographically on
/// (major, minor, patch).
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub struct SchemaVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl SchemaVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl core::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Affine coordinates of a P-256 public key, big-endian.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EcdsaPublicKey {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl EcdsaPublicKey {
    /// SEC1 uncompressed encoding: `0x04 || X || Y`.
    pub fn to_sec1_uncompressed(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[0] = 0x04;
        out[1..33].copy_from_slice(&self.x);
        out[33..].copy_from_slice(&self.y);
        out
    }
}

/// A detached two-part ECDSA signature, big-endian scalars.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EcdsaSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// Software write-protect ranges of a byte store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockProtect {
    None,
    UpperQuarter,
    UpperHalf,
    All,
}

impl BlockProtect {
    /// First protected address for a store of `size` bytes, or `size` if
    /// nothing is protected.
    pub fn start(self, size: usize) -> usize {
        match self {
            BlockProtect::None => size,
            BlockProtect::UpperQuarter => size - size / 4,
            BlockProtect::UpperHalf => size / 2,
            BlockProtect::All => 0,
        }
    }

    pub fn covers(self, size: usize, addr: usize) -> bool {
        addr >= self.start(size) && addr < size
    }

    /// The smallest protected range that contains everything from `addr` to
    /// the end of a store of `size` bytes.
    pub fn smallest_covering(size: usize, addr: usize) -> BlockProtect {
        [
            BlockProtect::UpperQuarter,
            BlockProtect::UpperHalf,
            BlockProtect::All,
        ]
        .into_iter()
        .find(|p| p.start(size) <= addr)
        .unwrap_or(BlockProtect::All)
    }
}

/// A small nonvolatile byte-addressed store with range write protection.
pub trait ByteStore {
    /// Size of the address space in bytes.
    fn size(&self) -> usize;

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), BootError>;

    /// Writes `data` at `addr`. Writes into a protected range are dropped by
    /// the device; callers that care verify by reading back.
    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), BootError>;

    fn protection(&mut self) -> Result<BlockProtect, BootError>;

    /// Changes the protected range. Implementations read the setting back
    /// and return [`BootError::LockStateError`] if it did not take.
    fn set_protection(
        &mut self,
        protect: BlockProtect,
    ) -> Result<(), BootError>;
}

/// Program/erase access to the dual-bank internal flash.
///
/// Addresses are absolute. The controller is locked at reset and must be
/// unlocked before erase or program.
pub trait FlashController {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), BootError>;

    fn unlock(&mut self) -> Result<(), BootError>;

    fn lock(&mut self) -> Result<(), BootError>;

    fn is_locked(&self) -> bool;

    /// Erases the sector starting at `addr`, which must be sector aligned.
    fn erase_sector(&mut self, addr: u32) -> Result<(), BootError>;

    /// Programs `data` at `addr`. Both must be multiples of the program
    /// granule and the target must be erased.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), BootError>;
}

/// A SHA-256 accelerator.
///
/// Only one computation may be in flight. `finish` returns
/// `nb::Error::WouldBlock` until the accelerator has produced the digest.
pub trait CryptoHashEngine {
    /// Natural input word size of the accelerator, in bytes.
    const WORD_SIZE: usize;

    fn start(&mut self) -> Result<(), BootError>;

    fn feed(&mut self, data: &[u8]) -> Result<(), BootError>;

    fn finish(&mut self) -> nb::Result<Sha256Digest, BootError>;
}

/// P-256 ECDSA verification of a prehashed digest.
pub trait SignatureVerifier {
    /// Returns `Ok(false)` for a well-formed signature that does not verify.
    /// Malformed keys or signatures are [`BootError::ParameterInvalid`].
    fn verify(
        &mut self,
        digest: &Sha256Digest,
        signature: &EcdsaSignature,
        key: &EcdsaPublicKey,
    ) -> Result<bool, BootError>;
}

/// A latched ECC fault reported by the flash or SRAM controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EccFault {
    pub address: u32,
    /// Double-bit (uncorrectable) rather than single-bit.
    pub double: bool,
}

/// Everything the orchestrator needs from the SoC that isn't flash, crypto
/// or the byte store.
pub trait Platform {
    /// Clocks, GPIO and buses. Includes waiting out device power-up times.
    fn bring_up(&mut self) -> Result<(), BootError>;

    fn bank_selector(&self) -> BankSelector;

    fn device_uid(&self) -> [u8; DEVICE_UID_SZ];

    /// RAM that survives a reset but not a power cycle.
    fn retained_ram(&mut self) -> &mut [u8];

    fn disable_interrupts(&mut self);

    fn set_fault_indicator(&mut self, asserted: bool);

    fn suspend_tick(&mut self);

    fn resume_tick(&mut self);

    fn take_ecc_fault(&mut self) -> Option<EccFault>;

    /// Toggles the bank swap option and resets.
    fn reset_into_other_bank(&mut self) -> !;

    fn halt(&mut self) -> !;

    fn enter_untrusted(&mut self) -> !;
}

/// What trust-boundary entry points may touch on the SoC once the untrusted
/// world is running. These are single register accesses, callable from any
/// thread without coordination.
pub trait NscHooks: Sync {
    fn suspend_tick(&self);

    fn resume_tick(&self);

    fn take_ecc_fault(&self) -> Option<EccFault>;
}
