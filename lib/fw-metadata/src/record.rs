// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_sboot_api::{BankId, Domain, SchemaVersion, Sha256Digest};
use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Capacity of the opaque record the untrusted world may park with us.
pub const UPDATE_RECORD_CAPACITY: usize = 64;

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub struct DigestEntry {
    pub valid: bool,
    pub digest: Sha256Digest,
}

/// An untrusted-image update that was started but not yet finished.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize,
)]
pub struct PendingUpdate {
    pub bank: BankId,
    pub expected: Sha256Digest,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize,
)]
pub struct UpdateRecord {
    len: u8,
    #[serde(with = "BigArray")]
    data: [u8; UPDATE_RECORD_CAPACITY],
}

impl UpdateRecord {
    pub const EMPTY: Self = Self {
        len: 0,
        data: [0; UPDATE_RECORD_CAPACITY],
    };

    /// `None` if `bytes` doesn't fit.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > UPDATE_RECORD_CAPACITY {
            return None;
        }
        let mut data = [0; UPDATE_RECORD_CAPACITY];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            len: bytes.len() as u8,
            data,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = usize::from(self.len).min(UPDATE_RECORD_CAPACITY);
        &self.data[..len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The durable trust state.
///
/// Digests are only reachable through [`crate::MetadataStore`]; there is no
/// public way to get at the raw bytes for comparison.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize,
)]
pub struct MetadataRecord {
    pub(crate) version: SchemaVersion,
    pub(crate) device_id: u32,
    pub(crate) crashed: bool,
    /// Set by `configure`, cleared once both banks have been mirrored.
    pub(crate) provisioning: bool,
    /// Indexed `[bank][domain]`.
    pub(crate) slots: [[DigestEntry; 2]; 2],
    pub(crate) pending_update: Option<PendingUpdate>,
    pub(crate) update_record: UpdateRecord,
}

impl MetadataRecord {
    /// What an erased or unreadable store amounts to. Version 0.0.0 is older
    /// than anything we build, so this always routes to provisioning.
    pub const UNPROVISIONED: Self = Self {
        version: SchemaVersion::new(0, 0, 0),
        device_id: 0,
        crashed: false,
        provisioning: false,
        slots: [[DigestEntry {
            valid: false,
            digest: [0; 32],
        }; 2]; 2],
        pending_update: None,
        update_record: UpdateRecord::EMPTY,
    };

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn crashed(&self) -> bool {
        self.crashed
    }

    pub fn provisioning(&self) -> bool {
        self.provisioning
    }

    pub fn is_valid(&self, bank: BankId, domain: Domain) -> bool {
        self.slot(bank, domain).valid
    }

    pub fn pending_update(&self) -> Option<PendingUpdate> {
        self.pending_update
    }

    pub(crate) fn slot(&self, bank: BankId, domain: Domain) -> &DigestEntry {
        &self.slots[bank.index()][domain.index()]
    }

    pub(crate) fn slot_mut(
        &mut self,
        bank: BankId,
        domain: Domain,
    ) -> &mut DigestEntry {
        &mut self.slots[bank.index()][domain.index()]
    }
}

/// Event counters, persisted separately from the record.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub struct BootCounters {
    pub boot_count: u32,
    pub crash_count: u32,
    pub swap_count: u32,
    pub repair_count: u32,
}
