// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading back a dumped log.

use drv_sboot_api::BootError;
use zerocopy::FromBytes;

use crate::{
    EntryKind, LogEntryHeader, END_MARKER, HEADER_SIZE, MAX_ENTRY_SIZE,
};

/// One entry out of a dump.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DumpedEntry<'a> {
    pub kind: u8,
    /// Entry length, header included.
    pub len: usize,
    pub timestamp: u32,
    /// Payload up to the NUL, cut short at the first invalid UTF-8.
    pub text: &'a str,
}

impl DumpedEntry<'_> {
    pub fn kind(&self) -> Option<EntryKind> {
        num_traits::FromPrimitive::from_u8(self.kind)
    }
}

/// Walks the entries of a dump until the end marker.
///
/// A length field that is out of range or runs off the end of `bytes`
/// produces one `Err(CorruptionDetected)`, after which iteration stops.
pub fn entries(bytes: &[u8]) -> Entries<'_> {
    Entries {
        bytes,
        done: false,
    }
}

pub struct Entries<'a> {
    bytes: &'a [u8],
    done: bool,
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<DumpedEntry<'a>, BootError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Ok((header, _)) = LogEntryHeader::read_from_prefix(self.bytes)
        else {
            self.done = true;
            return Some(Err(BootError::CorruptionDetected));
        };
        if self.bytes[..HEADER_SIZE] == END_MARKER {
            self.done = true;
            return None;
        }
        let len = usize::from(header.len);
        if !(HEADER_SIZE..=MAX_ENTRY_SIZE).contains(&len)
            || len > self.bytes.len()
        {
            self.done = true;
            return Some(Err(BootError::CorruptionDetected));
        }

        let (entry, rest) = self.bytes.split_at(len);
        self.bytes = rest;

        let payload = &entry[HEADER_SIZE..];
        let payload = match payload.iter().position(|b| *b == 0) {
            Some(nul) => &payload[..nul],
            None => payload,
        };
        let text = match core::str::from_utf8(payload) {
            Ok(t) => t,
            Err(e) => {
                // valid_up_to is always a char boundary
                core::str::from_utf8(&payload[..e.valid_up_to()])
                    .unwrap_or_default()
            }
        };

        Some(Ok(DumpedEntry {
            kind: header.kind,
            len,
            timestamp: header.timestamp.get(),
            text,
        }))
    }
}
