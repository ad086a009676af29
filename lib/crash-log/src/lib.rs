// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crash-safe log ring.
//!
//! A power-of-two sized byte ring holding variable-length text entries, with
//! any number of concurrent writers and no locks. It is written from both
//! sides of the trust boundary and from inside the fatal-error handler, and
//! only ever read by [`LogRing::dump_to_store`] once interrupts are off.
//!
//! ## Entry format
//!
//! ```text
//! [kind:1][len:1][timestamp:4, LE][payload: len - 6 bytes, NUL-terminated]
//! ```
//!
//! `kind` is [`EntryKind`]. `len` covers the header. A zero `len` is a
//! filler: the rest of the ring up to the physical end is unused, and the
//! next entry starts at offset 0. Entries never straddle the physical end.
//!
//! ## Positions
//!
//! `head` and `tail` are byte positions that only ever grow; they are masked
//! when used as indices. `head - tail <= N` always holds. Writers claim
//! space by CAS on `head`, evicting from `tail` (also by CAS) when the ring
//! is full.
//!
//! ## Writing
//!
//! Use [`log_entry!`] with anything implementing [`LogSink`]:
//!
//! ```ignore
//! log_entry!(log, "bank {:?} untrusted digest mismatch", bank);
//! ```

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use drv_sboot_api::{BootError, ByteStore};
use num_derive::FromPrimitive;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub mod dump;

pub const HEADER_SIZE: usize = core::mem::size_of::<LogEntryHeader>();

/// Largest entry, header included. The length field is one byte.
pub const MAX_ENTRY_SIZE: usize = 255;

/// Largest payload, terminating NUL included.
pub const MAX_PAYLOAD: usize = MAX_ENTRY_SIZE - HEADER_SIZE;

/// Written after the last entry of a dump.
pub const END_MARKER: [u8; HEADER_SIZE] = [0, HEADER_SIZE as u8, 0, 0, 0, 0];

/// Bad length fields tolerated in a row while evicting.
const CORRUPTION_LIMIT: u32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum EntryKind {
    Invalid = 0,
    Empty = 1,
    Committed = 2,
}

/// On-wire entry header.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct LogEntryHeader {
    pub kind: u8,
    pub len: u8,
    pub timestamp: U32,
}

/// Something that accepts formatted log lines.
pub trait LogSink: Sync {
    fn log(&self, args: fmt::Arguments<'_>);
}

/// Formats a line into a [`LogSink`].
#[macro_export]
macro_rules! log_entry {
    ($log:expr, $($arg:tt)*) => {
        $crate::LogSink::log($log, format_args!($($arg)*))
    };
}

/// A claimed span of the ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// `head` before the claim.
    pub old_head: usize,
    /// Where the entry starts; past `old_head` if a filler was needed.
    pub start: usize,
    /// `head` after the claim.
    pub new_head: usize,
}

/// Event counts since construction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub committed: u32,
    pub evicted: u32,
    pub shrunk: u32,
    pub fillers: u32,
    /// Writes abandoned because eviction hit corruption.
    pub dropped: u32,
}

/// What a dump wrote.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DumpSummary {
    pub entries: usize,
    /// Bytes of entries, not counting the end marker.
    pub bytes: usize,
}

/// What lives at a ring position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Span {
    /// Unused space up to the physical end.
    Filler(usize),
    Entry { kind: u8, len: usize },
}

impl Span {
    fn len(self) -> usize {
        match self {
            Span::Filler(n) => n,
            Span::Entry { len, .. } => len,
        }
    }
}

pub struct LogRing<const N: usize> {
    buf: [AtomicU8; N],
    head: AtomicUsize,
    tail: AtomicUsize,
    clock: fn() -> u32,
    committed: AtomicU32,
    evicted: AtomicU32,
    shrunk: AtomicU32,
    fillers: AtomicU32,
    dropped: AtomicU32,
}

impl<const N: usize> LogRing<N> {
    const MASK: usize = N - 1;

    const SIZE_OK: () = assert!(
        N.is_power_of_two() && N >= 2 * MAX_ENTRY_SIZE,
        "log ring must be a power of two holding at least two entries"
    );

    /// An empty ring taking timestamps from `clock`.
    pub const fn new(clock: fn() -> u32) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::SIZE_OK;
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU8 = AtomicU8::new(0);
        Self {
            buf: [ZERO; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            clock,
            committed: AtomicU32::new(0),
            evicted: AtomicU32::new(0),
            shrunk: AtomicU32::new(0),
            fillers: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// `(head, tail)`, unmasked.
    pub fn positions(&self) -> (usize, usize) {
        (
            self.head.load(Ordering::Acquire),
            self.tail.load(Ordering::Acquire),
        )
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            committed: self.committed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            shrunk: self.shrunk.load(Ordering::Relaxed),
            fillers: self.fillers.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn get(&self, pos: usize) -> u8 {
        self.buf[pos & Self::MASK].load(Ordering::Relaxed)
    }

    fn put(&self, pos: usize, byte: u8) {
        self.buf[pos & Self::MASK].store(byte, Ordering::Relaxed);
    }

    fn room_before_wrap(pos: usize) -> usize {
        N - (pos & Self::MASK)
    }

    /// Classifies the bytes at `pos`, or `None` if the length is insane.
    fn span_at(&self, pos: usize) -> Option<Span> {
        let room = Self::room_before_wrap(pos);
        if room < HEADER_SIZE {
            return Some(Span::Filler(room));
        }
        let kind = self.buf[pos & Self::MASK].load(Ordering::Acquire);
        let len = usize::from(self.get(pos + 1));
        if len == 0 {
            Some(Span::Filler(room))
        } else if (HEADER_SIZE..=MAX_ENTRY_SIZE).contains(&len) && len <= room
        {
            Some(Span::Entry { kind, len })
        } else {
            None
        }
    }

    /// Advances `tail` until `end - tail <= N`, invalidating what it passes.
    ///
    /// Gives up with [`BootError::CorruptionDetected`] after
    /// `CORRUPTION_LIMIT` unreadable lengths in a row.
    pub fn evict_until(&self, end: usize) -> Result<(), BootError> {
        let mut bad = 0;
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // `end` may be stale: another writer can have evicted past it.
            if end.saturating_sub(tail) <= N {
                return Ok(());
            }
            let head = self.head.load(Ordering::Acquire);
            if tail >= head {
                return Ok(());
            }
            let Some(span) = self.span_at(tail) else {
                bad += 1;
                if bad >= CORRUPTION_LIMIT {
                    return Err(BootError::CorruptionDetected);
                }
                continue;
            };
            bad = 0;
            if self
                .tail
                .compare_exchange_weak(
                    tail,
                    // A length byte not yet shrunk can point past `head`.
                    (tail + span.len()).min(head),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if let Span::Entry { .. } = span {
                    self.buf[tail & Self::MASK]
                        .store(EntryKind::Invalid as u8, Ordering::Release);
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Claims `size` contiguous bytes.
    ///
    /// If the claim would cross the physical end, the remainder is stamped
    /// as a filler and the entry starts at offset 0 instead.
    pub fn reserve(&self, size: usize) -> Result<Reservation, BootError> {
        if !(HEADER_SIZE..=MAX_ENTRY_SIZE).contains(&size) {
            return Err(BootError::ParameterInvalid);
        }
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if tail > old_head {
                // An entry was evicted before its writer gave back the
                // unused part. The ring is empty; restart it at `tail`.
                let _ = self.head.compare_exchange(
                    old_head,
                    tail,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            let room = Self::room_before_wrap(old_head);
            let start = if size > room { old_head + room } else { old_head };
            let new_head = start + size;

            self.evict_until(new_head)?;

            if self
                .head
                .compare_exchange_weak(
                    old_head,
                    new_head,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if start != old_head {
                    self.stamp_filler(old_head, room);
                }
                return Ok(Reservation {
                    old_head,
                    start,
                    new_head,
                });
            }
        }
    }

    fn stamp_filler(&self, pos: usize, room: usize) {
        if room >= 2 {
            self.put(pos + 1, 0);
        }
        self.buf[pos & Self::MASK]
            .store(EntryKind::Empty as u8, Ordering::Release);
        self.fillers.fetch_add(1, Ordering::Relaxed);
    }

    /// Formats `args` into a new entry.
    ///
    /// The full maximum is claimed first and given back afterwards only if
    /// nobody has claimed space behind us in the meantime. Messages longer
    /// than [`MAX_PAYLOAD`] are truncated on a character boundary.
    pub fn write(&self, args: fmt::Arguments<'_>) -> Result<(), BootError> {
        let r = match self.reserve(MAX_ENTRY_SIZE) {
            Ok(r) => r,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let at = r.start;
        let header = LogEntryHeader {
            kind: EntryKind::Invalid as u8,
            len: MAX_ENTRY_SIZE as u8,
            timestamp: U32::new((self.clock)()),
        };
        for (i, b) in header.as_bytes().iter().enumerate() {
            self.put(at + i, *b);
        }

        let mut cursor = Cursor {
            ring: self,
            at: at + HEADER_SIZE,
            // leave room for the NUL
            end: at + MAX_ENTRY_SIZE - 1,
        };
        let _ = fmt::write(&mut cursor, args);
        self.put(cursor.at, 0);
        let used = cursor.at + 1 - at;

        if used < MAX_ENTRY_SIZE
            && self
                .head
                .compare_exchange(
                    r.new_head,
                    at + used,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            self.put(at + 1, used as u8);
            self.shrunk.fetch_add(1, Ordering::Relaxed);
        }

        self.buf[at & Self::MASK]
            .store(EntryKind::Committed as u8, Ordering::Release);
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copies the newest committed entries to the bottom of `store`,
    /// followed by [`END_MARKER`].
    ///
    /// Only the lower half of the store is used. Older entries are skipped
    /// until everything from there to `head` fits.
    ///
    /// This does no synchronization with writers: call it only once
    /// interrupts are disabled.
    pub fn dump_to_store<S: ByteStore>(
        &self,
        store: &mut S,
    ) -> Result<DumpSummary, BootError> {
        let budget = (store.size() / 2)
            .checked_sub(HEADER_SIZE)
            .ok_or(BootError::ParameterInvalid)?;
        let (head, mut pos) = self.positions();

        while head.saturating_sub(pos) > budget {
            let span =
                self.span_at(pos).ok_or(BootError::CorruptionDetected)?;
            pos = (pos + span.len()).min(head);
        }

        let mut scratch = [0u8; MAX_ENTRY_SIZE];
        let mut out = 0;
        let mut entries = 0;
        while pos < head {
            let span =
                self.span_at(pos).ok_or(BootError::CorruptionDetected)?;
            if let Span::Entry { kind, len } = span {
                if kind >= EntryKind::Committed as u8 {
                    for (i, b) in scratch[..len].iter_mut().enumerate() {
                        *b = self.get(pos + i);
                    }
                    store.write(out, &scratch[..len])?;
                    out += len;
                    entries += 1;
                }
            }
            pos += span.len();
        }
        store.write(out, &END_MARKER)?;

        Ok(DumpSummary {
            entries,
            bytes: out,
        })
    }
}

impl<const N: usize> LogSink for LogRing<N> {
    fn log(&self, args: fmt::Arguments<'_>) {
        // Failures are already counted in `dropped`; there is nowhere else
        // to report them.
        let _ = self.write(args);
    }
}

/// Formats straight into reserved ring bytes.
struct Cursor<'a, const N: usize> {
    ring: &'a LogRing<N>,
    at: usize,
    end: usize,
}

impl<const N: usize> fmt::Write for Cursor<'_, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let avail = self.end - self.at;
        let mut n = s.len().min(avail);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        for b in &s.as_bytes()[..n] {
            self.ring.put(self.at, *b);
            self.at += 1;
        }
        if n < s.len() {
            // Stop formatting; the rest would be truncated anyway.
            return Err(fmt::Error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_mock_sboot_hw::MemStore;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn zero_clock() -> u32 {
        0
    }

    fn tick_clock() -> u32 {
        use std::sync::atomic::AtomicU32;
        static T: AtomicU32 = AtomicU32::new(100);
        T.fetch_add(1, Ordering::Relaxed)
    }

    fn dumped<const N: usize>(ring: &LogRing<N>) -> Vec<(u8, String)> {
        let mut store = MemStore::new(8192);
        ring.dump_to_store(&mut store).unwrap();
        dump::entries(&store.bytes()[..4096])
            .map(|e| {
                let e = e.unwrap();
                (e.kind, e.text.to_string())
            })
            .collect()
    }

    #[test]
    fn entry_layout_on_the_wire() {
        let ring = LogRing::<1024>::new(|| 0x0403_0201);
        log_entry!(&ring, "hi {}", 7);
        assert_eq!(ring.positions(), (11, 0));
        let bytes: Vec<u8> = (0..11).map(|i| ring.get(i)).collect();
        assert_eq!(bytes, [2, 11, 1, 2, 3, 4, b'h', b'i', b' ', b'7', 0]);
    }

    #[test]
    fn long_messages_are_truncated_on_a_char_boundary() {
        let ring = LogRing::<1024>::new(zero_clock);
        let long = "é".repeat(200);
        log_entry!(&ring, "{}", long);
        let got = dumped(&ring);
        assert_eq!(got.len(), 1);
        assert!(got[0].1.len() <= MAX_PAYLOAD - 1);
        assert!(got[0].1.chars().all(|c| c == 'é'));
        // the full reservation is kept when nothing fits in less
        assert_eq!(ring.positions().0, MAX_ENTRY_SIZE);
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let ring = LogRing::<512>::new(zero_clock);
        for i in 0..100 {
            log_entry!(&ring, "entry {:03}", i);
            let (head, tail) = ring.positions();
            assert!(head - tail <= 512);
        }
        let got = dumped(&ring);
        assert!(!got.is_empty());
        assert_eq!(got.last().unwrap().1, "entry 099");
        // what survived is contiguous and in order
        let nums: Vec<u32> =
            got.iter().map(|(_, t)| t[6..].parse().unwrap()).collect();
        assert!(nums.windows(2).all(|w| w[1] == w[0] + 1));
        assert!(ring.stats().evicted > 0);
    }

    #[test]
    fn entries_never_straddle_the_end() {
        let ring = LogRing::<512>::new(zero_clock);
        // 255 + 255 leaves 2 bytes; the next claim must skip them
        ring.reserve(MAX_ENTRY_SIZE).unwrap();
        ring.reserve(MAX_ENTRY_SIZE).unwrap();
        let r = ring.reserve(HEADER_SIZE + 4).unwrap();
        assert_eq!(r.old_head, 510);
        assert_eq!(r.start, 512);
        assert_eq!(r.new_head, 522);
        assert_eq!(ring.get(510), EntryKind::Empty as u8);
        assert_eq!(ring.stats().fillers, 1);
    }

    #[test]
    fn reserve_rejects_silly_sizes() {
        let ring = LogRing::<512>::new(zero_clock);
        assert_eq!(ring.reserve(0), Err(BootError::ParameterInvalid));
        assert_eq!(ring.reserve(256), Err(BootError::ParameterInvalid));
    }

    #[test]
    fn eviction_gives_up_on_corrupt_lengths() {
        let ring = LogRing::<512>::new(zero_clock);
        log_entry!(&ring, "{}", "x".repeat(100));
        log_entry!(&ring, "{}", "y".repeat(100));
        // scribble an impossible length over the oldest entry
        ring.put(1, 3);
        assert_eq!(
            ring.evict_until(ring.positions().0 + 512),
            Err(BootError::CorruptionDetected)
        );
        for _ in 0..5 {
            log_entry!(&ring, "{}", "z".repeat(100));
        }
        assert!(ring.stats().dropped > 0);
    }

    #[test]
    fn dump_keeps_to_half_the_store_and_ends_with_marker() {
        let ring = LogRing::<4096>::new(tick_clock);
        for i in 0..200 {
            log_entry!(&ring, "message number {}", i);
        }
        let mut store = MemStore::new(1024);
        let summary = ring.dump_to_store(&mut store).unwrap();
        assert!(summary.bytes + HEADER_SIZE <= 512);
        assert_eq!(
            &store.bytes()[summary.bytes..summary.bytes + HEADER_SIZE],
            &END_MARKER
        );
        let got: Vec<_> = dump::entries(store.bytes())
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(got.len(), summary.entries);
        assert_eq!(got.last().unwrap().text, "message number 199");
        assert!(got.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn uncommitted_entries_are_not_dumped() {
        let ring = LogRing::<1024>::new(zero_clock);
        log_entry!(&ring, "first");
        // a claim whose writer never finished
        let r = ring.reserve(20).unwrap();
        ring.put(r.start, EntryKind::Invalid as u8);
        ring.put(r.start + 1, 20);
        log_entry!(&ring, "third");
        let texts: Vec<_> = dumped(&ring).into_iter().map(|e| e.1).collect();
        assert_eq!(texts, ["first", "third"]);
    }

    #[test]
    fn concurrent_writers() {
        const K: usize = 4;
        const M: usize = 500;
        let ring = Arc::new(LogRing::<65536>::new(zero_clock));
        let threads: Vec<_> = (0..K)
            .map(|k| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for m in 0..M {
                        log_entry!(&*ring, "writer {k} entry {m:04}");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let stats = ring.stats();
        assert_eq!(stats.committed as usize, K * M);
        assert_eq!(stats.dropped, 0);
        let (head, tail) = ring.positions();
        assert!(head - tail <= 65536);

        let mut store = MemStore::new(1 << 18);
        ring.dump_to_store(&mut store).unwrap();
        let mut seen = 0;
        for e in dump::entries(store.bytes()) {
            let e = e.unwrap();
            assert!((HEADER_SIZE..=MAX_ENTRY_SIZE).contains(&e.len));
            assert!(e.text.starts_with("writer "));
            seen += 1;
        }
        assert!(seen > 0 && seen <= K * M);
    }

    #[test]
    fn stale_eviction_target_is_already_met() {
        let ring = LogRing::<512>::new(zero_clock);
        for i in 0..60 {
            log_entry!(&ring, "entry {:03}", i);
        }
        let before = ring.positions();
        assert!(before.1 > 10);
        // a writer that read `head` before others evicted past it
        assert_eq!(ring.evict_until(before.1 - 10), Ok(()));
        assert_eq!(ring.positions(), before);
    }

    #[test]
    fn tail_past_head_empties_the_ring() {
        let ring = LogRing::<1024>::new(zero_clock);
        log_entry!(&ring, "first");
        log_entry!(&ring, "second");
        let (head, _) = ring.positions();
        // what an eviction racing a shrinking writer leaves behind
        ring.tail.store(head + 20, Ordering::Release);
        assert!(dumped(&ring).is_empty());

        log_entry!(&ring, "third");
        assert_eq!(ring.positions(), (head + 32, head + 20));
        let texts: Vec<_> = dumped(&ring).into_iter().map(|e| e.1).collect();
        assert_eq!(texts, ["third"]);
    }

    #[test]
    fn many_writers_on_a_small_ring() {
        const K: usize = 8;
        const M: usize = 2000;
        let ring = LogRing::<512>::new(zero_clock);
        std::thread::scope(|s| {
            for k in 0..K {
                let ring = &ring;
                s.spawn(move || {
                    for m in 0..M {
                        log_entry!(ring, "writer {k} entry {m:04}");
                        let (head, tail) = ring.positions();
                        assert!(head.saturating_sub(tail) <= 512);
                    }
                });
            }
        });

        let stats = ring.stats();
        assert_eq!((stats.committed + stats.dropped) as usize, K * M);
        let (head, tail) = ring.positions();
        assert!(head.saturating_sub(tail) <= 512);

        let mut store = MemStore::new(2048);
        match ring.dump_to_store(&mut store) {
            Ok(summary) => assert!(summary.bytes + HEADER_SIZE <= 1024),
            Err(e) => assert_eq!(e, BootError::CorruptionDetected),
        }
    }

    proptest! {
        #[test]
        fn wrap_invariant(
            lens in proptest::collection::vec(0usize..300, 1..200),
        ) {
            let ring = LogRing::<1024>::new(zero_clock);
            for len in lens {
                log_entry!(&ring, "{}", "a".repeat(len));
                let (head, tail) = ring.positions();
                prop_assert!(head - tail <= 1024);
                prop_assert!(ring.stats().fillers as usize <= head / 1024);
            }
            prop_assert_eq!(ring.stats().dropped, 0);
        }
    }
}
