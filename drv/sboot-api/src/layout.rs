// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::ops::Range;

use crate::{BankId, BankSelector, BootError, Domain};

/// An offset range within a bank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: u32,
    pub size: u32,
}

impl Region {
    pub const fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Per-bank region layout of the internal flash.
///
/// Both banks share the same offsets. The executing bank is always mapped at
/// `base`; the standby bank follows it at `base + bank_size`. Swapping banks
/// therefore changes which *logical* bank lives at which address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashLayout {
    pub base: u32,
    pub bank_size: u32,
    /// Trusted code.
    pub trusted: Region,
    /// Trusted-callable veneers, immediately after `trusted`.
    pub nsc: Region,
    /// Untrusted image, immediately after `nsc`.
    pub untrusted: Region,
    pub program_granule: u32,
    pub sector_size: u32,
}

impl FlashLayout {
    /// Checks the layout for internal consistency.
    ///
    /// `hash_word` is the natural word size of the hash accelerator; the
    /// trusted domain must be a whole number of words.
    pub fn validate(&self, hash_word: u32) -> Result<(), BootError> {
        let g = self.program_granule;
        if g == 0 || !g.is_power_of_two() || hash_word == 0 {
            return Err(BootError::ParameterInvalid);
        }
        if self.sector_size == 0 || self.sector_size % g != 0 {
            return Err(BootError::ParameterInvalid);
        }
        if self.base % self.sector_size != 0
            || self.bank_size % self.sector_size != 0
        {
            return Err(BootError::ParameterInvalid);
        }
        if self.trusted.offset != 0
            || self.nsc.offset != self.trusted.end()
            || self.untrusted.offset != self.nsc.end()
            || self.untrusted.end() > self.bank_size
        {
            return Err(BootError::ParameterInvalid);
        }
        for r in [self.trusted, self.nsc, self.untrusted] {
            if r.size == 0
                || r.offset % self.sector_size != 0
                || r.size % self.sector_size != 0
            {
                return Err(BootError::ParameterInvalid);
            }
        }
        if self.domain_span(Domain::Trusted).size % hash_word != 0 {
            return Err(BootError::ParameterInvalid);
        }
        Ok(())
    }

    /// The offsets a domain occupies within a bank. The trusted domain
    /// includes the veneer region.
    pub fn domain_span(&self, domain: Domain) -> Region {
        match domain {
            Domain::Trusted => Region {
                offset: self.trusted.offset,
                size: self.nsc.end() - self.trusted.offset,
            },
            Domain::Untrusted => self.untrusted,
        }
    }

    pub fn bank_base(&self, sel: BankSelector, bank: BankId) -> u32 {
        if sel.is_current(bank) {
            self.base
        } else {
            self.base + self.bank_size
        }
    }

    /// Absolute address range of `domain` in logical `bank`.
    pub fn region(
        &self,
        sel: BankSelector,
        bank: BankId,
        domain: Domain,
    ) -> Range<u32> {
        let span = self.domain_span(domain);
        let start = self.bank_base(sel, bank) + span.offset;
        start..start + span.size
    }

    /// Finds the single (bank, domain) region holding all of
    /// `start..start + len`.
    pub fn locate(
        &self,
        sel: BankSelector,
        start: u32,
        len: u32,
    ) -> Result<(BankId, Domain), BootError> {
        let end = start
            .checked_add(len)
            .ok_or(BootError::AddressOutOfRange)?;
        for bank in BankId::ALL {
            for domain in Domain::ALL {
                let r = self.region(sel, bank, domain);
                if start >= r.start && end <= r.end {
                    return Ok((bank, domain));
                }
            }
        }
        Err(BootError::AddressOutOfRange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u32 = 1024;

    // The H573 layout: 152K trusted, 8K veneers, 864K untrusted per 1M bank.
    const H573: FlashLayout = FlashLayout {
        base: 0x0c00_0000,
        bank_size: 1024 * KIB,
        trusted: Region {
            offset: 0,
            size: 152 * KIB,
        },
        nsc: Region {
            offset: 152 * KIB,
            size: 8 * KIB,
        },
        untrusted: Region {
            offset: 160 * KIB,
            size: 864 * KIB,
        },
        program_granule: 16,
        sector_size: 8 * KIB,
    };

    #[test]
    fn board_layout_is_valid() {
        assert_eq!(H573.validate(4), Ok(()));
        assert_eq!(H573.nsc.offset, 0x26000);
        assert_eq!(H573.untrusted.offset, 0x28000);
    }

    #[test]
    fn gaps_and_odd_sizes_are_rejected() {
        let mut l = H573;
        l.untrusted.offset += 8 * KIB;
        assert_eq!(l.validate(4), Err(BootError::ParameterInvalid));

        let mut l = H573;
        l.program_granule = 12;
        assert_eq!(l.validate(4), Err(BootError::ParameterInvalid));

        // trusted domain (160K) is not a multiple of a 48-byte word
        assert_eq!(H573.validate(48), Err(BootError::ParameterInvalid));
    }

    #[test]
    fn regions_follow_the_selector() {
        let plain = BankSelector::new(false);
        let swapped = BankSelector::new(true);
        let r1 = H573.region(plain, BankId::One, Domain::Trusted);
        assert_eq!(r1, 0x0c00_0000..0x0c02_8000);
        let r1s = H573.region(swapped, BankId::One, Domain::Trusted);
        assert_eq!(r1s.start, 0x0c10_0000);
        let u2 = H573.region(plain, BankId::Two, Domain::Untrusted);
        assert_eq!(u2, 0x0c12_8000..0x0c20_0000);
    }

    #[test]
    fn locate_rejects_straddles() {
        let sel = BankSelector::new(false);
        assert_eq!(
            H573.locate(sel, 0x0c12_8000, 16),
            Ok((BankId::Two, Domain::Untrusted))
        );
        // straddles trusted/untrusted in bank 2
        assert_eq!(
            H573.locate(sel, 0x0c12_7ff0, 32),
            Err(BootError::AddressOutOfRange)
        );
        assert_eq!(
            H573.locate(sel, 0x0800_0000, 16),
            Err(BootError::AddressOutOfRange)
        );
        assert_eq!(
            H573.locate(sel, u32::MAX - 4, 16),
            Err(BootError::AddressOutOfRange)
        );
    }
}
