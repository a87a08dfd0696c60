//! Codec for the control word: one `u64` jointly holding the address of the
//! currently published cell and the number of readers that are between
//! observing that address and registering their reference on it.
//!
//! The packing relies on x86-64 and AArch64 only using the low 48 bits of a
//! pointer, with the upper 16 bits replicating bit 47 (the canonical form).
//! That leaves the top 16 bits of the word free for the in-flight counter,
//! which caps the number of readers simultaneously inside the short
//! registration window at 65535.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(not(target_pointer_width = "64"))] {
        compile_error!("cow-cell packs a 48 bit address and a 16 bit reader counter into a single atomic word and therefore requires a 64 bit target");
    }
}

const ADDR_BITS: u32 = 48;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;
const SIGN_BIT: u64 = 1 << (ADDR_BITS - 1);

/// Added to (or subtracted from) the control word to adjust the in-flight
/// reader counter by one without touching the address bits.
pub(crate) const INFLIGHT_ONE: u64 = 1 << ADDR_BITS;

/// Packs `addr` into a control word with an in-flight counter of zero.
#[inline(always)]
pub(crate) fn pack(addr: usize) -> u64 {
    addr as u64 & ADDR_MASK
}

/// Restores the address from a control word by sign-extending bit 47,
/// the canonical-form rule of the supported architectures.
#[inline(always)]
pub(crate) fn addr(word: u64) -> usize {
    if word & SIGN_BIT != 0 {
        (word | !ADDR_MASK) as usize
    } else {
        (word & ADDR_MASK) as usize
    }
}

/// Returns the in-flight reader counter of a control word.
#[inline(always)]
pub(crate) fn inflight(word: u64) -> u64 {
    word >> ADDR_BITS
}

/// Compares only the address bits of two control words.
#[inline(always)]
pub(crate) fn same_addr(a: u64, b: u64) -> bool {
    (a ^ b) & ADDR_MASK == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_addr_round_trip() {
        let low = 0x0000_7fff_dead_b000_usize;
        assert_eq!(addr(pack(low)), low);
        // kernel-half address, bit 47 set
        let high = 0xffff_8000_dead_b000_usize;
        assert_eq!(addr(pack(high)), high);
    }

    #[test]
    fn test_inflight_counter() {
        let word = pack(0x5000);
        assert_eq!(inflight(word), 0);
        let word = word + INFLIGHT_ONE + INFLIGHT_ONE;
        assert_eq!(inflight(word), 2);
        assert_eq!(addr(word), 0x5000);
        let word = word - INFLIGHT_ONE;
        assert_eq!(inflight(word), 1);
    }

    #[test]
    fn test_same_addr_ignores_counter() {
        let a = pack(0x1234_5000);
        assert!(same_addr(a, a + INFLIGHT_ONE));
        assert!(!same_addr(a, pack(0x1234_6000) + INFLIGHT_ONE));
    }
}
