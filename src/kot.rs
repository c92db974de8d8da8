/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Kernel Object Table: a dense bitmap tracking which kernel-memory slots
//! are currently backing a live kernel object (spec §4.2).
//!
//! The algorithm mirrors the original kernel's `_RME_Kotbl_Mark` /
//! `_RME_Kotbl_Erase` exactly: a ranged `mark`/`erase` touches whole words
//! with a plain write wherever the range covers a full word, and a CAS only
//! at the two boundary words where the range doesn't start/end on a word
//! edge. `mark` additionally rolls back everything it already flipped if
//! any word in the range turns out non-zero, so a racing mark never leaves
//! the bitmap in a half-claimed state.

use crate::atomics::{cas, fetch_and};
use crate::config::{KMEM_SLOT_ORDER, KOT_WORD_NUM, WORD_BITS};
use crate::error::{KotError, KResult};
use core::sync::atomic::AtomicU64;

/// The kernel object table itself: one bit per [`KMEM_SLOT_ORDER`]-sized
/// slot of kernel memory, packed into [`KOT_WORD_NUM`] words.
pub struct Kot {
    words: [AtomicU64; KOT_WORD_NUM],
}

/// Start/end bit index and the masks/words that straddle each boundary.
struct Range {
    start_word: usize,
    start_bit: u32,
    end_word: usize,
    end_bit: u32,
}

fn slot_range(addr: usize, size: usize) -> KResult<Range> {
    if addr % (1 << KMEM_SLOT_ORDER) != 0 || size % (1 << KMEM_SLOT_ORDER) != 0 || size == 0 {
        return Err(KotError::Bmp.into());
    }
    let start_slot = addr >> KMEM_SLOT_ORDER;
    let num_slots = size >> KMEM_SLOT_ORDER;
    let end_slot = start_slot + num_slots - 1;
    Ok(Range {
        start_word: start_slot / WORD_BITS,
        start_bit: (start_slot % WORD_BITS) as u32,
        end_word: end_slot / WORD_BITS,
        end_bit: (end_slot % WORD_BITS) as u32,
    })
}

impl Kot {
    /// Build an all-zero (fully free) table. `_RME_Kotbl_Init`.
    pub const fn new() -> Self {
        // AtomicU64::new(0) is const; array-init needs an explicit repeat.
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Kot {
            words: [ZERO; KOT_WORD_NUM],
        }
    }

    /// Claim every slot in `[addr, addr+size)`. Fails, with no bits left
    /// set, if any slot in the range was already claimed.
    pub fn mark(&self, addr: usize, size: usize) -> KResult<()> {
        let r = slot_range(addr, size)?;

        if r.start_word == r.end_word {
            let mask = span_mask(r.start_bit, r.end_bit);
            let word = &self.words[r.start_word];
            loop {
                let cur = word.load(core::sync::atomic::Ordering::Acquire);
                if cur & mask != 0 {
                    return Err(KotError::Bmp.into());
                }
                if cas(word, cur, cur | mask).is_ok() {
                    return Ok(());
                }
            }
        }

        // Multi-word range: claim the start boundary first via CAS.
        let start_mask = span_mask(r.start_bit, (WORD_BITS - 1) as u32);
        let start_word = &self.words[r.start_word];
        let start_prev = loop {
            let cur = start_word.load(core::sync::atomic::Ordering::Acquire);
            if cur & start_mask != 0 {
                return Err(KotError::Bmp.into());
            }
            if cas(start_word, cur, cur | start_mask).is_ok() {
                break cur;
            }
        };

        // Claim every interior word: must observe exactly zero, else unwind.
        let mut claimed_interior = 0usize;
        for w in (r.start_word + 1)..r.end_word {
            let word = &self.words[w];
            match cas(word, 0, u64::MAX) {
                Ok(()) => claimed_interior += 1,
                Err(_) => {
                    unwind_mark(self, r.start_word, start_word, start_mask, start_prev, claimed_interior);
                    return Err(KotError::Bmp.into());
                }
            }
        }

        // Claim the end boundary.
        let end_mask = span_mask(0, r.end_bit);
        let end_word = &self.words[r.end_word];
        let end_ok = loop {
            let cur = end_word.load(core::sync::atomic::Ordering::Acquire);
            if cur & end_mask != 0 {
                break false;
            }
            if cas(end_word, cur, cur | end_mask).is_ok() {
                break true;
            }
        };

        if !end_ok {
            unwind_mark(self, r.start_word, start_word, start_mask, start_prev, claimed_interior);
            return Err(KotError::Bmp.into());
        }

        Ok(())
    }

    /// Release every slot in `[addr, addr+size)`. The caller must already
    /// hold every bit in the range (only the object that owns them ever
    /// erases them), so no CAS race is possible and boundary words use a
    /// plain `fetch_and` instead of a retry loop.
    pub fn erase(&self, addr: usize, size: usize) -> KResult<()> {
        let r = slot_range(addr, size)?;

        if r.start_word == r.end_word {
            let mask = span_mask(r.start_bit, r.end_bit);
            let word = &self.words[r.start_word];
            if word.load(core::sync::atomic::Ordering::Acquire) & mask != mask {
                return Err(KotError::Bmp.into());
            }
            fetch_and(word, !mask);
            return Ok(());
        }

        let start_mask = span_mask(r.start_bit, (WORD_BITS - 1) as u32);
        let end_mask = span_mask(0, r.end_bit);

        let start_word = &self.words[r.start_word];
        let end_word = &self.words[r.end_word];
        if start_word.load(core::sync::atomic::Ordering::Acquire) & start_mask != start_mask {
            return Err(KotError::Bmp.into());
        }
        if end_word.load(core::sync::atomic::Ordering::Acquire) & end_mask != end_mask {
            return Err(KotError::Bmp.into());
        }
        for w in (r.start_word + 1)..r.end_word {
            if self.words[w].load(core::sync::atomic::Ordering::Acquire) != u64::MAX {
                return Err(KotError::Bmp.into());
            }
        }

        fetch_and(start_word, !start_mask);
        for w in (r.start_word + 1)..r.end_word {
            self.words[w].store(0, core::sync::atomic::Ordering::Release);
        }
        fetch_and(end_word, !end_mask);
        Ok(())
    }
}

fn unwind_mark(
    kot: &Kot,
    start_word_idx: usize,
    start_word: &AtomicU64,
    start_mask: u64,
    start_prev: u64,
    claimed_interior: usize,
) {
    fetch_and(start_word, !start_mask | start_prev);
    for w in (start_word_idx + 1)..(start_word_idx + 1 + claimed_interior) {
        kot.words[w].store(0, core::sync::atomic::Ordering::Release);
    }
}

/// Mask covering bits `[lo, hi]` inclusive within one 64-bit word.
///
/// The KOT is always packed into `u64` words regardless of the host
/// pointer width, so the top bit index is fixed at 63.
fn span_mask(lo: u32, hi: u32) -> u64 {
    if lo == 0 && hi == 63 {
        u64::MAX
    } else {
        (u64::MAX >> (63 - hi)) & (u64::MAX << lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_then_erase_round_trips() {
        let kot = Kot::new();
        kot.mark(0, 16).unwrap();
        assert!(kot.mark(0, 16).is_err());
        kot.erase(0, 16).unwrap();
        kot.mark(0, 16).unwrap();
    }

    #[test]
    fn mark_rejects_misaligned_addr() {
        let kot = Kot::new();
        assert!(kot.mark(1, 16).is_err());
    }

    #[test]
    fn mark_spanning_multiple_words_claims_every_bit() {
        let kot = Kot::new();
        let size = (WORD_BITS * 3) << KMEM_SLOT_ORDER;
        kot.mark(0, size).unwrap();
        assert!(kot.mark(0, 1 << KMEM_SLOT_ORDER).is_err());
        let last_slot_addr = (size - (1 << KMEM_SLOT_ORDER)) as usize;
        assert!(kot.mark(last_slot_addr, 1 << KMEM_SLOT_ORDER).is_err());
        kot.erase(0, size).unwrap();
        kot.mark(0, size).unwrap();
    }

    #[test]
    fn erase_rejects_partially_unmarked_range() {
        let kot = Kot::new();
        let slot = 1 << KMEM_SLOT_ORDER;
        kot.mark(0, slot).unwrap();
        assert!(kot.erase(0, slot * 2).is_err());
    }
}
