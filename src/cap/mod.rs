/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! The capability slot engine (spec §4.1).
//!
//! A slot is one fixed-size word pair living inside a [`crate::captable::Cpt`]:
//! a packed `type_stat` header (kept as a plain [`AtomicU64`] rather than an
//! MMIO-style `ReadWrite` register, the way the teacher's `UntypedCap`
//! bitfields describe an in-memory word layout rather than a hardware
//! register) plus the object pointer and flag word it guards.
//!
//! State machine (spec §4.1, §5): `Empty -> Creating -> Valid -> Frozen ->
//! Empty`. Every transition is a single CAS on `type_stat`; publishing a
//! newly-created object additionally uses release-store so that once a
//! reader observes `Valid` with acquire-load, the object fields behind it
//! are guaranteed initialized.

pub mod slot;

pub use slot::{CapFlags, CapType, Slot, SlotStatus};

use crate::error::{CptError, KResult};

/// A two-level capability identifier (spec §3: "two-level vs one-level
/// capability IDs"). The high bits index a second-level table capability
/// held in the first-level table; the low bits index within it. A purely
/// first-level id just leaves the high part at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapId {
    pub first: u16,
    pub second: u16,
}

impl CapId {
    pub const fn first_level(index: u16) -> Self {
        CapId {
            first: index,
            second: 0,
        }
    }

    pub const fn two_level(first: u16, second: u16) -> Self {
        CapId { first, second }
    }
}

/// Result of a successful `GETCAP` resolution: a reference to the slot plus
/// the type/flag facts already validated against the caller's request, so
/// callers never have to re-check them.
pub struct Resolved<'a> {
    pub slot: &'a Slot,
}

/// Resolve `id` against `table`, validating that the slot is `Valid`, that
/// its type matches `want_type` and that `want_flags` is a subset of the
/// slot's permission flags (spec §4.1 `GETCAP`).
pub fn get_cap<'a>(
    table: &'a [Slot],
    id: CapId,
    want_type: CapType,
    want_flags: CapFlags,
) -> KResult<Resolved<'a>> {
    let index = id.first as usize;
    let slot = table.get(index).ok_or(CptError::Range)?;

    let header = slot.load_header();
    if header.status != SlotStatus::Valid {
        return Err(CptError::Null.into());
    }
    if header.cap_type != want_type {
        return Err(CptError::Flag.into());
    }
    if !header.flags.contains(want_flags) {
        return Err(CptError::Flag.into());
    }

    Ok(Resolved { slot })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_level_id_packs_both_parts() {
        let id = CapId::two_level(3, 7);
        assert_eq!(id.first, 3);
        assert_eq!(id.second, 7);
    }

    #[test]
    fn get_cap_rejects_out_of_range_index() {
        let table = [Slot::empty()];
        let err = get_cap(&table, CapId::first_level(5), CapType::Thd, CapFlags::empty());
        assert!(err.is_err());
    }

    #[test]
    fn get_cap_rejects_empty_slot() {
        let table = [Slot::empty()];
        let err = get_cap(&table, CapId::first_level(0), CapType::Thd, CapFlags::empty());
        assert!(err.is_err());
    }
}
