/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Capability table component (spec §4.4): `Crt`/`Del`/`Frz`/`Add`/`Rem`.
//!
//! A [`Cpt`] is itself just an array of [`Slot`]s; this module supplies the
//! syscalls that create, freeze, delete, delegate and undelegate
//! capabilities *to* a `Cpt` object, built on the generic slot engine in
//! [`crate::cap`] and the KOT-backed storage in [`crate::kobj`].

use crate::atomics::Timestamp;
use crate::cap::{CapFlags, CapId, CapType, Slot, SlotStatus};
use crate::config::{CPT_ENTRY_MAX, CPT_SLOT_CAPACITY, MAX_CPT, QUIE_TIME};
use crate::error::{CptError, KError, KResult};
use crate::kobj::Arena;
use crate::kot::Kot;

/// Private window into the KOT address space reserved for `Cpt` objects.
/// Arbitrary but disjoint from every other component's window; see
/// `config.rs` and the other components' `_BASE`/`_STRIDE` constants.
const CPT_BASE: usize = 0x1000_0000;
const CPT_STRIDE: usize = 4096;

pub type CptArena = Arena<Cpt, MAX_CPT, CPT_BASE, CPT_STRIDE>;

/// A capability table: a fixed-capacity array of slots, `len` of which are
/// in use (spec §3: "table size fixed at creation").
pub struct Cpt {
    slots: [Slot; CPT_SLOT_CAPACITY],
    len: usize,
}

impl Cpt {
    const EMPTY_SLOT: Slot = Slot::empty();

    fn new(len: usize) -> KResult<Self> {
        if len == 0 || len > CPT_SLOT_CAPACITY || len > CPT_ENTRY_MAX {
            return Err(CptError::Range.into());
        }
        Ok(Cpt {
            slots: [Self::EMPTY_SLOT; CPT_SLOT_CAPACITY],
            len,
        })
    }

    /// A never-deletable boot-time table, pre-populated by the caller after
    /// construction (spec §3: "Boot-time tables are never deletable
    /// (`root_ref` pinned to 1)"). Used to seed the first process's
    /// capability space before multicore scheduling goes live.
    pub fn new_boot(len: usize) -> KResult<Self> {
        let cpt = Self::new(len)?;
        Ok(cpt)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn all_empty(&self) -> bool {
        self.slots().iter().all(|s| s.load_header().status == SlotStatus::Empty)
    }
}

/// Resolve a (possibly two-level) [`CapId`] rooted at `root_idx` down to the
/// `(table_index, slot_index)` pair naming the final slot, per spec §3: "a
/// 2-level capability ID is a pair (outer slot in caller's table that must
/// be a valid Cpt cap, inner slot inside that child table)".
pub fn lookup_table_index(cpts: &CptArena, root_idx: usize, id: CapId) -> KResult<(usize, usize)> {
    if id.second == 0 {
        return Ok((root_idx, id.first as usize));
    }
    let child = cpts
        .with(root_idx, |cpt| -> KResult<usize> {
            let slot = cpt
                .slots()
                .get(id.first as usize)
                .ok_or(CptError::Range)?;
            let header = slot.load_header();
            if header.status != SlotStatus::Valid || header.cap_type != CapType::Cpt {
                return Err(CptError::Null.into());
            }
            Ok(slot.object())
        })
        .ok_or(CptError::Null)??;
    Ok((child, id.second as usize))
}

/// `Cpt_Crt`: create a new `len`-entry capability table and install a root
/// capability to it at `dst` (spec §4.4 "Create checks").
pub fn cpt_crt(cpts: &CptArena, kot: &Kot, root_idx: usize, dst: CapId, len: usize) -> KResult<()> {
    if len == 0 || len > CPT_SLOT_CAPACITY || len > CPT_ENTRY_MAX {
        return Err(CptError::Range.into());
    }
    let (table_idx, slot_idx) = lookup_table_index(cpts, root_idx, dst)?;

    cpts.with(table_idx, |cpt| {
        let slot = cpt.slots().get(slot_idx).ok_or(CptError::Range)?;
        slot.begin_create().map_err(|_| CptError::Exist.into())
    })
    .ok_or(CptError::Null)??;

    let new_idx = match cpts.alloc_with(kot, |_| Cpt::new(len).expect("len validated above")) {
        Ok(i) => i,
        Err(e) => {
            cpts.with(table_idx, |cpt| cpt.slots()[slot_idx].rollback_create());
            return Err(e);
        }
    };

    cpts.with(table_idx, |cpt| {
        cpt.slots()[slot_idx].publish_root(CapType::Cpt, CapFlags::all(), new_idx);
    });
    crate::trace::record(crate::trace::Event::CapCreated {
        cpt_idx: table_idx,
        slot: slot_idx,
    });
    Ok(())
}

/// `Cpt_Del`: delete a root capability table, verifying it is frozen,
/// quiescent, unreferenced and internally empty (spec §4.4 "Delete checks").
pub fn cpt_del(cpts: &CptArena, kot: &Kot, root_idx: usize, target: CapId, now: Timestamp) -> KResult<()> {
    let (table_idx, slot_idx) = lookup_table_index(cpts, root_idx, target)?;

    let obj_idx = cpts
        .with(table_idx, |cpt| {
            let slot = cpt.slots().get(slot_idx).ok_or(CptError::Range)?;
            let header = slot.load_header();
            if header.cap_type != CapType::Cpt {
                return Err(CptError::Null.into());
            }
            if header.status != SlotStatus::Frozen {
                return Err(CptError::Frozen.into());
            }
            if !slot.is_root() {
                return Err(CptError::Flag.into());
            }
            if slot.ref_count() != 0 {
                return Err(CptError::Refcnt.into());
            }
            Ok::<usize, KError>(slot.object())
        })
        .ok_or(CptError::Null)??;

    let is_empty = cpts.with(obj_idx, |cpt| cpt.all_empty()).ok_or(CptError::Null)?;
    if !is_empty {
        return Err(CptError::Refcnt.into());
    }

    cpts.with(table_idx, |cpt| cpt.slots()[slot_idx].finalize_delete(now, QUIE_TIME))
        .ok_or(CptError::Null)?
        .map_err(|_| CptError::Quie)?;

    cpts.free(kot, obj_idx)?;
    crate::trace::record(crate::trace::Event::CapDeleted {
        cpt_idx: table_idx,
        slot: slot_idx,
    });
    Ok(())
}

/// `Cpt_Frz`: freeze a valid capability, refusing if it still has
/// outstanding derived references or is already frozen.
pub fn cpt_frz(cpts: &CptArena, root_idx: usize, target: CapId, now: Timestamp) -> KResult<()> {
    let (table_idx, slot_idx) = lookup_table_index(cpts, root_idx, target)?;
    cpts.with(table_idx, |cpt| {
        let slot = cpt.slots().get(slot_idx).ok_or(CptError::Range)?;
        let header = slot.load_header();
        match header.status {
            SlotStatus::Empty | SlotStatus::Creating => Err(CptError::Null.into()),
            SlotStatus::Frozen => Err(CptError::Frozen.into()),
            SlotStatus::Valid => {
                if slot.ref_count() != 0 {
                    return Err(CptError::Refcnt.into());
                }
                slot.freeze(now).map_err(|_| CptError::Refcnt.into())
            }
        }
    })
    .ok_or(CptError::Null)??;
    crate::trace::record(crate::trace::Event::CapFrozen {
        cpt_idx: table_idx,
        slot: slot_idx,
    });
    Ok(())
}

/// `Cpt_Add`: delegate `src` into the empty slot `dst`, narrowing flags to
/// `new_flags` (spec §4.3 "Delegation (`Cpt_Add`)").
pub fn cpt_add(cpts: &CptArena, root_idx: usize, src: CapId, dst: CapId, new_flags: CapFlags) -> KResult<()> {
    let (src_table, src_slot) = lookup_table_index(cpts, root_idx, src)?;
    let (dst_table, dst_slot) = lookup_table_index(cpts, root_idx, dst)?;

    let (cap_type, object, root_loc) = cpts
        .with(src_table, |cpt| {
            let slot = cpt.slots().get(src_slot).ok_or(CptError::Range)?;
            let header = slot.load_header();
            if header.status != SlotStatus::Valid {
                return Err(CptError::Null.into());
            }
            if !header.flags.contains(new_flags) {
                return Err(CptError::Flag.into());
            }
            let root_loc = if slot.is_root() {
                (src_table, src_slot)
            } else {
                slot.root_location()
            };
            Ok::<_, KError>((header.cap_type, slot.object(), root_loc))
        })
        .ok_or(CptError::Null)??;

    cpts.with(dst_table, |cpt| {
        let slot = cpt.slots().get(dst_slot).ok_or(CptError::Range)?;
        slot.begin_create().map_err(|_| CptError::Exist.into())
    })
    .ok_or(CptError::Null)??;

    // Kernel-function caps are exempt from refcounting (spec §4.3): they
    // have no backing object and are widely delegated.
    if cap_type != CapType::Kfn {
        cpts.with(root_loc.0, |cpt| cpt.slots()[root_loc.1].bump_ref());
    }

    cpts.with(dst_table, |cpt| {
        cpt.slots()[dst_slot].publish_leaf(cap_type, new_flags, object, root_loc);
    });
    Ok(())
}

/// `Cpt_Rem`: undo a [`cpt_add`] delegation, decrementing the root's
/// refcount and clearing the leaf slot directly (no quiescence: the leaf
/// never owned a kernel object of its own).
pub fn cpt_rem(cpts: &CptArena, root_idx: usize, target: CapId) -> KResult<()> {
    let (table_idx, slot_idx) = lookup_table_index(cpts, root_idx, target)?;

    let (cap_type, root_loc) = cpts
        .with(table_idx, |cpt| {
            let slot = cpt.slots().get(slot_idx).ok_or(CptError::Range)?;
            let header = slot.load_header();
            if header.status != SlotStatus::Valid {
                return Err(CptError::Null.into());
            }
            if slot.is_root() {
                return Err(CptError::Flag.into());
            }
            let loc = slot.root_location();
            slot.clear();
            Ok::<_, KError>((header.cap_type, loc))
        })
        .ok_or(CptError::Null)??;

    if cap_type != CapType::Kfn {
        cpts.with(root_loc.0, |cpt| cpt.slots()[root_loc.1].drop_ref());
    }
    Ok(())
}
