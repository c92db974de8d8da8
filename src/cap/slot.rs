/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Packed per-slot header and the `Empty -> Creating -> Valid -> Frozen ->
//! Empty` lifecycle (spec §4.1, §5).

use crate::atomics::{cas, Timestamp};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tock_registers::registers::LocalRegisterCopy;
use tock_registers::register_bitfields;

register_bitfields! [
    u64,
    pub TypeStat [
        Status OFFSET(0) NUMBITS(2) [
            Empty = 0,
            Creating = 1,
            Valid = 2,
            Frozen = 3
        ],
        Type OFFSET(2) NUMBITS(6) [],
        Attr OFFSET(8) NUMBITS(1) [
            Root = 0,
            Leaf = 1
        ],
        Flags OFFSET(9) NUMBITS(16) []
    ]
];

/// Discriminant identifying which kernel object a valid slot refers to
/// (spec §2 component table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CapType {
    Cpt = 0,
    Pgt = 1,
    Prc = 2,
    Thd = 3,
    Sig = 4,
    Inv = 5,
    Kfn = 6,
}

impl CapType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CapType::Cpt),
            1 => Some(CapType::Pgt),
            2 => Some(CapType::Prc),
            3 => Some(CapType::Thd),
            4 => Some(CapType::Sig),
            5 => Some(CapType::Inv),
            6 => Some(CapType::Kfn),
            _ => None,
        }
    }
}

bitflags! {
    /// Per-capability permission subset (spec §4.1 `GETCAP`: "flag subset").
    pub struct CapFlags: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const GRANT = 1 << 3;
        const DUP = 1 << 4;
        const REVOKE = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Empty,
    Creating,
    Valid,
    Frozen,
}

/// Root capabilities own their backing object and count outstanding
/// derived (leaf) capabilities; leaf capabilities only name where their
/// root lives (spec §3: "`root_ref` (for root caps: outstanding children
/// + usage count; for leaf caps: pointer to root)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Root,
    Leaf,
}

/// Decoded snapshot of a slot's header, returned by [`Slot::load_header`].
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub status: SlotStatus,
    pub cap_type: CapType,
    pub attr: Attribute,
    pub flags: CapFlags,
}

/// Where a leaf capability's root lives: the arena index of the capability
/// table holding it, and the slot index within that table.
pub type RootLocation = (usize, usize);

/// One capability-table slot.
pub struct Slot {
    type_stat: AtomicU64,
    /// Offset/pointer into the backing kernel object, meaningful only once
    /// `status == Valid`.
    object: AtomicUsize,
    /// Root-attribute slots: refcount of capabilities derived from this one
    /// (spec §4.1: `Refcnt` must be zero before freeze can succeed). Unused
    /// (always zero) on leaf-attribute slots.
    root_ref: AtomicU64,
    /// Leaf-attribute slots: packed `(table_index << 32) | slot_index`
    /// locating the root this leaf was delegated from. Unused (zero) on
    /// root-attribute slots. Kept as a separate field rather than a true
    /// union with `root_ref`, trading the spec's packed-word savings for
    /// safe Rust; see DESIGN.md.
    root_loc: AtomicU64,
    /// Timestamp of the most recent successful freeze, used to measure the
    /// quiescence window before delete (spec §5).
    frozen_at: AtomicU64,
}

impl Slot {
    pub const fn empty() -> Self {
        Slot {
            type_stat: AtomicU64::new(0),
            object: AtomicUsize::new(0),
            root_ref: AtomicU64::new(0),
            root_loc: AtomicU64::new(0),
            frozen_at: AtomicU64::new(0),
        }
    }

    pub fn load_header(&self) -> Header {
        let raw = self.type_stat.load(Ordering::Acquire);
        let reg = LocalRegisterCopy::<u64, TypeStat::Register>::new(raw);
        let status = match reg.read(TypeStat::Status) {
            0 => SlotStatus::Empty,
            1 => SlotStatus::Creating,
            2 => SlotStatus::Valid,
            _ => SlotStatus::Frozen,
        };
        let cap_type = CapType::from_u8(reg.read(TypeStat::Type) as u8).unwrap_or(CapType::Cpt);
        let attr = match reg.read(TypeStat::Attr) {
            0 => Attribute::Root,
            _ => Attribute::Leaf,
        };
        let flags = CapFlags::from_bits_truncate(reg.read(TypeStat::Flags) as u16);
        Header {
            status,
            cap_type,
            attr,
            flags,
        }
    }

    const STATUS_EMPTY: u64 = 0;
    const STATUS_CREATING: u64 = 1;
    const STATUS_VALID: u64 = 2;
    const STATUS_FROZEN: u64 = 3;

    fn encode(status: u64, cap_type: CapType, attr: Attribute, flags: CapFlags) -> u64 {
        let mut reg = LocalRegisterCopy::<u64, TypeStat::Register>::new(0);
        reg.modify(TypeStat::Status.val(status));
        reg.modify(TypeStat::Type.val(cap_type as u64));
        reg.modify(TypeStat::Attr.val(match attr {
            Attribute::Root => 0,
            Attribute::Leaf => 1,
        }));
        reg.modify(TypeStat::Flags.val(flags.bits() as u64));
        reg.get()
    }

    /// Reserve this slot for construction: `Empty -> Creating`. Fails if the
    /// slot is already occupied (spec §4.3 `Cpt_Add`/`Cpt_Crt` destination
    /// check).
    pub fn begin_create(&self) -> Result<(), ()> {
        let empty = 0u64;
        let creating = Self::encode(Self::STATUS_CREATING, CapType::Cpt, Attribute::Root, CapFlags::empty());
        cas(&self.type_stat, empty, creating).map_err(|_| ())
    }

    /// Undo [`Slot::begin_create`]: `Creating -> Empty`. Used when a create
    /// protocol reserves a destination slot but then fails a later step
    /// (e.g. the backing object allocation).
    pub fn rollback_create(&self) {
        self.type_stat.store(0, Ordering::Release);
    }

    /// Publish a slot reserved by [`Slot::begin_create`] as a root
    /// capability of `cap_type`/`flags` referring to `object`, using
    /// release ordering so every field is visible before `Valid` is.
    pub fn publish_root(&self, cap_type: CapType, flags: CapFlags, object: usize) {
        self.object.store(object, Ordering::Relaxed);
        let valid = Self::encode(Self::STATUS_VALID, cap_type, Attribute::Root, flags);
        self.type_stat.store(valid, Ordering::Release);
    }

    /// Publish a slot reserved by [`Slot::begin_create`] as a leaf
    /// capability delegated from `root` (spec §4.3 `Cpt_Add`).
    pub fn publish_leaf(&self, cap_type: CapType, flags: CapFlags, object: usize, root: RootLocation) {
        self.object.store(object, Ordering::Relaxed);
        self.root_loc
            .store(((root.0 as u64) << 32) | root.1 as u64, Ordering::Relaxed);
        let valid = Self::encode(Self::STATUS_VALID, cap_type, Attribute::Leaf, flags);
        self.type_stat.store(valid, Ordering::Release);
    }

    /// Drop a leaf capability directly back to `Empty` with no freeze or
    /// quiescence delay (spec §4.4 `Rem`: un-delegating a leaf releases only
    /// a bookkeeping entry, not a kernel object).
    pub fn clear(&self) {
        self.type_stat.store(0, Ordering::Release);
        self.object.store(0, Ordering::Relaxed);
        self.root_loc.store(0, Ordering::Relaxed);
    }

    pub fn is_root(&self) -> bool {
        self.load_header().attr == Attribute::Root
    }

    /// Valid only on a leaf-attribute slot.
    pub fn root_location(&self) -> RootLocation {
        let packed = self.root_loc.load(Ordering::Acquire);
        ((packed >> 32) as usize, (packed & 0xFFFF_FFFF) as usize)
    }

    /// Acquire-ordered read of the backing object pointer, valid only once
    /// [`Slot::load_header`] reports [`SlotStatus::Valid`].
    pub fn object(&self) -> usize {
        self.object.load(Ordering::Acquire)
    }

    pub fn bump_ref(&self) -> u64 {
        self.root_ref.fetch_add(1, Ordering::AcqRel)
    }

    pub fn drop_ref(&self) -> u64 {
        self.root_ref.fetch_sub(1, Ordering::AcqRel)
    }

    pub fn ref_count(&self) -> u64 {
        self.root_ref.load(Ordering::Acquire)
    }

    /// `Valid -> Frozen`, refusing if `root_ref != 0` (spec §4.1: freeze
    /// requires no outstanding derived capabilities).
    pub fn freeze(&self, now: Timestamp) -> Result<(), ()> {
        if self.ref_count() != 0 {
            return Err(());
        }
        let header = self.load_header();
        if header.status != SlotStatus::Valid {
            return Err(());
        }
        let current = self.type_stat.load(Ordering::Acquire);
        let frozen = Self::encode(Self::STATUS_FROZEN, header.cap_type, header.attr, header.flags);
        cas(&self.type_stat, current, frozen).map_err(|_| ())?;
        self.frozen_at.store(now.0, Ordering::Release);
        Ok(())
    }

    /// `Frozen -> Empty`, refusing until `quie_ticks` have elapsed since
    /// [`Slot::freeze`] (spec §5 quiescence).
    pub fn finalize_delete(&self, now: Timestamp, quie_ticks: u64) -> Result<(), ()> {
        let header = self.load_header();
        if header.status != SlotStatus::Frozen {
            return Err(());
        }
        let frozen_at = Timestamp(self.frozen_at.load(Ordering::Acquire));
        if !frozen_at.elapsed_at_least(now, quie_ticks) {
            return Err(());
        }
        let current = self.type_stat.load(Ordering::Acquire);
        cas(&self.type_stat, current, 0).map_err(|_| ())?;
        self.object.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_is_empty() {
        let s = Slot::empty();
        assert_eq!(s.load_header().status, SlotStatus::Empty);
    }

    #[test]
    fn create_then_publish_round_trip() {
        let s = Slot::empty();
        s.begin_create().unwrap();
        assert_eq!(s.load_header().status, SlotStatus::Creating);
        s.publish_root(CapType::Thd, CapFlags::READ | CapFlags::GRANT, 0x4000);
        let header = s.load_header();
        assert_eq!(header.status, SlotStatus::Valid);
        assert_eq!(header.cap_type, CapType::Thd);
        assert!(header.flags.contains(CapFlags::READ));
        assert!(!header.flags.contains(CapFlags::WRITE));
        assert_eq!(s.object(), 0x4000);
    }

    #[test]
    fn begin_create_fails_on_occupied_slot() {
        let s = Slot::empty();
        s.begin_create().unwrap();
        assert!(s.begin_create().is_err());
    }

    #[test]
    fn freeze_requires_zero_refcount() {
        let s = Slot::empty();
        s.begin_create().unwrap();
        s.publish_root(CapType::Sig, CapFlags::empty(), 0x1000);
        s.bump_ref();
        assert!(s.freeze(Timestamp(10)).is_err());
        s.drop_ref();
        assert!(s.freeze(Timestamp(10)).is_ok());
    }

    #[test]
    fn finalize_delete_waits_for_quiescence() {
        let s = Slot::empty();
        s.begin_create().unwrap();
        s.publish_root(CapType::Sig, CapFlags::empty(), 0x1000);
        s.freeze(Timestamp(100)).unwrap();
        assert!(s.finalize_delete(Timestamp(120), 64).is_err());
        assert!(s.finalize_delete(Timestamp(200), 64).is_ok());
        assert_eq!(s.load_header().status, SlotStatus::Empty);
    }
}
