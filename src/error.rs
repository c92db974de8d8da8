/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Kernel error taxonomy (spec §7).
//!
//! Each failure class gets its own `snafu`-derived enum, the way the
//! teacher's `caps::CapError` is a small `Snafu` enum rather than a single
//! flat error type. [`KError`] unifies them for the syscall ABI, where all
//! errors are returned as a single negative `isize` (spec §6.3).

use snafu::Snafu;

/// Capability-table family errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum CptError {
    /// No such capability (empty slot, or resolution failed).
    Null,
    /// Target capability is frozen.
    Frozen,
    /// Destination slot is already occupied.
    Exist,
    /// Kernel-object-table memory allocation failed.
    Kot,
    /// Capability is still referenced (non-zero `root_ref`).
    Refcnt,
    /// Requested operation/flag is not a subset of the slot's permissions,
    /// or a requested sub-range is out of bounds.
    Flag,
    /// Not yet quiescent since freeze.
    Quie,
    /// A numeric range argument was invalid.
    Range,
}

/// Page-table family errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum PgtError {
    /// The HAL rejected the operation (architectural reasons).
    Hw,
    /// Address argument invalid (alignment, size-order, overlap).
    Addr,
    /// Mapping already present / construction link already exists.
    Map,
    /// Requested permissions are not a subset of the source's.
    Perm,
    /// The HAL-level page operation itself failed (`RME_ERR_PGT_OPFAIL`).
    Opfail,
}

/// Thread/scheduler family errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum PthError {
    /// Priority exceeds what the caller/parent permits.
    Prio,
    /// Thread is not in the state required for this operation.
    InvState,
    /// Lost a compare-and-swap race against another core.
    Conflict,
    /// No pending scheduler notification to receive.
    Notif,
    /// Scheduler reference count is not zero.
    Refcnt,
    /// Hypervisor external register-save address is invalid.
    Haddr,
    /// Thread is pending an unhandled exception.
    Exc,
    /// A time-budget operation would exceed `MAX_TIME` or wrap around.
    Overflow,
}

/// Signal/invocation family errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum SivError {
    /// Invocation port is already active on another thread.
    Act,
    /// Signal counter saturated at `MAX_SIG_NUM`.
    Full,
    /// Nothing to receive (non-blocking receive on an empty endpoint).
    Empty,
    /// Blocked thread was released via `Sched_Free`.
    Free,
    /// Lost the CAS race to become the blocked thread on an endpoint.
    Conflict,
    /// An init thread attempted to block.
    Boot,
    /// Invocation return declined because the port forbids fault-return.
    Fault,
}

/// Kernel Object Table errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum KotError {
    /// Bitmap range was misaligned, already (un)populated, or the CAS
    /// protocol lost a race and rolled back.
    Bmp,
}

/// Unified kernel error, convertible to the single negative-`isize`
/// syscall return value (spec §6.3: "All codes are negative ... to
/// distinguish from success/TID values").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum KError {
    #[snafu(context(false))]
    Cpt {
        source: CptError,
    },
    #[snafu(context(false))]
    Pgt {
        source: PgtError,
    },
    #[snafu(context(false))]
    Pth {
        source: PthError,
    },
    #[snafu(context(false))]
    Siv {
        source: SivError,
    },
    #[snafu(context(false))]
    Kot {
        source: KotError,
    },
}

impl KError {
    /// Stable negative wire code returned in the syscall retval register.
    /// Numbering is internal to this port (the original C kernel used its
    /// own `RME_ERR_*` numbering); what matters for the ABI is only that
    /// every distinct error class maps to a distinct negative value.
    pub const fn code(self) -> isize {
        match self {
            KError::Cpt { source } => -(1 + source as isize),
            KError::Pgt { source } => -(16 + source as isize),
            KError::Pth { source } => -(32 + source as isize),
            KError::Siv { source } => -(64 + source as isize),
            KError::Kot { source } => -(96 + source as isize),
        }
    }
}

impl From<KError> for isize {
    fn from(e: KError) -> isize {
        e.code()
    }
}

pub type KResult<T> = Result<T, KError>;
