/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Kernel trace ring (ambient stack, `SPEC_FULL.md`).
//!
//! Not a logging facade: a small fixed-capacity ring of [`Event`] recording
//! capability-engine transitions, scheduler decisions and fault events,
//! meant to be read back post-mortem by a debugger or host tool rather than
//! printed live. Grounded on `oxidecomputer-hubris`'s `lib/ringbuf` crate,
//! which keeps exactly this kind of fixed-size `Copy`-entry ring for
//! diagnosing tasks/drivers; guarded the same way every other arena in this
//! crate is guarded, with [`crate::sync::NullLock`], since the ring is
//! diagnostic bookkeeping rather than a hot path that needs to scale across
//! cores.

use crate::config::TRACE_CAPACITY;
use crate::sync::NullLock;

/// One recorded kernel event. Kept small and `Copy` so pushing a trace
/// entry never allocates or blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    CapCreated { cpt_idx: usize, slot: usize },
    CapFrozen { cpt_idx: usize, slot: usize },
    CapDeleted { cpt_idx: usize, slot: usize },
    ThdBound { thd_idx: usize, cpu: usize },
    ThdTimeout { thd_idx: usize },
    ThdPreempted { cpu: usize, from: usize, to: usize },
    SigSent { sig_idx: usize },
    SigBlocked { sig_idx: usize, thd_idx: usize },
    InvActivated { inv_idx: usize, thd_idx: usize },
    InvReturned { inv_idx: usize },
    Fault { thd_idx: usize, killed: bool },
}

struct Ring {
    entries: [Option<Event>; TRACE_CAPACITY],
    next: usize,
}

impl Ring {
    const NONE: Option<Event> = None;

    const fn new() -> Self {
        Ring {
            entries: [Self::NONE; TRACE_CAPACITY],
            next: 0,
        }
    }

    fn push(&mut self, event: Event) {
        self.entries[self.next] = Some(event);
        self.next = (self.next + 1) % TRACE_CAPACITY;
    }

    fn snapshot_into(&self, out: &mut [Option<Event>]) -> usize {
        let mut n = 0;
        for i in 0..TRACE_CAPACITY {
            let idx = (self.next + i) % TRACE_CAPACITY;
            if let Some(event) = self.entries[idx] {
                if n >= out.len() {
                    break;
                }
                out[n] = Some(event);
                n += 1;
            }
        }
        n
    }
}

static RING: NullLock<Ring> = NullLock::new(Ring::new());

/// Record one event. Infallible and non-blocking; the oldest entry is
/// silently overwritten once the ring wraps (spec's trace ring is a
/// diagnostic aid, not an audit log — §7's "no kernel recovery" style
/// all-or-nothing guarantees do not apply here).
pub fn record(event: Event) {
    RING.lock(|ring| ring.push(event));
}

/// Copy up to `out.len()` most-recently-recorded events into `out`, oldest
/// first, returning how many were written. Used by tests and by a
/// post-mortem host tool walking the ring through a debugger.
pub fn snapshot(out: &mut [Option<Event>]) -> usize {
    RING.lock(|ring| ring.snapshot_into(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests below build their own `Ring` rather than going through the
    // process-wide `RING` static, since the latter is shared across every
    // test binary thread and would make assertions about adjacency flaky.

    #[test]
    fn push_then_snapshot_round_trips_in_order() {
        let mut ring = Ring::new();
        ring.push(Event::CapCreated { cpt_idx: 1, slot: 2 });
        ring.push(Event::CapFrozen { cpt_idx: 1, slot: 2 });
        let mut out = [None; 8];
        let n = ring.snapshot_into(&mut out);
        assert_eq!(n, 2);
        assert_eq!(out[0], Some(Event::CapCreated { cpt_idx: 1, slot: 2 }));
        assert_eq!(out[1], Some(Event::CapFrozen { cpt_idx: 1, slot: 2 }));
    }

    #[test]
    fn ring_wraps_without_panicking() {
        let mut ring = Ring::new();
        for i in 0..(TRACE_CAPACITY * 2 + 3) {
            ring.push(Event::ThdTimeout { thd_idx: i });
        }
        let mut out = [None; TRACE_CAPACITY];
        let n = ring.snapshot_into(&mut out);
        assert_eq!(n, TRACE_CAPACITY);
        // the ring kept only the most recent TRACE_CAPACITY entries
        assert_eq!(out[TRACE_CAPACITY - 1], Some(Event::ThdTimeout { thd_idx: TRACE_CAPACITY * 2 + 2 }));
    }

    #[test]
    fn record_is_reachable_through_the_global_ring() {
        record(Event::Fault { thd_idx: 9, killed: true });
        let mut out = [None; TRACE_CAPACITY];
        let n = snapshot(&mut out);
        assert!(out[..n].contains(&Some(Event::Fault { thd_idx: 9, killed: true })));
    }
}
