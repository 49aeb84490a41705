// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Memory accounting in chunks.
//!
//! The hierarchy is: the segment's pool of chunks, from which each group is
//! granted a slot-quota part and a shared part; each running slot gets a
//! private quota out of its group's quota part; each process charges its
//! usage to its slot. Usage beyond the slot quota spills into the group's
//! shared part.
//!
//! Grants move only under the control lock. Usage counters are atomics that
//! processes update without it.

use crate::{grouptable::GroupData, GroupId, ResGroupCaps, SlotId};
use std::cmp::{max, min};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use tracing::trace;

/// Chunks a group should hold in total.
pub(crate) fn group_mem_expected(total: i32, caps: &ResGroupCaps) -> i32 {
    (total as i64 * caps.memory_limit as i64 / 100) as i32
}

/// Private quota of one slot of the group.
pub(crate) fn slot_mem_quota(total: i32, caps: &ResGroupCaps) -> i32 {
    if caps.concurrency <= 0 {
        return 0;
    }
    let expected = group_mem_expected(total, caps) as i64;
    (expected * (100 - caps.memory_shared_quota) as i64 / 100 / caps.concurrency as i64) as i32
}

pub(crate) fn group_quota_expected(total: i32, caps: &ResGroupCaps) -> i32 {
    slot_mem_quota(total, caps) * max(caps.concurrency, 0)
}

pub(crate) fn group_shared_expected(total: i32, caps: &ResGroupCaps) -> i32 {
    group_mem_expected(total, caps) - group_quota_expected(total, caps)
}

/// Per-slot memory a query may use before spilling to disk.
pub(crate) fn slot_mem_spill(total: i32, caps: &ResGroupCaps) -> i32 {
    if caps.concurrency <= 0 {
        return 0;
    }
    let expected = group_mem_expected(total, caps) as i64;
    (expected * caps.memory_spill_ratio as i64 / caps.concurrency as i64 / 100) as i32
}

pub(crate) struct MemPool {
    total: i32,
    free: AtomicI32,
}

impl MemPool {
    fn new(total: i32) -> Self {
        MemPool {
            total,
            free: AtomicI32::new(total),
        }
    }

    pub(crate) fn total_chunks(&self) -> i32 {
        self.total
    }

    pub(crate) fn free_chunks(&self) -> i32 {
        self.free.load(Ordering::SeqCst)
    }

    /// Takes up to `chunks` out of the pool and reports how many it got.
    fn reserve(&self, chunks: i32) -> i32 {
        if chunks <= 0 {
            return 0;
        }
        let old = self
            .free
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |free| {
                Some(free - min(max(free, 0), chunks))
            })
            .unwrap_or_else(|v| v);
        min(max(old, 0), chunks)
    }

    fn release(&self, chunks: i32) {
        if chunks > 0 {
            self.free.fetch_add(chunks, Ordering::SeqCst);
        }
    }
}

/// The lock-free counters of one group-table entry.
#[derive(Default)]
pub(crate) struct GroupAccounting {
    group_id: AtomicU32,
    mem_usage: AtomicI32,
    mem_shared_usage: AtomicI32,
    mem_shared_granted: AtomicI32,
}

impl GroupAccounting {
    pub(crate) fn group_id(&self) -> GroupId {
        GroupId(self.group_id.load(Ordering::SeqCst))
    }

    pub(crate) fn mem_usage(&self) -> i32 {
        self.mem_usage.load(Ordering::SeqCst)
    }

    pub(crate) fn mem_shared_usage(&self) -> i32 {
        self.mem_shared_usage.load(Ordering::SeqCst)
    }

    pub(crate) fn mem_shared_granted(&self) -> i32 {
        self.mem_shared_granted.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self, id: GroupId) {
        self.mem_usage.store(0, Ordering::SeqCst);
        self.mem_shared_usage.store(0, Ordering::SeqCst);
        self.mem_shared_granted.store(0, Ordering::SeqCst);
        self.group_id.store(id.0, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.reset(GroupId::INVALID)
    }
}

#[derive(Default)]
pub(crate) struct SlotAccounting {
    mem_quota: AtomicI32,
    mem_usage: AtomicI32,
    n_procs: AtomicI32,
}

impl SlotAccounting {
    pub(crate) fn mem_quota(&self) -> i32 {
        self.mem_quota.load(Ordering::SeqCst)
    }

    pub(crate) fn mem_usage(&self) -> i32 {
        self.mem_usage.load(Ordering::SeqCst)
    }

    pub(crate) fn n_procs(&self) -> i32 {
        self.n_procs.load(Ordering::SeqCst)
    }

    pub(crate) fn init(&self, quota: i32) {
        self.mem_usage.store(0, Ordering::SeqCst);
        self.n_procs.store(0, Ordering::SeqCst);
        self.mem_quota.store(quota, Ordering::SeqCst);
    }

    pub(crate) fn inc_procs(&self) -> i32 {
        self.n_procs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn dec_procs(&self) -> i32 {
        self.n_procs.fetch_sub(1, Ordering::SeqCst) - 1
    }
}

pub(crate) struct Ledger {
    pool: MemPool,
    groups: Vec<GroupAccounting>,
    slots: Vec<SlotAccounting>,
}

impl Ledger {
    pub(crate) fn new(total_chunks: i32, max_groups: usize, max_slots: usize) -> Self {
        Ledger {
            pool: MemPool::new(total_chunks),
            groups: (0..max_groups).map(|_| GroupAccounting::default()).collect(),
            slots: (0..max_slots).map(|_| SlotAccounting::default()).collect(),
        }
    }

    pub(crate) fn pool(&self) -> &MemPool {
        &self.pool
    }

    pub(crate) fn group(&self, idx: usize) -> &GroupAccounting {
        &self.groups[idx]
    }

    pub(crate) fn slot(&self, slot: SlotId) -> &SlotAccounting {
        &self.slots[slot.0]
    }

    pub(crate) fn reserve_from_pool(&self, group: GroupId, chunks: i32) -> i32 {
        let got = self.pool.reserve(chunks);
        trace!(
            "{:?} reserved {} of {} chunks from the pool, {} left",
            group,
            got,
            chunks,
            self.pool.free_chunks()
        );
        got
    }

    pub(crate) fn release_to_pool(&self, group: GroupId, chunks: i32) {
        self.pool.release(chunks);
        trace!(
            "{:?} released {} chunks to the pool, {} free",
            group,
            chunks,
            self.pool.free_chunks()
        );
    }

    /// Chunks granted to the group, quota and shared parts together.
    pub(crate) fn granted(&self, g: &GroupData) -> i32 {
        g.mem_quota_granted + self.groups[g.idx].mem_shared_granted()
    }

    /// Tops the group's grant up towards what its caps expect, filling the
    /// shared part first. Returns the chunks obtained.
    pub(crate) fn auto_reserve(&self, g: &mut GroupData) -> i32 {
        let total = self.pool.total;
        let needed = group_mem_expected(total, &g.caps) - self.granted(g);
        if needed <= 0 {
            return 0;
        }
        let got = self.reserve_from_pool(g.id, needed);
        let acc = &self.groups[g.idx];
        let shared_room = max(
            0,
            group_shared_expected(total, &g.caps) - acc.mem_shared_granted(),
        );
        let to_shared = min(got, shared_room);
        acc.mem_shared_granted.fetch_add(to_shared, Ordering::SeqCst);
        g.mem_quota_granted += got - to_shared;
        got
    }

    /// Hands `quota` chunks of the group's quota part to a new slot,
    /// topping the grant up from the pool first if needed.
    pub(crate) fn group_reserve_mem_quota(&self, g: &mut GroupData, quota: i32) -> bool {
        if g.mem_quota_used + quota > g.mem_quota_granted {
            self.auto_reserve(g);
            if g.mem_quota_used + quota > g.mem_quota_granted {
                trace!(
                    "{:?}: no quota for a slot of {} chunks ({} of {} in use)",
                    g.id,
                    quota,
                    g.mem_quota_used,
                    g.mem_quota_granted
                );
                return false;
            }
        }
        g.mem_quota_used += quota;
        true
    }

    pub(crate) fn group_release_mem_quota(&self, g: &mut GroupData, quota: i32) {
        g.mem_quota_used -= quota;
    }

    /// Returns to the pool whatever the group holds beyond what its running
    /// slots, its idle slots and its shared usage need.
    pub(crate) fn auto_release(&self, g: &mut GroupData) -> i32 {
        let total = self.pool.total;
        let acc = &self.groups[g.idx];
        let idle = max(0, g.caps.concurrency - g.n_running as i32);
        let quota_needed = g.mem_quota_used + idle * slot_mem_quota(total, &g.caps);
        let shared_needed = max(
            acc.mem_shared_usage(),
            group_shared_expected(total, &g.caps),
        );
        let quota_excess = max(0, g.mem_quota_granted - quota_needed);
        let shared_excess = max(0, acc.mem_shared_granted() - shared_needed);
        g.mem_quota_granted -= quota_excess;
        acc.mem_shared_granted
            .fetch_sub(shared_excess, Ordering::SeqCst);
        let released = quota_excess + shared_excess;
        if released > 0 {
            self.release_to_pool(g.id, released);
        }
        released
    }

    pub(crate) fn release_all(&self, g: &mut GroupData) -> i32 {
        let acc = &self.groups[g.idx];
        let released = g.mem_quota_granted + acc.mem_shared_granted.swap(0, Ordering::SeqCst);
        g.mem_quota_granted = 0;
        g.mem_quota_used = 0;
        self.release_to_pool(g.id, released);
        released
    }

    /// Charges `chunks` to the slot and group. Returns by how much the
    /// group's shared usage now exceeds its shared grant.
    pub(crate) fn inc_usage(&self, group_idx: usize, slot: SlotId, chunks: i32) -> i32 {
        let s = &self.slots[slot.0];
        let g = &self.groups[group_idx];
        let slot_usage = s.mem_usage.fetch_add(chunks, Ordering::SeqCst) + chunks;
        let shared = min(chunks, max(0, slot_usage - s.mem_quota()));
        let mut overuse = 0;
        if shared > 0 {
            let total_shared = g.mem_shared_usage.fetch_add(shared, Ordering::SeqCst) + shared;
            overuse = max(0, total_shared - g.mem_shared_granted());
        }
        g.mem_usage.fetch_add(chunks, Ordering::SeqCst);
        overuse
    }

    /// Reverses [Ledger::inc_usage], taking back the same shared portion the
    /// charge added.
    pub(crate) fn dec_usage(&self, group_idx: usize, slot: SlotId, chunks: i32) {
        let s = &self.slots[slot.0];
        let g = &self.groups[group_idx];
        let old = s.mem_usage.fetch_sub(chunks, Ordering::SeqCst);
        let shared = min(chunks, max(0, old - s.mem_quota()));
        if shared > 0 {
            g.mem_shared_usage.fetch_sub(shared, Ordering::SeqCst);
        }
        g.mem_usage.fetch_sub(chunks, Ordering::SeqCst);
    }
}
