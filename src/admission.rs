// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The admission scheduler's shared state and the synchronous steps that
//! run under the runtime's control lock. None of these functions blocks:
//! any waiter they decide to wake is returned as a [Latch] which the caller
//! sets after releasing the lock.

use crate::{
    grouptable::GroupTable,
    latch::Latch,
    memquota::{slot_mem_quota, slot_mem_spill, Ledger},
    slotpool::SlotPool,
    Error, GroupId, ProcId, ResGroupCaps, ResGroupConfig, SessionId, SlotId,
};
use std::{collections::HashMap, time::Instant};
use tracing::{debug, trace, warn};

/// A registered process as the scheduler sees it.
pub(crate) struct ProcWait {
    pub(crate) latch: Latch,

    /// In some group's wait queue.
    pub(crate) waiting: bool,

    /// Handed over by a waker; the process claims it when it runs next.
    pub(crate) granted: Option<SlotId>,

    /// The group being waited on, until the wait is claimed or cancelled.
    pub(crate) group: Option<GroupId>,
    pub(crate) wait_start: Option<Instant>,

    /// Whether this wait shows up in the group's queueing statistics.
    pub(crate) counted: bool,
}

impl ProcWait {
    pub(crate) fn new(latch: Latch) -> Self {
        ProcWait {
            latch,
            waiting: false,
            granted: None,
            group: None,
            wait_start: None,
            counted: false,
        }
    }
}

pub(crate) struct Control {
    pub(crate) groups: GroupTable,
    pub(crate) slots: SlotPool,
    pub(crate) procs: HashMap<ProcId, ProcWait>,

    /// Segment-side slots shared by all processes of a session.
    pub(crate) session_slots: HashMap<SessionId, SlotId>,
}

impl Control {
    pub(crate) fn new(config: &ResGroupConfig) -> Self {
        Control {
            groups: GroupTable::new(config.max_resource_groups),
            slots: SlotPool::new(config.max_slots),
            procs: HashMap::new(),
            session_slots: HashMap::new(),
        }
    }

    /// Tries to take a slot in `group` for an admitted transaction: checks
    /// concurrency, carves the slot's quota out of the group's grant and
    /// allocates the slot. Leaves no trace if any step fails.
    pub(crate) fn get_slot(&mut self, group: GroupId, ledger: &Ledger) -> Option<SlotId> {
        let total = ledger.pool().total_chunks();
        let g = self.groups.find_mut(group)?;
        if g.n_running as i32 >= g.caps.concurrency {
            return None;
        }
        let caps = g.caps;
        let quota = slot_mem_quota(total, &caps);
        if !ledger.group_reserve_mem_quota(g, quota) {
            return None;
        }
        let slot = match self.slots.alloc(group, caps) {
            Some(slot) => slot,
            None => {
                ledger.group_release_mem_quota(g, quota);
                return None;
            }
        };
        ledger.slot(slot).init(quota);
        self.slots.get_mut(slot).mem_spill = slot_mem_spill(total, &caps);
        g.n_running += 1;
        Some(slot)
    }

    /// Gives a slot back: its quota to the group, surplus grant to the pool,
    /// and the slot itself to the free list.
    pub(crate) fn put_slot(&mut self, slot: SlotId, ledger: &Ledger) -> Result<(), Error> {
        let data = self.slots.get(slot);
        let (group, session_owned) = (data.group, data.session_owned);
        let quota = ledger.slot(slot).mem_quota();
        if let Some(g) = self.groups.find_mut(group) {
            ledger.group_release_mem_quota(g, quota);
            if !session_owned {
                g.n_running = g.n_running.saturating_sub(1);
            }
            ledger.auto_release(g);
        }
        ledger.slot(slot).init(0);
        self.slots.free(slot)
    }

    /// Allocates a slot for a whole session on a segment, with the
    /// capabilities the coordinator dispatched.
    pub(crate) fn alloc_session_slot(
        &mut self,
        session: SessionId,
        group: GroupId,
        caps: ResGroupCaps,
        ledger: &Ledger,
    ) -> Result<SlotId, Error> {
        let total = ledger.pool().total_chunks();
        let g = self.groups.get_mut(group)?;
        let quota = slot_mem_quota(total, &caps);
        if !ledger.group_reserve_mem_quota(g, quota) {
            return Err(Error::InsufficientMemory(group));
        }
        let slot = match self.slots.alloc(group, caps) {
            Some(slot) => slot,
            None => {
                ledger.group_release_mem_quota(g, quota);
                return Err(Error::SlotPoolExhausted);
            }
        };
        ledger.slot(slot).init(quota);
        let data = self.slots.get_mut(slot);
        data.session = Some(session);
        data.session_owned = true;
        data.mem_spill = slot_mem_spill(total, &caps);
        self.session_slots.insert(session, slot);
        debug!("{:?} got session {:?} in {:?}", session, slot, group);
        Ok(slot)
    }

    /// Frees a session-owned slot whose last process has detached.
    pub(crate) fn free_session_slot(
        &mut self,
        session: SessionId,
        slot: SlotId,
        ledger: &Ledger,
    ) -> Result<Vec<Latch>, Error> {
        if self.session_slots.get(&session) == Some(&slot) {
            self.session_slots.remove(&session);
        }
        self.put_slot(slot, ledger)?;
        Ok(self.wake_all_groups(ledger))
    }

    fn enqueue(&mut self, proc: ProcId, group: GroupId, counted: bool) -> Result<(), Error> {
        let g = self.groups.get_mut(group)?;
        g.wait_queue.push_back(proc);
        if counted {
            g.total_queued += 1;
        }
        let w = self
            .procs
            .get_mut(&proc)
            .ok_or_else(|| Error::InvariantViolation(format!("{:?} is not registered", proc)))?;
        w.waiting = true;
        w.granted = None;
        w.group = Some(group);
        w.wait_start = Some(Instant::now());
        w.counted = counted;
        trace!("{:?} queued on {:?}", proc, group);
        Ok(())
    }

    /// One admission attempt. A slot is taken directly only when nobody is
    /// queued ahead; otherwise the process joins the queue and `None` comes
    /// back. Arrivals during a pending drop wait without being counted.
    pub(crate) fn try_admit(
        &mut self,
        proc: ProcId,
        group: GroupId,
        ledger: &Ledger,
        retried: bool,
    ) -> Result<Option<SlotId>, Error> {
        let (locked, queue_empty) = match self.groups.find(group) {
            Some(g) => (g.locked_for_drop, g.wait_queue.is_empty()),
            None if retried => return Err(Error::GroupConcurrentlyDropped(group)),
            None => return Err(Error::GroupNotFound(group)),
        };
        if !locked && queue_empty {
            if let Some(slot) = self.get_slot(group, ledger) {
                if let Some(g) = self.groups.find_mut(group) {
                    g.total_executed += 1;
                }
                return Ok(Some(slot));
            }
        }
        self.enqueue(proc, group, !locked)?;
        Ok(None)
    }

    /// Called by a woken process. Takes the slot a waker handed over, if
    /// any, and folds the wait into the group's statistics.
    pub(crate) fn claim_grant(&mut self, proc: ProcId) -> Option<SlotId> {
        let w = self.procs.get_mut(&proc)?;
        let slot = w.granted.take();
        let group = w.group.take();
        let start = w.wait_start.take();
        if let (Some(slot), Some(group)) = (slot, group) {
            if let Some(g) = self.groups.find_mut(group) {
                g.total_executed += 1;
                if w.counted {
                    g.total_queue_duration += start.map(|s| s.elapsed()).unwrap_or_default();
                }
            }
            return Some(slot);
        }
        slot
    }

    pub(crate) fn is_waiting(&self, proc: ProcId) -> bool {
        self.procs.get(&proc).map_or(false, |w| w.waiting)
    }

    /// Grants slots to the group's waiters in arrival order, stopping at the
    /// first one that cannot be granted so nobody jumps the queue.
    pub(crate) fn wake_up_waiters(&mut self, group: GroupId, ledger: &Ledger) -> Vec<Latch> {
        let mut woken = Vec::new();
        loop {
            let proc = match self.groups.find(group) {
                Some(g) if !g.locked_for_drop => match g.wait_queue.front() {
                    Some(p) => *p,
                    None => break,
                },
                _ => break,
            };
            let slot = match self.get_slot(group, ledger) {
                Some(slot) => slot,
                None => break,
            };
            if let Some(g) = self.groups.find_mut(group) {
                g.wait_queue.pop_front();
            }
            match self.procs.get_mut(&proc) {
                Some(w) => {
                    w.waiting = false;
                    w.granted = Some(slot);
                    woken.push(w.latch.clone());
                    trace!("granted {:?} to waiting {:?}", slot, proc);
                }
                None => {
                    warn!("{:?} left {:?}'s queue without cancelling", proc, group);
                    if let Err(e) = self.put_slot(slot, ledger) {
                        warn!("returning orphaned {:?}: {}", slot, e);
                    }
                }
            }
        }
        woken
    }

    /// Runs [Control::wake_up_waiters] over every group with a queue; used
    /// after memory goes back to the pool, which any group may be short of.
    pub(crate) fn wake_all_groups(&mut self, ledger: &Ledger) -> Vec<Latch> {
        let queued: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|g| !g.wait_queue.is_empty())
            .map(|g| g.id)
            .collect();
        queued
            .into_iter()
            .flat_map(|id| self.wake_up_waiters(id, ledger))
            .collect()
    }

    /// Empties the group's queue without granting anything; each waiter
    /// wakes up, finds no slot and retries from the start.
    pub(crate) fn wake_all(&mut self, group: GroupId) -> Vec<Latch> {
        let drained: Vec<ProcId> = match self.groups.find_mut(group) {
            Some(g) => g.wait_queue.drain(..).collect(),
            None => return Vec::new(),
        };
        drained
            .into_iter()
            .filter_map(|p| {
                let w = self.procs.get_mut(&p)?;
                w.waiting = false;
                w.granted = None;
                Some(w.latch.clone())
            })
            .collect()
    }

    /// Undoes whatever wait the process is in the middle of. A process
    /// still in the queue leaves it; a process that was granted a slot it
    /// never claimed gives the slot to whoever is next. Calling this on a
    /// process with no wait in progress does nothing.
    pub(crate) fn wait_cancel(&mut self, proc: ProcId, ledger: &Ledger) -> Vec<Latch> {
        let (group, start, counted, granted, was_waiting) = match self.procs.get_mut(&proc) {
            Some(w) => (
                w.group.take(),
                w.wait_start.take(),
                w.counted,
                w.granted.take(),
                std::mem::replace(&mut w.waiting, false),
            ),
            None => return Vec::new(),
        };
        let group = match group {
            Some(group) => group,
            None => return Vec::new(),
        };
        let waited = start.map(|s| s.elapsed()).unwrap_or_default();
        if was_waiting {
            if let Some(g) = self.groups.find_mut(group) {
                g.wait_queue.retain(|p| *p != proc);
                if counted {
                    g.total_queue_duration += waited;
                }
            }
            debug!("{:?} gave up waiting on {:?}", proc, group);
            Vec::new()
        } else if let Some(slot) = granted {
            if let Some(g) = self.groups.find_mut(group) {
                g.total_executed += 1;
                if counted {
                    g.total_queue_duration += waited;
                }
            }
            debug!("{:?} gave up granted {:?} in {:?}", proc, slot, group);
            if let Err(e) = self.put_slot(slot, ledger) {
                warn!("returning cancelled {:?}: {}", slot, e);
            }
            let mut woken = self.wake_up_waiters(group, ledger);
            woken.extend(self.wake_all_groups(ledger));
            woken
        } else {
            Vec::new()
        }
    }
}
