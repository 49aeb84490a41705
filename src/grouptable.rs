// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The fixed-capacity table of resource groups. Entries live in an arena
//! addressed by index; the index doubles as the position of the group's
//! lock-free counters in the [Ledger], so it never changes while the group
//! exists. Every access happens under the runtime's control lock.

use crate::{memquota::Ledger, Error, GroupId, ProcId, ResGroupCaps};
use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

pub(crate) struct GroupData {
    pub(crate) id: GroupId,
    pub(crate) idx: usize,
    pub(crate) caps: ResGroupCaps,
    pub(crate) n_running: u32,

    /// Processes waiting for a slot, oldest first.
    pub(crate) wait_queue: VecDeque<ProcId>,

    pub(crate) total_executed: u64,
    pub(crate) total_queued: u64,
    pub(crate) total_queue_duration: Duration,

    /// Set while a `DROP` of the group is in flight; new arrivals queue.
    pub(crate) locked_for_drop: bool,

    /// Chunks taken from the pool for slot quotas, and how many of those
    /// are handed out to slots right now.
    pub(crate) mem_quota_granted: i32,
    pub(crate) mem_quota_used: i32,
}

impl GroupData {
    pub(crate) fn new(id: GroupId, idx: usize, caps: ResGroupCaps) -> Self {
        GroupData {
            id,
            idx,
            caps,
            n_running: 0,
            wait_queue: VecDeque::new(),
            total_executed: 0,
            total_queued: 0,
            total_queue_duration: Duration::default(),
            locked_for_drop: false,
            mem_quota_granted: 0,
            mem_quota_used: 0,
        }
    }
}

/// A point-in-time view of one group, as the statistics views report it.
/// Memory figures are in chunks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStatus {
    pub group: GroupId,
    pub caps: ResGroupCaps,
    pub n_running: u32,
    pub n_queueing: usize,
    pub total_executed: u64,
    pub total_queued: u64,
    pub total_queue_duration: Duration,
    pub locked_for_drop: bool,
    pub mem_usage: i32,
    pub mem_shared_usage: i32,
    pub mem_quota_granted: i32,
    pub mem_quota_used: i32,
    pub mem_shared_granted: i32,
}

pub(crate) struct GroupTable {
    index: HashMap<GroupId, usize>,
    groups: Vec<Option<GroupData>>,
}

impl GroupTable {
    pub(crate) fn new(capacity: usize) -> Self {
        GroupTable {
            index: HashMap::new(),
            groups: (0..capacity).map(|_| None).collect(),
        }
    }

    pub(crate) fn insert(
        &mut self,
        id: GroupId,
        caps: ResGroupCaps,
        ledger: &Ledger,
    ) -> Result<&mut GroupData, Error> {
        if !id.is_valid() {
            return Err(Error::GroupNotFound(id));
        }
        if self.index.contains_key(&id) {
            return Err(Error::GroupExists(id));
        }
        let idx = self
            .groups
            .iter()
            .position(|g| g.is_none())
            .ok_or_else(|| Error::TooManyGroups(self.groups.len()))?;
        ledger.group(idx).reset(id);
        self.index.insert(id, idx);
        Ok(self.groups[idx].get_or_insert(GroupData::new(id, idx, caps)))
    }

    pub(crate) fn find(&self, id: GroupId) -> Option<&GroupData> {
        let idx = *self.index.get(&id)?;
        self.groups[idx].as_ref()
    }

    pub(crate) fn find_mut(&mut self, id: GroupId) -> Option<&mut GroupData> {
        let idx = *self.index.get(&id)?;
        self.groups[idx].as_mut()
    }

    pub(crate) fn get(&self, id: GroupId) -> Result<&GroupData, Error> {
        self.find(id).ok_or(Error::GroupNotFound(id))
    }

    pub(crate) fn get_mut(&mut self, id: GroupId) -> Result<&mut GroupData, Error> {
        self.find_mut(id).ok_or(Error::GroupNotFound(id))
    }

    /// Removes the group and returns every chunk it was granted to the pool.
    pub(crate) fn remove(&mut self, id: GroupId, ledger: &Ledger) -> Option<GroupData> {
        let idx = self.index.remove(&id)?;
        if let Some(g) = self.groups[idx].as_mut() {
            ledger.release_all(g);
        }
        ledger.group(idx).clear();
        self.groups[idx].take()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &GroupData> {
        self.groups.iter().filter_map(|g| g.as_ref())
    }

    pub(crate) fn status(&self, id: GroupId, ledger: &Ledger) -> Result<GroupStatus, Error> {
        let g = self.get(id)?;
        let acc = ledger.group(g.idx);
        Ok(GroupStatus {
            group: g.id,
            caps: g.caps,
            n_running: g.n_running,
            n_queueing: g.wait_queue.len(),
            total_executed: g.total_executed,
            total_queued: g.total_queued,
            total_queue_duration: g.total_queue_duration,
            locked_for_drop: g.locked_for_drop,
            mem_usage: acc.mem_usage(),
            mem_shared_usage: acc.mem_shared_usage(),
            mem_quota_granted: g.mem_quota_granted,
            mem_quota_used: g.mem_quota_used,
            mem_shared_granted: acc.mem_shared_granted(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_reuses_freed_entries() {
        let ledger = Ledger::new(100, 2, 4);
        let mut t = GroupTable::new(2);
        let caps = ResGroupCaps::admin_group();
        assert_eq!(t.insert(GroupId(1), caps, &ledger).unwrap().idx, 0);
        assert_eq!(t.insert(GroupId(2), caps, &ledger).unwrap().idx, 1);
        assert_eq!(
            t.insert(GroupId(3), caps, &ledger).err(),
            Some(Error::TooManyGroups(2))
        );
        assert_eq!(
            t.insert(GroupId(2), caps, &ledger).err(),
            Some(Error::GroupExists(GroupId(2)))
        );
        assert!(t.remove(GroupId(1), &ledger).is_some());
        assert_eq!(ledger.group(0).group_id(), GroupId::INVALID);
        assert_eq!(t.insert(GroupId(3), caps, &ledger).unwrap().idx, 0);
        assert_eq!(ledger.group(0).group_id(), GroupId(3));
        assert_eq!(t.iter().count(), 2);
        assert_eq!(t.get(GroupId(1)).err(), Some(Error::GroupNotFound(GroupId(1))));
    }
}
