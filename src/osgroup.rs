// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The operating-system side of a resource group: a control group (or the
//! platform's equivalent) that actually caps CPU and memory for the
//! processes assigned to it. The runtime only ever talks to it through
//! [OsGroupBackend].

use crate::{Error, GroupId, ProcId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::trace;

pub trait OsGroupBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn create_group(&self, group: GroupId) -> Result<(), Error>;
    fn destroy_group(&self, group: GroupId) -> Result<(), Error>;
    fn assign_process(&self, group: GroupId, proc: ProcId) -> Result<(), Error>;
    fn set_cpu_limit(&self, group: GroupId, percent: i32) -> Result<(), Error>;
    fn set_memory_limit_bytes(&self, group: GroupId, bytes: u64) -> Result<(), Error>;
    fn total_memory(&self) -> u64;
    fn cpu_cores(&self) -> u32;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OsGroupLimits {
    pub cpu_percent: i32,
    pub memory_bytes: u64,
    pub processes: BTreeSet<ProcId>,
}

/// A backend that enforces nothing and remembers what it was told.
pub struct NullOsGroup {
    total_memory: u64,
    cpu_cores: u32,
    groups: Mutex<BTreeMap<GroupId, OsGroupLimits>>,
}

impl NullOsGroup {
    pub fn new(total_memory: u64, cpu_cores: u32) -> Self {
        NullOsGroup {
            total_memory,
            cpu_cores,
            groups: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn limits(&self, group: GroupId) -> Option<OsGroupLimits> {
        self.groups.lock().ok()?.get(&group).cloned()
    }

    pub fn groups(&self) -> Vec<GroupId> {
        match self.groups.lock() {
            Ok(g) => g.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn with_group<F>(&self, group: GroupId, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut OsGroupLimits),
    {
        let mut guard = self
            .groups
            .lock()
            .map_err(|_| Error::OsGroup("group registry poisoned".into()))?;
        match guard.get_mut(&group) {
            None => Err(Error::OsGroup(format!("no OS group for {:?}", group))),
            Some(limits) => {
                f(limits);
                Ok(())
            }
        }
    }
}

impl OsGroupBackend for NullOsGroup {
    fn name(&self) -> &'static str {
        "null"
    }

    fn create_group(&self, group: GroupId) -> Result<(), Error> {
        trace!("null OS backend: create {:?}", group);
        let mut guard = self
            .groups
            .lock()
            .map_err(|_| Error::OsGroup("group registry poisoned".into()))?;
        guard.entry(group).or_default();
        Ok(())
    }

    fn destroy_group(&self, group: GroupId) -> Result<(), Error> {
        trace!("null OS backend: destroy {:?}", group);
        let mut guard = self
            .groups
            .lock()
            .map_err(|_| Error::OsGroup("group registry poisoned".into()))?;
        guard.remove(&group);
        Ok(())
    }

    fn assign_process(&self, group: GroupId, proc: ProcId) -> Result<(), Error> {
        let mut guard = self
            .groups
            .lock()
            .map_err(|_| Error::OsGroup("group registry poisoned".into()))?;
        // A process lives in exactly one group.
        for limits in guard.values_mut() {
            limits.processes.remove(&proc);
        }
        match guard.get_mut(&group) {
            None => Err(Error::OsGroup(format!("no OS group for {:?}", group))),
            Some(limits) => {
                limits.processes.insert(proc);
                Ok(())
            }
        }
    }

    fn set_cpu_limit(&self, group: GroupId, percent: i32) -> Result<(), Error> {
        self.with_group(group, |l| l.cpu_percent = percent)
    }

    fn set_memory_limit_bytes(&self, group: GroupId, bytes: u64) -> Result<(), Error> {
        self.with_group(group, |l| l.memory_bytes = bytes)
    }

    fn total_memory(&self) -> u64 {
        self.total_memory
    }

    fn cpu_cores(&self) -> u32 {
        self.cpu_cores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_backend_tracks_membership() {
        let os = NullOsGroup::new(1 << 30, 4);
        os.create_group(GroupId(1)).unwrap();
        os.create_group(GroupId(2)).unwrap();
        os.assign_process(GroupId(1), ProcId(7)).unwrap();
        os.assign_process(GroupId(2), ProcId(7)).unwrap();
        assert!(os.limits(GroupId(1)).unwrap().processes.is_empty());
        assert!(os.limits(GroupId(2)).unwrap().processes.contains(&ProcId(7)));
        os.set_cpu_limit(GroupId(2), 25).unwrap();
        assert_eq!(os.limits(GroupId(2)).unwrap().cpu_percent, 25);
        os.destroy_group(GroupId(2)).unwrap();
        assert!(os.set_cpu_limit(GroupId(2), 25).is_err());
        assert_eq!(os.groups(), vec![GroupId(1)]);
    }
}
