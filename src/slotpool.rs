// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, GroupId, ResGroupCaps, SessionId, SlotId};
use tracing::trace;

/// One execution slot. A slot in use belongs to exactly one group and
/// carries the capabilities it was granted under, which may be older than
/// the group's current ones.
#[derive(Clone, Debug, Default)]
pub(crate) struct SlotData {
    pub(crate) group: GroupId,
    pub(crate) session: Option<SessionId>,
    pub(crate) caps: ResGroupCaps,
    pub(crate) mem_spill: i32,
    pub(crate) in_use: bool,

    /// Allocated on a segment on behalf of a whole session rather than
    /// granted through admission; freed when the session's last process
    /// detaches.
    pub(crate) session_owned: bool,
}

pub(crate) struct SlotPool {
    slots: Vec<SlotData>,
    free: Vec<SlotId>,
}

impl SlotPool {
    pub(crate) fn new(capacity: usize) -> Self {
        SlotPool {
            slots: vec![SlotData::default(); capacity],
            free: (0..capacity).rev().map(SlotId).collect(),
        }
    }

    pub(crate) fn alloc(&mut self, group: GroupId, caps: ResGroupCaps) -> Option<SlotId> {
        let id = self.free.pop()?;
        self.slots[id.0] = SlotData {
            group,
            session: None,
            caps,
            mem_spill: 0,
            in_use: true,
            session_owned: false,
        };
        trace!("allocated {:?} for {:?}", id, group);
        Some(id)
    }

    pub(crate) fn free(&mut self, id: SlotId) -> Result<(), Error> {
        match self.slots.get_mut(id.0) {
            Some(slot) if slot.in_use => {
                trace!("freed {:?} of {:?}", id, slot.group);
                *slot = SlotData::default();
                self.free.push(id);
                Ok(())
            }
            _ => Err(Error::InvariantViolation(format!(
                "freeing {:?} which is not in use",
                id
            ))),
        }
    }

    pub(crate) fn get(&self, id: SlotId) -> &SlotData {
        &self.slots[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: SlotId) -> &mut SlotData {
        &mut self.slots[id.0]
    }

    /// Slots in use that belong to `group`.
    pub(crate) fn of_group(&self, group: GroupId) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use && s.group == group)
            .map(|(i, _)| SlotId(i))
            .collect()
    }
}
