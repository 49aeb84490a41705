// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Identifier newtypes shared between the transaction manager and the
//! resource-group runtime.

use serde::{Deserialize, Serialize};

/// Catalog object id of a resource group. Zero is never a valid group.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

pub const DEFAULT_GROUP: GroupId = GroupId(6437);
pub const ADMIN_GROUP: GroupId = GroupId(6438);

impl GroupId {
    pub const INVALID: GroupId = GroupId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Debug for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("group#{}", self.0))
    }
}

/// Content id of a segment. The coordinator's own entry database is `-1` and
/// never participates in two-phase commit.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub i32);

impl SegmentId {
    pub const ENTRY_DB: SegmentId = SegmentId(-1);

    pub fn is_entry_db(&self) -> bool {
        *self == Self::ENTRY_DB
    }
}

impl std::fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("seg{}", self.0))
    }
}

/// Index of a slot in the fixed slot pool.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl std::fmt::Debug for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("slot{}", self.0))
    }
}

/// Client session. All worker processes of a session on one segment share
/// that session's slot.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("con{}", self.0))
    }
}

/// A registered backend process.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcId(pub u32);

impl std::fmt::Debug for ProcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("proc{}", self.0))
    }
}
