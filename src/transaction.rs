// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A distributed transaction (a "gxact") is named by its [Gid] and walks a
//! fixed state graph as the coordinator drives two-phase commit. Every state
//! change goes through [Gxact::set_state], which refuses transitions that are
//! not edges of the graph: an illegal transition means the coordinator's
//! bookkeeping is broken, so it is reported with panic severity.
//!
//! The happy paths are:
//!
//!   - read-only or single-node: `ActiveNotDistributed → (reset)`
//!   - commit: `ActiveDistributed → Preparing → Prepared → InsertingCommitted
//!     → InsertedCommitted → NotifyingCommitPrepared → [RetryCommitPrepared]
//!     → InsertingForgetCommitted → InsertedForgetCommitted → (reset)`
//!   - abort: `ActiveDistributed → NotifyingAbortNoPrepared`,
//!     `Preparing → NotifyingAbortSomePrepared → [RetryAbortPrepared]`,
//!     `Prepared → NotifyingAbortPrepared → [RetryAbortPrepared]`

use crate::{Error, Gid, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{error, trace};

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtxState {
    None,
    ActiveNotDistributed,
    ActiveDistributed,
    Preparing,
    Prepared,
    InsertingCommitted,
    InsertedCommitted,
    NotifyingCommitPrepared,
    InsertingForgetCommitted,
    InsertedForgetCommitted,
    NotifyingAbortNoPrepared,
    NotifyingAbortSomePrepared,
    NotifyingAbortPrepared,
    RetryCommitPrepared,
    RetryAbortPrepared,
}

impl DtxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DtxState::None => "None",
            DtxState::ActiveNotDistributed => "Active Not Distributed",
            DtxState::ActiveDistributed => "Active Distributed",
            DtxState::Preparing => "Preparing",
            DtxState::Prepared => "Prepared",
            DtxState::InsertingCommitted => "Inserting Committed",
            DtxState::InsertedCommitted => "Inserted Committed",
            DtxState::NotifyingCommitPrepared => "Notifying Commit Prepared",
            DtxState::InsertingForgetCommitted => "Inserting Forget Committed",
            DtxState::InsertedForgetCommitted => "Inserted Forget Committed",
            DtxState::NotifyingAbortNoPrepared => "Notifying Abort (No Prepared)",
            DtxState::NotifyingAbortSomePrepared => "Notifying Abort (Some Prepared)",
            DtxState::NotifyingAbortPrepared => "Notifying Abort Prepared",
            DtxState::RetryCommitPrepared => "Retry Commit Prepared",
            DtxState::RetryAbortPrepared => "Retry Abort Prepared",
        }
    }

    /// Edges of the state graph. Returning to `None` is not an edge; it is a
    /// reset, see [Gxact::is_resettable].
    pub fn can_advance_to(&self, next: DtxState) -> bool {
        use DtxState::*;
        matches!(
            (*self, next),
            (None, ActiveNotDistributed)
                | (ActiveNotDistributed, ActiveDistributed)
                | (ActiveDistributed, Preparing)
                | (ActiveDistributed, NotifyingAbortNoPrepared)
                | (Preparing, Prepared)
                | (Preparing, NotifyingAbortSomePrepared)
                | (Preparing, RetryAbortPrepared)
                | (Prepared, InsertingCommitted)
                | (Prepared, NotifyingAbortPrepared)
                | (InsertingCommitted, InsertedCommitted)
                | (InsertedCommitted, NotifyingCommitPrepared)
                | (NotifyingCommitPrepared, RetryCommitPrepared)
                | (NotifyingCommitPrepared, InsertingForgetCommitted)
                | (RetryCommitPrepared, InsertingForgetCommitted)
                | (InsertingForgetCommitted, InsertedForgetCommitted)
                | (NotifyingAbortSomePrepared, RetryAbortPrepared)
                | (NotifyingAbortPrepared, RetryAbortPrepared)
        )
    }

    /// States whose transaction must be carried in a checkpoint: the commit
    /// point has been logged but the forget record has not.
    pub fn include_in_checkpoint(&self) -> bool {
        matches!(
            self,
            DtxState::InsertedCommitted
                | DtxState::NotifyingCommitPrepared
                | DtxState::InsertingForgetCommitted
                | DtxState::RetryCommitPrepared
        )
    }

    pub fn is_commit_side(&self) -> bool {
        matches!(
            self,
            DtxState::InsertingCommitted
                | DtxState::InsertedCommitted
                | DtxState::NotifyingCommitPrepared
                | DtxState::InsertingForgetCommitted
                | DtxState::InsertedForgetCommitted
                | DtxState::RetryCommitPrepared
        )
    }
}

impl std::fmt::Display for DtxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The coordinator's record of its current distributed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gxact {
    pub gid: Gid,
    state: DtxState,

    /// Segments that performed a write and therefore must prepare. Ordered
    /// for deterministic dispatch; the entry db is never a member.
    twophase_segments: BTreeSet<SegmentId>,

    /// Set when preparing reported unreachable segments; the abort path then
    /// goes straight to retrying `ABORT PREPARED` on every segment.
    pub bad_prepare_gangs: bool,

    /// Set when a writer connection to some segment was lost. Aborting with
    /// no prepared participants then skips the broadcast.
    pub writer_gang_lost: bool,

    /// The transaction was opened by an explicit `BEGIN`.
    pub explicit_begin: bool,

    /// Every state this gxact has been in, oldest first.
    history: Vec<DtxState>,
}

impl Gxact {
    pub(crate) fn new(gid: Gid) -> Self {
        Gxact {
            gid,
            state: DtxState::ActiveNotDistributed,
            twophase_segments: BTreeSet::new(),
            bad_prepare_gangs: false,
            writer_gang_lost: false,
            explicit_begin: false,
            history: vec![DtxState::None, DtxState::ActiveNotDistributed],
        }
    }

    pub fn state(&self) -> DtxState {
        self.state
    }

    pub fn history(&self) -> &[DtxState] {
        &self.history
    }

    pub fn twophase_segments(&self) -> Vec<SegmentId> {
        self.twophase_segments.iter().cloned().collect()
    }

    pub fn is_distributed(&self) -> bool {
        !self.twophase_segments.is_empty()
    }

    pub(crate) fn set_state(&mut self, next: DtxState) -> Result<(), Error> {
        if !self.state.can_advance_to(next) {
            error!(
                "illegal distributed transaction state change for {}: {} -> {}",
                self.gid, self.state, next
            );
            return Err(Error::InvariantViolation(format!(
                "distributed transaction {} cannot move from '{}' to '{}'",
                self.gid, self.state, next
            )));
        }
        trace!("gxact {} state {} -> {}", self.gid, self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Fails unless the gxact is currently in `expected`.
    pub(crate) fn expect_state(&self, expected: DtxState) -> Result<(), Error> {
        if self.state != expected {
            error!(
                "gxact {} expected in state '{}', found '{}'",
                self.gid, expected, self.state
            );
            return Err(Error::InvariantViolation(format!(
                "distributed transaction {} expected to be in state '{}', found '{}'",
                self.gid, expected, self.state
            )));
        }
        Ok(())
    }

    /// Only a terminal state may be cleared back to `None`.
    pub(crate) fn is_resettable(&self) -> bool {
        use DtxState::*;
        matches!(
            self.state,
            ActiveNotDistributed
                | InsertedForgetCommitted
                | NotifyingAbortNoPrepared
                | NotifyingAbortSomePrepared
                | NotifyingAbortPrepared
                | RetryAbortPrepared
        )
    }

    /// Records segments as two-phase participants. Only meaningful while
    /// active-distributed; the entry db is skipped and duplicates collapse.
    pub(crate) fn add_twophase_segments<I: IntoIterator<Item = SegmentId>>(&mut self, segs: I) {
        if self.state != DtxState::ActiveDistributed {
            trace!(
                "not recording participants for gxact {} in state {}",
                self.gid,
                self.state
            );
            return;
        }
        for s in segs {
            if !s.is_entry_db() {
                self.twophase_segments.insert(s);
            }
        }
    }
}
