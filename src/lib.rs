// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate implements two cooperating pieces of a massively-parallel
//! database's coordinator process:
//!
//!   - A distributed transaction manager (DTM) that drives the two-phase commit
//!     (2PC) protocol across a set of segment workers, keeps a durable
//!     commit/forget log, and resolves in-doubt transactions after a crash.
//!
//!   - A resource-group runtime that bounds concurrency and memory per group of
//!     users: a fixed table of groups, a fixed pool of slots, a chunk-granular
//!     memory quota ledger, and a FIFO admission scheduler.
//!
//! ## Distributed transactions
//!
//! The short version of the protocol is:
//!
//!   - Every transaction the coordinator starts gets a cluster-unique global
//!     id ([Gid]), formatted as `"<startTimestamp>-<10-digit sequence>"`.
//!
//!   - A transaction only becomes "distributed" once it writes on some
//!     segment; a read-only or single-node transaction never pays for 2PC.
//!
//!   - To commit a distributed transaction the coordinator broadcasts
//!     `PREPARE` to every participant. Only once all participants have
//!     prepared does it write a durable "committed" record; that record is the
//!     commit point.
//!
//!   - After the commit point the outcome is fixed: the coordinator keeps
//!     retrying `COMMIT PREPARED` until every participant acknowledges, then
//!     writes a "forget" record.
//!
//!   - After a crash the coordinator replays the log, re-notifies every
//!     committed-but-not-forgotten transaction, and aborts any other prepared
//!     transaction it finds on the segments.
//!
//! ## Resource groups
//!
//!   - Every session runs its transaction inside a slot of a resource group.
//!     A group admits at most `concurrency` transactions at once; the rest wait
//!     in FIFO order.
//!
//!   - Memory is accounted in chunks. A global pool hands chunks out to
//!     groups; each slot gets a private quota and the group keeps a shared
//!     overflow area. Reservations never block: they either succeed, succeed
//!     by dipping into a caller-supplied overuse allowance, or fail.
//!
//!   - Capabilities are shipped from the coordinator to segments in a small
//!     fixed-width big-endian wire format ([encode_group_info]).
//!
//! ## Caveats
//!
//!  - The "processes" of the original shared-memory design are modelled as
//!    [ProcHandle]s owned by async tasks; the exclusive lock is an async mutex
//!    and the latch is a condvar. There is no real operating-system process
//!    boundary.
//!
//!  - Segment-side storage is simulated by [Segment], which keeps prepared
//!    transactions in memory. It exists to exercise the protocol, not to
//!    persist anything.
//!
//!  - OS-level CPU and memory enforcement is pluggable ([OsGroupBackend]);
//!    the bundled [NullOsGroup] only records limits.
//!
//! ## Name
//!
//! Wikipedia:
//!
//! > A weir or low head dam is a barrier across the width of a river that
//! > alters the flow characteristics of water and usually results in a change
//! > in the height of the river level.
//!

use futures::Future;
use std::pin::Pin;
use thiserror::Error;

/// How bad an [Error] is for the process observing it.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Surfaces to the caller; the current transaction aborts.
    Error,
    /// The backend process must exit; shared state is still consistent.
    Fatal,
    /// Shared state can no longer be trusted.
    Panic,
}

#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum Error {
    #[error("DTM transaction is not active")]
    DtmNotActive,
    #[error("The distributed transaction 'Prepare' broadcast failed to one or more segments for gid = {gid}")]
    PrepareFailed { gid: String },
    #[error("Distributed transaction {command} failed on segment {segment}: {detail}")]
    DispatchFailed {
        command: String,
        segment: i32,
        detail: String,
    },
    #[error("{command} broadcast failed for gid = {gid} after {retries} retries")]
    Phase2RetriesExhausted {
        command: String,
        gid: String,
        retries: usize,
    },
    #[error("Unable to complete the 'Abort Prepared' broadcast for gid '{gid}'")]
    AbortBroadcastIncomplete { gid: String },
    #[error("Broadcast of {command} for in-doubt gid = {gid} failed during recovery")]
    RecoveryBroadcastFailed { command: String, gid: String },
    #[error("DTM Log recovery failed. There are still unresolved in-doubt transactions on some of the segment databases that were not able to be resolved for an unknown reason: ({})", format_gids(.0))]
    UnresolvedInDoubt(Vec<String>),
    #[error("DTM initialization failed: {0}")]
    RecoveryFailed(String),
    #[error("The limit of {0} distributed transactions has been reached")]
    TooManyCommittedGxacts(usize),
    #[error("Reached the limit of global transaction ids")]
    GidExhausted,
    #[error("Fatal invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Distributed transaction log I/O error: {0}")]
    LogIo(String),
    #[error("Bad distributed transaction log record: {0}")]
    BadLogRecord(String),
    #[error("Resource group {0:?} was not found")]
    GroupNotFound(GroupId),
    #[error("Resource group {0:?} was concurrently dropped")]
    GroupConcurrentlyDropped(GroupId),
    #[error("Resource group {0:?} already exists")]
    GroupExists(GroupId),
    #[error("Cannot drop resource group {group:?}: it is still used by {running} running queries")]
    GroupBusy { group: GroupId, running: u32 },
    #[error("Too many resource groups (limit {0})")]
    TooManyGroups(usize),
    #[error("Invalid resource group capability: {0}")]
    InvalidCapability(String),
    #[error("Insufficient memory available in resource group {0:?}")]
    InsufficientMemory(GroupId),
    #[error("No free resource group slot")]
    SlotPoolExhausted,
    #[error("Resource group operation interrupted: {0:?}")]
    Interrupted(Interrupt),
    #[error("Malformed resource group wire payload: {0}")]
    Wire(String),
    #[error("Operating system group backend failed: {0}")]
    OsGroup(String),
    #[error("Fault injected at {point} ({severity:?})")]
    InjectedFault { point: String, severity: Severity },
}

fn format_gids(gids: &[String]) -> String {
    gids.iter()
        .map(|g| format!("\"{}\"", g))
        .collect::<Vec<_>>()
        .join(" , ")
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::InvariantViolation(_)
            | Error::GidExhausted
            | Error::Phase2RetriesExhausted { .. } => Severity::Panic,
            Error::AbortBroadcastIncomplete { .. }
            | Error::RecoveryBroadcastFailed { .. }
            | Error::RecoveryFailed(_)
            | Error::TooManyCommittedGxacts(_) => Severity::Fatal,
            Error::InjectedFault { severity, .. } => *severity,
            _ => Severity::Error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() >= Severity::Fatal
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::LogIo(e.to_string())
    }
}

mod admission;
mod caps;
mod config;
mod coordinator;
mod dispatch;
mod dtxlog;
mod faultinjector;
mod gid;
mod grouptable;
mod ids;
mod latch;
mod memquota;
mod network;
mod osgroup;
mod policy;
mod recovery;
mod resgroup;
mod segment;
mod slotpool;
mod tidmgr;
mod transaction;

pub use caps::{decode_group_info, encode_group_info, LimitType, ResGroupCaps, GROUP_INFO_LEN};
pub use config::{DtmConfig, ResGroupConfig, Role};
pub use coordinator::CoordinatorSession;
pub use dispatch::{
    DispatchMode, Dispatcher, DtxProtocolCommand, LocalDispatcher, SegmentReply,
};
pub use dtxlog::{DtxLog, DtxLogRecord, FileDtxLog, GxactLog, MemDtxLog, RedoFile, TMGIDSIZE};
pub use faultinjector::{FaultInjector, FaultKind, FaultPoint};
pub use gid::Gid;
pub use grouptable::GroupStatus;
pub use ids::{GroupId, ProcId, SegmentId, SessionId, SlotId, ADMIN_GROUP, DEFAULT_GROUP};
pub use latch::Interrupt;
pub use network::NetworkDispatcher;
pub use osgroup::{NullOsGroup, OsGroupBackend, OsGroupLimits};
pub use policy::{GroupSelectionPolicy, RolePolicy, UserInfo};
pub use recovery::TmShared;
pub use resgroup::{ProcHandle, ResGroupRuntime, SlotHandle};
pub use segment::Segment;
pub use tidmgr::{Clock, RealClock, TestClock, TidMgr};
pub use transaction::{DtxState, Gxact};

// As elsewhere in the crate's async surface, protocol entrypoints return a
// boxed future that is also Sync, so callers can store them in Sync
// containers and recursion through trait objects stays possible.
pub type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;
