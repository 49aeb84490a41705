// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The coordinator talks to segments only through a [Dispatcher]: a broadcast
//! of one DTX protocol command to a list of segments, a query for each
//! segment's prepared transactions, and a teardown of the session's
//! connections ("gangs"). [LocalDispatcher] calls in-process [Segment]s
//! directly; [crate::NetworkDispatcher] reaches them over edelcrantz.

use crate::{Error, Segment, SegmentId, SyncBoxFuture};
use async_std::sync::{Arc, RwLock};
use futures::{stream::FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace};

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtxProtocolCommand {
    StayAtOrBecomeImpliedWriter,
    Prepare,
    AbortNoPrepared,
    AbortSomePrepared,
    AbortPrepared,
    CommitPrepared,
    RetryCommitPrepared,
    RetryAbortPrepared,
    RecoveryCommitPrepared,
    RecoveryAbortPrepared,
}

impl DtxProtocolCommand {
    /// The status tag a segment answers with when the command succeeds.
    pub fn tag(&self) -> &'static str {
        match self {
            DtxProtocolCommand::StayAtOrBecomeImpliedWriter => "Distributed Stay At Or Become Implied Writer",
            DtxProtocolCommand::Prepare => "Distributed Prepare",
            DtxProtocolCommand::AbortNoPrepared => "Distributed Abort (No Prepared)",
            DtxProtocolCommand::AbortSomePrepared => "Distributed Abort (Some Prepared)",
            DtxProtocolCommand::AbortPrepared => "Distributed Abort Prepared",
            DtxProtocolCommand::CommitPrepared => "Distributed Commit Prepared",
            DtxProtocolCommand::RetryCommitPrepared => "Retry Distributed Commit Prepared",
            DtxProtocolCommand::RetryAbortPrepared => "Retry Distributed Abort Prepared",
            DtxProtocolCommand::RecoveryCommitPrepared => "Recovery Commit Prepared",
            DtxProtocolCommand::RecoveryAbortPrepared => "Recovery Abort Prepared",
        }
    }

    /// Whether a segment that has never heard of the gid should report an
    /// error. Retry and recovery commands may race with an earlier attempt
    /// that did get through.
    pub fn raise_if_not_found(&self) -> bool {
        matches!(
            self,
            DtxProtocolCommand::Prepare
                | DtxProtocolCommand::CommitPrepared
                | DtxProtocolCommand::AbortPrepared
        )
    }
}

impl std::fmt::Display for DtxProtocolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// One segment's answer to a broadcast command.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentReply {
    /// Completed; carries the command status tag.
    Ok(String),
    /// The segment ran the command and reported an error.
    Error(String),
    /// No answer: the connection is gone.
    Unreachable,
}

/// What to do with an error reported by a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// Return the first segment error as an [Error::DispatchFailed].
    RaiseError,
    /// Log segment errors and report the broadcast as failed.
    CollectErrors,
}

pub trait Dispatcher: Send + Sync + 'static {
    /// Every primary segment of the cluster.
    fn all_segments(&self) -> Vec<SegmentId>;

    /// Sends `cmd` for `gid` to each of `segments` and gathers one reply per
    /// segment. Never fails as a whole; failures are per-segment replies.
    fn dispatch_dtx_command(
        &self,
        cmd: DtxProtocolCommand,
        gid: String,
        segments: Vec<SegmentId>,
    ) -> SyncBoxFuture<Vec<(SegmentId, SegmentReply)>>;

    /// Runs the prepared-transaction listing on each of `segments`.
    fn list_prepared(
        &self,
        segments: Vec<SegmentId>,
    ) -> SyncBoxFuture<Vec<(SegmentId, Result<Vec<String>, String>)>>;

    /// Tears down every connection of the current session. Segments abort any
    /// transaction of the session that is not prepared.
    fn reset_gangs(&self) -> SyncBoxFuture<()>;
}

/// Summary of one broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DispatchOutcome {
    pub succeeded: bool,
    /// At least one segment could not be reached.
    pub bad_gangs: bool,
}

/// Broadcasts `cmd` and folds the replies: a reply counts as success only if
/// it carries the command's own status tag.
pub(crate) async fn dispatch_dtx_protocol_command(
    dispatcher: &dyn Dispatcher,
    cmd: DtxProtocolCommand,
    gid: &str,
    segments: &[SegmentId],
    mode: DispatchMode,
) -> Result<DispatchOutcome, Error> {
    debug!(
        "dispatchDtxProtocolCommand '{}' for gid = {} to {:?}",
        cmd, gid, segments
    );
    let replies = dispatcher
        .dispatch_dtx_command(cmd, gid.to_string(), segments.to_vec())
        .await;
    let mut failed = 0usize;
    let mut bad_gangs = false;
    let mut first_error = None;
    for (seg, reply) in replies.iter() {
        match reply {
            SegmentReply::Ok(status) if status.as_str() == cmd.tag() => {
                trace!("DTM: status message cmd '{}' [{:?}] ok", cmd, seg)
            }
            SegmentReply::Ok(status) => {
                debug!(
                    "DTM: status message cmd '{}' [{:?}] unexpected result '{}'",
                    cmd, seg, status
                );
                failed += 1;
            }
            SegmentReply::Error(detail) => {
                failed += 1;
                if first_error.is_none() {
                    first_error = Some((*seg, detail.clone()));
                }
            }
            SegmentReply::Unreachable => {
                failed += 1;
                bad_gangs = true;
            }
        }
    }
    if replies.len() < segments.len() {
        failed += segments.len() - replies.len();
        bad_gangs = true;
    }
    if let Some((seg, detail)) = first_error {
        match mode {
            DispatchMode::RaiseError => {
                return Err(Error::DispatchFailed {
                    command: cmd.tag().to_string(),
                    segment: seg.0,
                    detail,
                })
            }
            DispatchMode::CollectErrors => {
                info!(
                    "DTM error (gathered results from cmd '{}'): segment {:?} reported error: {}",
                    cmd, seg, detail
                );
            }
        }
    }
    Ok(DispatchOutcome {
        succeeded: failed == 0,
        bad_gangs,
    })
}

/// A [Dispatcher] over in-process [Segment]s. Segments can be marked down to
/// simulate lost connections.
#[derive(Clone)]
pub struct LocalDispatcher {
    segments: Arc<BTreeMap<SegmentId, Segment>>,
    down: Arc<RwLock<BTreeSet<SegmentId>>>,
}

impl LocalDispatcher {
    pub fn new<I: IntoIterator<Item = Segment>>(segments: I) -> Self {
        let segments = segments.into_iter().map(|s| (s.id(), s)).collect();
        LocalDispatcher {
            segments: Arc::new(segments),
            down: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(&id)
    }

    pub async fn set_reachable(&self, id: SegmentId, reachable: bool) {
        let mut guard = self.down.write().await;
        if reachable {
            guard.remove(&id);
        } else {
            guard.insert(id);
        }
    }

    async fn reachable(&self, id: SegmentId) -> Option<Segment> {
        if self.down.read().await.contains(&id) {
            return None;
        }
        self.segments.get(&id).cloned()
    }
}

impl Dispatcher for LocalDispatcher {
    fn all_segments(&self) -> Vec<SegmentId> {
        self.segments.keys().cloned().collect()
    }

    fn dispatch_dtx_command(
        &self,
        cmd: DtxProtocolCommand,
        gid: String,
        segments: Vec<SegmentId>,
    ) -> SyncBoxFuture<Vec<(SegmentId, SegmentReply)>> {
        let this = self.clone();
        Box::pin(async move {
            let mut futs = FuturesUnordered::new();
            for id in segments {
                let seg = this.reachable(id).await;
                let gid = gid.clone();
                futs.push(async move {
                    match seg {
                        None => (id, SegmentReply::Unreachable),
                        Some(seg) => (id, seg.perform_dtx_protocol_command(cmd, gid).await),
                    }
                });
            }
            let mut replies = Vec::new();
            while let Some(r) = futs.next().await {
                replies.push(r);
            }
            replies.sort();
            replies
        })
    }

    fn list_prepared(
        &self,
        segments: Vec<SegmentId>,
    ) -> SyncBoxFuture<Vec<(SegmentId, Result<Vec<String>, String>)>> {
        let this = self.clone();
        Box::pin(async move {
            let mut res = Vec::new();
            for id in segments {
                match this.reachable(id).await {
                    None => res.push((id, Err(format!("segment {:?} unreachable", id)))),
                    Some(seg) => res.push((id, Ok(seg.prepared().await))),
                }
            }
            res
        })
    }

    fn reset_gangs(&self) -> SyncBoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            for (id, seg) in this.segments.iter() {
                if !this.down.read().await.contains(id) {
                    seg.reset_session().await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    fn segs(n: i32) -> LocalDispatcher {
        LocalDispatcher::new((0..n).map(|i| Segment::new(SegmentId(i))))
    }

    #[test]
    fn unreachable_segment_marks_bad_gangs() {
        task::block_on(async {
            let d = segs(2);
            let all = d.all_segments();
            let out = dispatch_dtx_protocol_command(
                &d,
                DtxProtocolCommand::StayAtOrBecomeImpliedWriter,
                "1-0000000002",
                &all,
                DispatchMode::RaiseError,
            )
            .await
            .unwrap();
            assert_eq!(
                out,
                DispatchOutcome {
                    succeeded: true,
                    bad_gangs: false
                }
            );
            d.set_reachable(SegmentId(1), false).await;
            let out = dispatch_dtx_protocol_command(
                &d,
                DtxProtocolCommand::Prepare,
                "1-0000000002",
                &[SegmentId(0)],
                DispatchMode::RaiseError,
            )
            .await
            .unwrap();
            assert!(out.succeeded);
            let out = dispatch_dtx_protocol_command(
                &d,
                DtxProtocolCommand::RetryAbortPrepared,
                "1-0000000002",
                &all,
                DispatchMode::CollectErrors,
            )
            .await
            .unwrap();
            assert!(!out.succeeded);
            assert!(out.bad_gangs);
        });
    }

    #[test]
    fn segment_error_raises_or_collects() {
        task::block_on(async {
            let d = segs(1);
            let all = d.all_segments();
            // Preparing a gid the segment never saw is an error there.
            let err = dispatch_dtx_protocol_command(
                &d,
                DtxProtocolCommand::Prepare,
                "1-0000000009",
                &all,
                DispatchMode::RaiseError,
            )
            .await
            .unwrap_err();
            match err {
                Error::DispatchFailed { segment, .. } => assert_eq!(segment, 0),
                e => panic!("unexpected error {:?}", e),
            }
            let out = dispatch_dtx_protocol_command(
                &d,
                DtxProtocolCommand::Prepare,
                "1-0000000009",
                &all,
                DispatchMode::CollectErrors,
            )
            .await
            .unwrap();
            assert!(!out.succeeded);
            assert!(!out.bad_gangs);
        });
    }
}
