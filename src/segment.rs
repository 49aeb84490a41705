// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The segment side of the DTX protocol. A segment keeps, per gid, either an
//! open local writer transaction or a prepared one, and moves it along as the
//! coordinator's protocol commands arrive:
//!
//!   - A writer is created by `StayAtOrBecomeImpliedWriter` and becomes
//!     prepared on `Prepare`.
//!
//!   - A prepared transaction survives anything except an explicit
//!     `CommitPrepared` / `AbortPrepared` (or their retry and recovery
//!     variants); in particular it survives the coordinator crashing and the
//!     coordinator's connections being reset.
//!
//!   - An unprepared writer is discarded on `AbortNoPrepared`,
//!     `AbortSomePrepared` or when the session's connections are reset.

use crate::{
    faultinjector::FaultPoint, DtxProtocolCommand, Error, FaultInjector, SegmentId, SegmentReply,
    Severity, SyncBoxFuture,
};
use async_std::sync::{Arc, Mutex};
use std::collections::BTreeMap;
use tracing::{debug, error, trace, warn};

/// Distributed transaction context of one local transaction.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
enum QeContext {
    TwoPhaseImplicitWriter,
    Prepared,
}

#[derive(Default)]
struct SegmentState {
    local: BTreeMap<String, QeContext>,
    committed: Vec<String>,
    aborted: Vec<String>,
}

#[derive(Clone)]
pub struct Segment {
    id: SegmentId,
    state: Arc<Mutex<SegmentState>>,
    faults: FaultInjector,
}

impl Segment {
    pub fn new(id: SegmentId) -> Self {
        Segment::with_faults(id, FaultInjector::new())
    }

    pub fn with_faults(id: SegmentId, faults: FaultInjector) -> Self {
        Segment {
            id,
            state: Arc::new(Mutex::new(SegmentState::default())),
            faults,
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Gids of prepared transactions, as the prepared-transaction listing
    /// reports them.
    pub async fn prepared(&self) -> Vec<String> {
        let guard = self.state.lock().await;
        guard
            .local
            .iter()
            .filter(|(_, c)| **c == QeContext::Prepared)
            .map(|(g, _)| g.clone())
            .collect()
    }

    /// Gids of open, unprepared writer transactions.
    pub async fn in_progress(&self) -> Vec<String> {
        let guard = self.state.lock().await;
        guard
            .local
            .iter()
            .filter(|(_, c)| **c == QeContext::TwoPhaseImplicitWriter)
            .map(|(g, _)| g.clone())
            .collect()
    }

    /// Gids this segment committed, in commit order.
    pub async fn committed(&self) -> Vec<String> {
        self.state.lock().await.committed.clone()
    }

    pub async fn aborted(&self) -> Vec<String> {
        self.state.lock().await.aborted.clone()
    }

    /// Forgets every unprepared transaction, as when the coordinator's
    /// connections to this segment are torn down.
    pub async fn reset_session(&self) {
        let mut guard = self.state.lock().await;
        let lost: Vec<String> = guard
            .local
            .iter()
            .filter(|(_, c)| **c == QeContext::TwoPhaseImplicitWriter)
            .map(|(g, _)| g.clone())
            .collect();
        for gid in lost {
            debug!("{:?}: session reset aborts in-progress {}", self.id, gid);
            guard.local.remove(&gid);
            guard.aborted.push(gid);
        }
    }

    pub fn perform_dtx_protocol_command(
        &self,
        cmd: DtxProtocolCommand,
        gid: String,
    ) -> SyncBoxFuture<SegmentReply> {
        let this = self.clone();
        Box::pin(async move { this.perform_dtx_protocol_command_(cmd, gid).await })
    }

    async fn perform_dtx_protocol_command_(
        &self,
        cmd: DtxProtocolCommand,
        gid: String,
    ) -> SegmentReply {
        trace!("{:?}: performDtxProtocolCommand '{}' for {}", self.id, cmd, gid);
        if let Err(e) = self.faults.check(FaultPoint::Segment(cmd)).await {
            return match e.severity() {
                // The backend serving the command died with it.
                Severity::Fatal | Severity::Panic => SegmentReply::Unreachable,
                Severity::Error => SegmentReply::Error(e.to_string()),
            };
        }
        match self.apply(cmd, &gid).await {
            Ok(()) => SegmentReply::Ok(cmd.tag().to_string()),
            Err(e) => {
                warn!("{:?}: '{}' for {} failed: {}", self.id, cmd, gid, e);
                SegmentReply::Error(e.to_string())
            }
        }
    }

    async fn apply(&self, cmd: DtxProtocolCommand, gid: &str) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        let ctx = guard.local.get(gid).cloned();
        match cmd {
            DtxProtocolCommand::StayAtOrBecomeImpliedWriter => match ctx {
                None => {
                    guard
                        .local
                        .insert(gid.to_string(), QeContext::TwoPhaseImplicitWriter);
                    Ok(())
                }
                Some(QeContext::TwoPhaseImplicitWriter) => Ok(()),
                Some(c) => Err(self.unexpected_context(gid, c)),
            },
            DtxProtocolCommand::AbortNoPrepared => {
                if ctx == Some(QeContext::TwoPhaseImplicitWriter) {
                    guard.local.remove(gid);
                    guard.aborted.push(gid.to_string());
                }
                Ok(())
            }
            DtxProtocolCommand::Prepare => match ctx {
                None => Err(self.not_found(gid)),
                Some(QeContext::TwoPhaseImplicitWriter) => {
                    debug!("{:?}: prepared {}", self.id, gid);
                    guard.local.insert(gid.to_string(), QeContext::Prepared);
                    Ok(())
                }
                Some(c) => Err(self.unexpected_context(gid, c)),
            },
            DtxProtocolCommand::AbortSomePrepared => {
                // The coordinator aborts everyone once anyone failed, whether
                // or not this segment got as far as preparing.
                if ctx.is_none() {
                    trace!("{:?}: {} not found during abort", self.id, gid);
                } else {
                    guard.local.remove(gid);
                    guard.aborted.push(gid.to_string());
                }
                Ok(())
            }
            DtxProtocolCommand::CommitPrepared
            | DtxProtocolCommand::RetryCommitPrepared
            | DtxProtocolCommand::RecoveryCommitPrepared => match ctx {
                Some(QeContext::Prepared) => {
                    guard.local.remove(gid);
                    guard.committed.push(gid.to_string());
                    debug!("{:?}: committed prepared {}", self.id, gid);
                    Ok(())
                }
                Some(c) => Err(self.unexpected_context(gid, c)),
                None if cmd.raise_if_not_found() => Err(self.not_found(gid)),
                None => {
                    trace!("{:?}: '{}' found nothing for {}", self.id, cmd, gid);
                    Ok(())
                }
            },
            DtxProtocolCommand::AbortPrepared
            | DtxProtocolCommand::RetryAbortPrepared
            | DtxProtocolCommand::RecoveryAbortPrepared => match ctx {
                Some(QeContext::Prepared) => {
                    guard.local.remove(gid);
                    guard.aborted.push(gid.to_string());
                    debug!("{:?}: aborted prepared {}", self.id, gid);
                    Ok(())
                }
                Some(c) if cmd.raise_if_not_found() => Err(self.unexpected_context(gid, c)),
                Some(_) => {
                    // A writer that never prepared; dropping it is the abort.
                    guard.local.remove(gid);
                    guard.aborted.push(gid.to_string());
                    Ok(())
                }
                None if cmd.raise_if_not_found() => Err(self.not_found(gid)),
                None => Ok(()),
            },
        }
    }

    fn not_found(&self, gid: &str) -> Error {
        Error::DispatchFailed {
            command: "lookup".into(),
            segment: self.id.0,
            detail: format!("Distributed transaction {} not found", gid),
        }
    }

    fn unexpected_context(&self, gid: &str, ctx: QeContext) -> Error {
        error!(
            "{:?}: unexpected segment distributed transaction context {:?} for {}",
            self.id, ctx, gid
        );
        Error::DispatchFailed {
            command: "context".into(),
            segment: self.id.0,
            detail: format!(
                "Unexpected segment distributed transaction context: '{:?}'",
                ctx
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FaultKind;
    use async_std::task;
    use DtxProtocolCommand::*;

    fn ok(cmd: DtxProtocolCommand) -> SegmentReply {
        SegmentReply::Ok(cmd.tag().to_string())
    }

    #[test]
    fn prepare_then_commit() {
        task::block_on(async {
            let s = Segment::new(SegmentId(0));
            let g = "7-0000000002".to_string();
            assert_eq!(
                s.perform_dtx_protocol_command(StayAtOrBecomeImpliedWriter, g.clone())
                    .await,
                ok(StayAtOrBecomeImpliedWriter)
            );
            assert_eq!(s.perform_dtx_protocol_command(Prepare, g.clone()).await, ok(Prepare));
            assert_eq!(s.prepared().await, vec![g.clone()]);
            // Prepared transactions survive a connection reset.
            s.reset_session().await;
            assert_eq!(s.prepared().await, vec![g.clone()]);
            assert_eq!(
                s.perform_dtx_protocol_command(CommitPrepared, g.clone()).await,
                ok(CommitPrepared)
            );
            assert_eq!(s.committed().await, vec![g.clone()]);
            // A repeated commit is an error, a retried one is not.
            match s.perform_dtx_protocol_command(CommitPrepared, g.clone()).await {
                SegmentReply::Error(_) => (),
                r => panic!("unexpected reply {:?}", r),
            }
            assert_eq!(
                s.perform_dtx_protocol_command(RetryCommitPrepared, g.clone())
                    .await,
                ok(RetryCommitPrepared)
            );
            assert_eq!(s.committed().await.len(), 1);
        });
    }

    #[test]
    fn reset_discards_unprepared_writers() {
        task::block_on(async {
            let s = Segment::new(SegmentId(3));
            s.perform_dtx_protocol_command(StayAtOrBecomeImpliedWriter, "a".into())
                .await;
            assert_eq!(s.in_progress().await, vec!["a".to_string()]);
            s.reset_session().await;
            assert!(s.in_progress().await.is_empty());
            assert_eq!(s.aborted().await, vec!["a".to_string()]);
            match s.perform_dtx_protocol_command(Prepare, "a".into()).await {
                SegmentReply::Error(msg) => assert!(msg.contains("not found")),
                r => panic!("unexpected reply {:?}", r),
            }
        });
    }

    #[test]
    fn abort_some_prepared_tolerates_unknown() {
        task::block_on(async {
            let s = Segment::new(SegmentId(0));
            assert_eq!(
                s.perform_dtx_protocol_command(AbortSomePrepared, "x".into())
                    .await,
                ok(AbortSomePrepared)
            );
            assert_eq!(
                s.perform_dtx_protocol_command(RecoveryAbortPrepared, "x".into())
                    .await,
                ok(RecoveryAbortPrepared)
            );
        });
    }

    #[test]
    fn fatal_fault_looks_like_a_lost_connection() {
        task::block_on(async {
            let s = Segment::new(SegmentId(0));
            s.faults()
                .inject(FaultPoint::Segment(Prepare), FaultKind::Fatal, Some(1))
                .await;
            s.perform_dtx_protocol_command(StayAtOrBecomeImpliedWriter, "g".into())
                .await;
            assert_eq!(
                s.perform_dtx_protocol_command(Prepare, "g".into()).await,
                SegmentReply::Unreachable
            );
            assert_eq!(s.perform_dtx_protocol_command(Prepare, "g".into()).await, ok(Prepare));
        });
    }
}
