// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A [CoordinatorSession] is the per-backend handle through which one
//! coordinator process runs its distributed transactions. It owns at most one
//! [Gxact] at a time and moves it through the two-phase commit state graph,
//! broadcasting protocol commands through a [Dispatcher] and recording the
//! commit point in the shared transaction manager's durable log.
//!
//! Nothing here is shared between sessions except the [TmShared] handle, so
//! no locking is needed around the gxact itself.

use crate::{
    dispatch::dispatch_dtx_protocol_command, faultinjector::FaultPoint, DispatchMode,
    Dispatcher, DtxProtocolCommand, DtxState, Error, Gid, Gxact, SegmentId, Severity, TmShared,
};
use async_std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

pub struct CoordinatorSession {
    tm: Arc<TmShared>,
    dispatcher: Arc<dyn Dispatcher>,
    gxact: Option<Gxact>,

    /// First panic-severity error this session observed. A poisoned session
    /// refuses all further work.
    poisoned: Option<Error>,
}

impl CoordinatorSession {
    pub fn new(tm: Arc<TmShared>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        CoordinatorSession {
            tm,
            dispatcher,
            gxact: None,
            poisoned: None,
        }
    }

    pub fn tm(&self) -> &Arc<TmShared> {
        &self.tm
    }

    pub fn current_gxact(&self) -> Option<&Gxact> {
        self.gxact.as_ref()
    }

    pub fn current_state(&self) -> DtxState {
        match &self.gxact {
            None => DtxState::None,
            Some(g) => g.state(),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    fn check_poisoned(&self) -> Result<(), Error> {
        match &self.poisoned {
            None => Ok(()),
            Some(e) => Err(e.clone()),
        }
    }

    fn note<T>(&mut self, res: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &res {
            if e.severity() == Severity::Panic && self.poisoned.is_none() {
                error!("coordinator session poisoned: {}", e);
                self.poisoned = Some(e.clone());
            }
        }
        res
    }

    fn gxact_mut(&mut self) -> Result<&mut Gxact, Error> {
        self.gxact.as_mut().ok_or(Error::DtmNotActive)
    }

    fn clear_and_reset(&mut self) {
        if let Some(g) = self.gxact.take() {
            if !g.is_resettable() {
                debug!("clearing gxact {} from state '{}'", g.gid, g.state());
            }
            trace!("gxact {} reset to '{}'", g.gid, DtxState::None);
        }
    }

    /// Starts a new transaction and hands out its gid. Runs crash recovery
    /// first if this process has not seen it complete.
    #[instrument(skip(self))]
    pub async fn begin_distributed_transaction(&mut self) -> Result<Gid, Error> {
        self.check_poisoned()?;
        let res = self.begin_distributed_transaction_().await;
        self.note(res)
    }

    async fn begin_distributed_transaction_(&mut self) -> Result<Gid, Error> {
        if !self.tm.dtm_started() {
            self.tm.run_crash_recovery(&*self.dispatcher).await?;
            if !self.tm.dtm_started() {
                return Err(Error::DtmNotActive);
            }
        }
        if let Some(g) = &self.gxact {
            error!(
                "begin of a distributed transaction while {} is still '{}'",
                g.gid,
                g.state()
            );
            return Err(Error::InvariantViolation(format!(
                "distributed transaction {} already in progress",
                g.gid
            )));
        }
        let gid = self.tm.create_gid()?;
        debug!("began distributed transaction gid = {}", gid);
        self.gxact = Some(Gxact::new(gid));
        Ok(gid)
    }

    /// Remembers that the current transaction was opened by an explicit
    /// `BEGIN`.
    pub fn remember_explicit_begin(&mut self) -> Result<(), Error> {
        self.gxact_mut()?.explicit_begin = true;
        Ok(())
    }

    /// Promotes the current transaction to two-phase, if it is not already.
    pub fn mark_two_phase(&mut self) -> Result<(), Error> {
        self.check_poisoned()?;
        let res = self.mark_two_phase_();
        self.note(res)
    }

    fn mark_two_phase_(&mut self) -> Result<(), Error> {
        let g = self.gxact_mut()?;
        match g.state() {
            DtxState::ActiveNotDistributed => g.set_state(DtxState::ActiveDistributed),
            DtxState::ActiveDistributed => Ok(()),
            _ => g.expect_state(DtxState::ActiveDistributed),
        }
    }

    /// Records `segments` as two-phase participants.
    pub fn add_twophase_segments(&mut self, segments: &[SegmentId]) -> Result<(), Error> {
        self.gxact_mut()?
            .add_twophase_segments(segments.iter().cloned());
        Ok(())
    }

    /// Starts (or reuses) writer gangs on `segments` ahead of the first write
    /// there. Every touched segment becomes a participant even if the set-up
    /// fails, so a later abort reaches it.
    #[instrument(skip(self))]
    pub async fn start_writer_gang(&mut self, segments: &[SegmentId]) -> Result<(), Error> {
        self.mark_two_phase()?;
        let res = self.start_writer_gang_(segments).await;
        self.note(res)
    }

    async fn start_writer_gang_(&mut self, segments: &[SegmentId]) -> Result<(), Error> {
        let targets: Vec<SegmentId> = segments
            .iter()
            .cloned()
            .filter(|s| !s.is_entry_db())
            .collect();
        let g = self.gxact_mut()?;
        g.add_twophase_segments(targets.iter().cloned());
        let gid = g.gid.to_string();
        let cmd = DtxProtocolCommand::StayAtOrBecomeImpliedWriter;
        let out = dispatch_dtx_protocol_command(
            &*self.dispatcher,
            cmd,
            &gid,
            &targets,
            DispatchMode::RaiseError,
        )
        .await;
        match out {
            Ok(out) if out.succeeded => Ok(()),
            Ok(_) => {
                warn!("writer gang lost for gid = {}", gid);
                self.mark_writer_gang_lost();
                Err(Error::DispatchFailed {
                    command: cmd.tag().to_string(),
                    segment: -1,
                    detail: "writer gang lost".into(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Notes that a writer connection died; an abort without prepared
    /// participants then skips its broadcast.
    pub fn mark_writer_gang_lost(&mut self) {
        if let Some(g) = self.gxact.as_mut() {
            g.writer_gang_lost = true;
        }
    }

    /// Phase one. A transaction that never became distributed is simply
    /// cleared. On failure the gxact is left in `Preparing` and the caller
    /// must abort it.
    #[instrument(skip(self))]
    pub async fn prepare_transaction(&mut self) -> Result<(), Error> {
        self.check_poisoned()?;
        let res = self.prepare_transaction_().await;
        self.note(res)
    }

    async fn prepare_transaction_(&mut self) -> Result<(), Error> {
        let state = match &self.gxact {
            None => return Ok(()),
            Some(g) => g.state(),
        };
        if state == DtxState::ActiveNotDistributed {
            debug!("not a distributed transaction, nothing to prepare");
            self.clear_and_reset();
            return Ok(());
        }
        let g = self.gxact_mut()?;
        g.expect_state(DtxState::ActiveDistributed)?;
        g.set_state(DtxState::Preparing)?;
        let gid = g.gid.to_string();
        let segments = g.twophase_segments();

        self.tm.faults().check(FaultPoint::DtmBroadcastPrepare).await?;

        let out = dispatch_dtx_protocol_command(
            &*self.dispatcher,
            DtxProtocolCommand::Prepare,
            &gid,
            &segments,
            DispatchMode::RaiseError,
        )
        .await;
        let g = self.gxact_mut()?;
        match out {
            Ok(out) if out.succeeded => {
                g.set_state(DtxState::Prepared)?;
                debug!("the distributed transaction 'Prepare' broadcast succeeded for gid = {}", gid);
                Ok(())
            }
            Ok(out) => {
                g.bad_prepare_gangs = out.bad_gangs;
                warn!("the distributed transaction 'Prepare' broadcast failed for gid = {}", gid);
                Err(Error::PrepareFailed { gid })
            }
            Err(e) => {
                warn!(
                    "the distributed transaction 'Prepare' broadcast failed for gid = {}: {}",
                    gid, e
                );
                Err(Error::PrepareFailed { gid })
            }
        }
    }

    /// Phase two of a prepared transaction: logs the commit point, notifies
    /// every participant (retrying with gang resets), then logs the forget.
    ///
    /// An error after the commit point leaves the transaction in the
    /// committed set; recovery finishes it after the process restarts.
    #[instrument(skip(self))]
    pub async fn commit_prepared_transaction(&mut self) -> Result<(), Error> {
        self.check_poisoned()?;
        let res = self.commit_prepared_transaction_().await;
        self.note(res)
    }

    async fn commit_prepared_transaction_(&mut self) -> Result<(), Error> {
        let g = self.gxact_mut()?;
        g.expect_state(DtxState::Prepared)?;
        g.set_state(DtxState::InsertingCommitted)?;
        let gid = g.gid;

        self.tm
            .faults()
            .check(FaultPoint::DtmXLogDistributedCommit)
            .await?;
        if let Err(e) = self.tm.record_distributed_commit(gid).await {
            error!("could not log commit of distributed transaction {}: {}", gid, e);
            return Err(e);
        }
        self.gxact_mut()?.set_state(DtxState::InsertedCommitted)?;

        self.notify_commit_prepared().await?;

        let g = self.gxact_mut()?;
        g.set_state(DtxState::InsertingForgetCommitted)?;
        self.tm.record_distributed_forget(gid).await?;
        self.gxact_mut()?
            .set_state(DtxState::InsertedForgetCommitted)?;
        debug!("distributed transaction {} committed and forgotten", gid);
        self.clear_and_reset();
        Ok(())
    }

    async fn notify_commit_prepared(&mut self) -> Result<(), Error> {
        let g = self.gxact_mut()?;
        g.set_state(DtxState::NotifyingCommitPrepared)?;
        let gid = g.gid.to_string();
        let segments = g.twophase_segments();

        self.tm
            .faults()
            .check(FaultPoint::DtmBroadcastCommitPrepared)
            .await?;

        let mut ok = self
            .broadcast(DtxProtocolCommand::CommitPrepared, &gid, &segments)
            .await;
        if !ok {
            warn!(
                "the distributed transaction 'Commit Prepared' broadcast failed to one or more segments for gid = {}; retrying",
                gid
            );
            self.gxact_mut()?
                .set_state(DtxState::RetryCommitPrepared)?;
        }
        let limit = self.tm.config().phase2_retry_count;
        let mut retry = 0;
        while !ok && retry < limit {
            retry += 1;
            info!("releasing segworker groups to retry broadcast, attempt {}", retry);
            self.dispatcher.reset_gangs().await;
            ok = self
                .broadcast(DtxProtocolCommand::RetryCommitPrepared, &gid, &segments)
                .await;
        }
        if !ok {
            error!(
                "unable to complete 'Commit Prepared' broadcast for gid = {} after {} retries",
                gid, retry
            );
            return Err(Error::Phase2RetriesExhausted {
                command: DtxProtocolCommand::CommitPrepared.tag().to_string(),
                gid,
                retries: retry,
            });
        }
        Ok(())
    }

    /// Prepares then commits, aborting if the prepare fails.
    pub async fn commit_transaction(&mut self) -> Result<(), Error> {
        if let Err(e) = self.prepare_transaction().await {
            if let Err(abort) = self.abort_transaction().await {
                if abort.severity() > e.severity() {
                    return Err(abort);
                }
            }
            return Err(e);
        }
        if self.gxact.is_none() {
            return Ok(());
        }
        self.commit_prepared_transaction().await
    }

    /// Rolls back the current transaction from whatever state it reached.
    #[instrument(skip(self))]
    pub async fn abort_transaction(&mut self) -> Result<(), Error> {
        self.check_poisoned()?;
        let res = self.rollback(false).await;
        self.note(res)
    }

    /// Like [CoordinatorSession::abort_transaction], on the way out of a
    /// dying process. Nothing is broadcast: unprepared work is aborted by
    /// resetting the gangs, and an abort that would have to reach prepared
    /// participants fails fatally, leaving them to recovery.
    pub async fn abort_transaction_on_exit(&mut self) -> Result<(), Error> {
        self.check_poisoned()?;
        let res = self.rollback(true).await;
        self.note(res)
    }

    async fn rollback(&mut self, exiting: bool) -> Result<(), Error> {
        let g = match self.gxact.as_mut() {
            None => {
                trace!("no distributed transaction to roll back");
                return Ok(());
            }
            Some(g) => g,
        };
        let gid = g.gid.to_string();
        match g.state() {
            DtxState::ActiveNotDistributed => {
                self.clear_and_reset();
                return Ok(());
            }
            DtxState::ActiveDistributed => g.set_state(DtxState::NotifyingAbortNoPrepared)?,
            DtxState::Preparing if g.bad_prepare_gangs => {
                g.set_state(DtxState::RetryAbortPrepared)?;
                self.retry_abort_prepared(&gid).await?;
                self.clear_and_reset();
                return Ok(());
            }
            DtxState::Preparing => g.set_state(DtxState::NotifyingAbortSomePrepared)?,
            DtxState::Prepared => g.set_state(DtxState::NotifyingAbortPrepared)?,
            DtxState::NotifyingAbortNoPrepared => {
                // Re-entered after a failed abort; tearing down the gangs
                // aborts whatever is left.
                self.dispatcher.reset_gangs().await;
                self.clear_and_reset();
                return Ok(());
            }
            DtxState::NotifyingAbortSomePrepared | DtxState::NotifyingAbortPrepared => {
                error!("unable to complete 'Abort Prepared' broadcast for gid = {}", gid);
                return Err(Error::AbortBroadcastIncomplete { gid });
            }
            state if state.is_commit_side() => {
                // Past the commit point the outcome is commit; only
                // recovery may finish it.
                error!("rollback of gid = {} requested in state '{}'", gid, state);
                return Err(Error::InvariantViolation(format!(
                    "distributed transaction {} cannot roll back from '{}'",
                    gid, state
                )));
            }
            state => {
                debug!(
                    "rollback of gid = {} in state '{}' has nothing to notify",
                    gid, state
                );
                self.clear_and_reset();
                return Ok(());
            }
        }
        if exiting {
            // No broadcast from a dying process. Recovery resolves whatever
            // was prepared; anything else dies with the gangs.
            if self.current_state() != DtxState::NotifyingAbortNoPrepared {
                error!("unable to complete 'Abort Prepared' broadcast for gid = {}", gid);
                return Err(Error::AbortBroadcastIncomplete { gid });
            }
            debug!("process exiting: resetting gangs to abort gid = {}", gid);
            self.dispatcher.reset_gangs().await;
            self.clear_and_reset();
            return Ok(());
        }
        self.notify_abort().await?;
        self.clear_and_reset();
        Ok(())
    }

    async fn notify_abort(&mut self) -> Result<(), Error> {
        let g = self.gxact_mut()?;
        let gid = g.gid.to_string();
        let segments = g.twophase_segments();
        match g.state() {
            DtxState::NotifyingAbortNoPrepared => {
                if g.writer_gang_lost || !g.is_distributed() {
                    debug!("omitting 'Abort (No Prepared)' broadcast for gid = {}", gid);
                    return Ok(());
                }
                let out = dispatch_dtx_protocol_command(
                    &*self.dispatcher,
                    DtxProtocolCommand::AbortNoPrepared,
                    &gid,
                    &segments,
                    DispatchMode::CollectErrors,
                )
                .await;
                if !matches!(out, Ok(o) if o.succeeded) {
                    warn!(
                        "the distributed transaction 'Abort (No Prepared)' broadcast failed for gid = {}",
                        gid
                    );
                    info!("releasing segworker groups to finish aborting the transaction");
                    self.dispatcher.reset_gangs().await;
                }
                Ok(())
            }
            state => {
                let cmd = if state == DtxState::NotifyingAbortSomePrepared {
                    DtxProtocolCommand::AbortSomePrepared
                } else {
                    DtxProtocolCommand::AbortPrepared
                };
                self.tm
                    .faults()
                    .check(FaultPoint::DtmBroadcastAbortPrepared)
                    .await?;
                if self.broadcast(cmd, &gid, &segments).await {
                    return Ok(());
                }
                warn!(
                    "the distributed transaction '{}' broadcast failed for gid = {}; retrying",
                    cmd, gid
                );
                self.gxact_mut()?
                    .set_state(DtxState::RetryAbortPrepared)?;
                self.retry_abort_prepared(&gid).await
            }
        }
    }

    /// Resets the gangs and asks every segment to abort `gid`, until one
    /// broadcast succeeds or the retry budget runs out.
    async fn retry_abort_prepared(&mut self, gid: &str) -> Result<(), Error> {
        let all = self.dispatcher.all_segments();
        let limit = self.tm.config().phase2_retry_count;
        let mut retry = 0;
        let mut ok = false;
        while !ok && retry < limit {
            retry += 1;
            if retry > 1 {
                info!("releasing segworker groups to retry broadcast, attempt {}", retry);
            }
            self.dispatcher.reset_gangs().await;
            ok = self
                .broadcast(DtxProtocolCommand::RetryAbortPrepared, gid, &all)
                .await;
            if !ok {
                warn!("the distributed transaction 'Abort' broadcast failed for gid = {}", gid);
            }
        }
        if !ok {
            error!(
                "unable to complete 'Abort Prepared' broadcast for gid = {} after {} retries",
                gid, retry
            );
            return Err(Error::Phase2RetriesExhausted {
                command: DtxProtocolCommand::AbortPrepared.tag().to_string(),
                gid: gid.to_string(),
                retries: retry,
            });
        }
        Ok(())
    }

    async fn broadcast(&self, cmd: DtxProtocolCommand, gid: &str, segments: &[SegmentId]) -> bool {
        match dispatch_dtx_protocol_command(
            &*self.dispatcher,
            cmd,
            gid,
            segments,
            DispatchMode::RaiseError,
        )
        .await
        {
            Ok(out) => out.succeeded,
            Err(e) => {
                debug!("'{}' for gid = {} failed: {}", cmd, gid, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DtmConfig, DtxLogRecord, FaultKind, GxactLog, LocalDispatcher, MemDtxLog, Segment,
        TestClock,
    };
    use async_std::task;

    struct Cluster {
        segs: Vec<Segment>,
        disp: LocalDispatcher,
        tm: Arc<TmShared>,
    }

    fn cluster(n: i32, config: DtmConfig) -> Cluster {
        let segs: Vec<Segment> = (0..n).map(|i| Segment::new(SegmentId(i))).collect();
        let disp = LocalDispatcher::new(segs.clone());
        let tm = TmShared::new(
            config,
            Box::new(TestClock::starting_at_secs(1_700_000_000)),
            Box::new(MemDtxLog::new()),
        )
        .unwrap();
        Cluster { segs, disp, tm }
    }

    impl Cluster {
        fn session(&self) -> CoordinatorSession {
            CoordinatorSession::new(self.tm.clone(), Arc::new(self.disp.clone()))
        }
    }

    #[test]
    fn two_phase_commit_happy_path() {
        let _ = tracing_subscriber::fmt::try_init();
        task::block_on(async {
            let c = cluster(3, DtmConfig::default());
            let mut s = c.session();
            let gid = s.begin_distributed_transaction().await.unwrap();
            assert!(c.tm.dtm_started());
            s.start_writer_gang(&[SegmentId(0), SegmentId::ENTRY_DB, SegmentId(2)])
                .await
                .unwrap();
            assert_eq!(
                s.current_gxact().unwrap().twophase_segments(),
                vec![SegmentId(0), SegmentId(2)]
            );
            s.prepare_transaction().await.unwrap();
            assert_eq!(s.current_state(), DtxState::Prepared);
            s.commit_prepared_transaction().await.unwrap();
            assert_eq!(s.current_state(), DtxState::None);

            assert_eq!(c.segs[0].committed().await, vec![gid.to_string()]);
            assert!(c.segs[1].committed().await.is_empty());
            assert_eq!(c.segs[2].committed().await, vec![gid.to_string()]);
            assert_eq!(
                c.tm.log_records().await.unwrap(),
                vec![
                    DtxLogRecord::DistributedCommit(GxactLog { gid }),
                    DtxLogRecord::DistributedForget(GxactLog { gid }),
                ]
            );
            assert!(c.tm.committed_gxacts().await.is_empty());
        });
    }

    #[test]
    fn local_transaction_skips_two_phase() {
        task::block_on(async {
            let c = cluster(2, DtmConfig::default());
            let mut s = c.session();
            s.begin_distributed_transaction().await.unwrap();
            s.commit_transaction().await.unwrap();
            assert_eq!(s.current_state(), DtxState::None);
            assert!(c.tm.log_records().await.unwrap().is_empty());
            // The session is reusable.
            let g2 = s.begin_distributed_transaction().await.unwrap();
            assert_eq!(s.current_gxact().unwrap().gid, g2);
            assert!(!s.current_gxact().unwrap().explicit_begin);
            s.remember_explicit_begin().unwrap();
            assert!(s.current_gxact().unwrap().explicit_begin);
            s.commit_transaction().await.unwrap();
            assert_eq!(s.remember_explicit_begin(), Err(Error::DtmNotActive));
        });
    }

    #[test]
    fn nested_begin_poisons_the_session() {
        task::block_on(async {
            let c = cluster(1, DtmConfig::default());
            let mut s = c.session();
            s.begin_distributed_transaction().await.unwrap();
            let err = s.begin_distributed_transaction().await.unwrap_err();
            assert_eq!(err.severity(), Severity::Panic);
            assert!(s.is_poisoned());
            assert_eq!(s.abort_transaction().await.unwrap_err(), err);
        });
    }

    #[test]
    fn failed_prepare_aborts_some_prepared() {
        task::block_on(async {
            let c = cluster(2, DtmConfig::default());
            c.segs[1]
                .faults()
                .inject(
                    FaultPoint::Segment(DtxProtocolCommand::Prepare),
                    FaultKind::Error,
                    Some(1),
                )
                .await;
            let mut s = c.session();
            let gid = s.begin_distributed_transaction().await.unwrap();
            s.start_writer_gang(&c.disp.all_segments()).await.unwrap();
            match s.commit_transaction().await {
                Err(Error::PrepareFailed { gid: g }) => assert_eq!(g, gid.to_string()),
                r => panic!("unexpected result {:?}", r),
            }
            assert_eq!(s.current_state(), DtxState::None);
            for seg in c.segs.iter() {
                assert!(seg.prepared().await.is_empty());
                assert!(seg.in_progress().await.is_empty());
                assert_eq!(seg.aborted().await, vec![gid.to_string()]);
            }
            assert!(c.tm.log_records().await.unwrap().is_empty());
        });
    }

    #[test]
    fn unreachable_prepare_goes_to_retry_abort_on_all_segments() {
        task::block_on(async {
            let c = cluster(3, DtmConfig::default());
            let mut s = c.session();
            let gid = s.begin_distributed_transaction().await.unwrap();
            s.start_writer_gang(&[SegmentId(0), SegmentId(1)])
                .await
                .unwrap();
            c.disp.set_reachable(SegmentId(1), false).await;
            assert!(s.prepare_transaction().await.is_err());
            assert!(s.current_gxact().unwrap().bad_prepare_gangs);
            c.disp.set_reachable(SegmentId(1), true).await;
            s.abort_transaction().await.unwrap();
            assert_eq!(s.current_state(), DtxState::None);
            // Segment 0 had prepared; the retry reached it.
            assert_eq!(c.segs[0].aborted().await, vec![gid.to_string()]);
            assert!(c.segs[0].prepared().await.is_empty());
        });
    }

    #[test]
    fn commit_notification_retries_then_succeeds() {
        task::block_on(async {
            let c = cluster(2, DtmConfig::default());
            c.segs[1]
                .faults()
                .inject(
                    FaultPoint::Segment(DtxProtocolCommand::CommitPrepared),
                    FaultKind::Fatal,
                    Some(1),
                )
                .await;
            let mut s = c.session();
            let gid = s.begin_distributed_transaction().await.unwrap();
            s.start_writer_gang(&c.disp.all_segments()).await.unwrap();
            s.commit_transaction().await.unwrap();
            for seg in c.segs.iter() {
                assert_eq!(seg.committed().await, vec![gid.to_string()]);
            }
            assert_eq!(
                c.segs[1]
                    .faults()
                    .hits(FaultPoint::Segment(DtxProtocolCommand::RetryCommitPrepared))
                    .await,
                1
            );
            assert!(c.tm.committed_gxacts().await.is_empty());
        });
    }

    #[test]
    fn exhausted_commit_retries_panic_and_keep_the_commit_record() {
        task::block_on(async {
            let config = DtmConfig {
                phase2_retry_count: 2,
                ..Default::default()
            };
            let c = cluster(2, config);
            let mut s = c.session();
            let gid = s.begin_distributed_transaction().await.unwrap();
            s.start_writer_gang(&c.disp.all_segments()).await.unwrap();
            s.prepare_transaction().await.unwrap();
            c.disp.set_reachable(SegmentId(1), false).await;
            let err = s.commit_prepared_transaction().await.unwrap_err();
            match &err {
                Error::Phase2RetriesExhausted { retries, .. } => assert_eq!(*retries, 2),
                e => panic!("unexpected error {:?}", e),
            }
            assert_eq!(err.severity(), Severity::Panic);
            assert_eq!(s.current_state(), DtxState::RetryCommitPrepared);
            assert_eq!(c.tm.committed_gxacts().await, vec![gid]);
            assert_eq!(c.segs[0].committed().await, vec![gid.to_string()]);
            assert_eq!(c.segs[1].prepared().await, vec![gid.to_string()]);
        });
    }

    #[test]
    fn session_halts_after_exhausted_commit_retries() {
        task::block_on(async {
            let config = DtmConfig {
                phase2_retry_count: 2,
                ..Default::default()
            };
            let c = cluster(2, config);
            let mut s = c.session();
            let gid = s.begin_distributed_transaction().await.unwrap();
            s.start_writer_gang(&c.disp.all_segments()).await.unwrap();
            s.prepare_transaction().await.unwrap();
            c.disp.set_reachable(SegmentId(1), false).await;
            let err = s.commit_prepared_transaction().await.unwrap_err();
            assert!(s.is_poisoned());

            // Nothing clears the transaction or starts another one.
            assert_eq!(s.abort_transaction().await.unwrap_err(), err);
            assert_eq!(s.current_state(), DtxState::RetryCommitPrepared);
            assert_eq!(s.begin_distributed_transaction().await.unwrap_err(), err);
            assert_eq!(c.tm.committed_gxacts().await, vec![gid]);
            assert_eq!(c.segs[1].prepared().await, vec![gid.to_string()]);

            // A fresh session cannot roll back past the commit point either.
            let mut s2 = c.session();
            s2.begin_distributed_transaction().await.unwrap();
            s2.start_writer_gang(&[SegmentId(0)]).await.unwrap();
            s2.prepare_transaction().await.unwrap();
            c.tm.faults()
                .inject(FaultPoint::DtmBroadcastCommitPrepared, FaultKind::Fatal, Some(1))
                .await;
            assert!(s2.commit_prepared_transaction().await.is_err());
            assert!(!s2.is_poisoned());
            assert_eq!(s2.current_state(), DtxState::NotifyingCommitPrepared);
            match s2.abort_transaction().await {
                Err(Error::InvariantViolation(_)) => (),
                r => panic!("unexpected rollback result {:?}", r),
            }
            assert!(s2.is_poisoned());
        });
    }

    #[test]
    fn abort_of_prepared_transaction() {
        task::block_on(async {
            let c = cluster(2, DtmConfig::default());
            let mut s = c.session();
            let gid = s.begin_distributed_transaction().await.unwrap();
            s.start_writer_gang(&c.disp.all_segments()).await.unwrap();
            s.prepare_transaction().await.unwrap();
            s.abort_transaction().await.unwrap();
            for seg in c.segs.iter() {
                assert_eq!(seg.aborted().await, vec![gid.to_string()]);
            }
            assert!(c.tm.log_records().await.unwrap().is_empty());
        });
    }

    #[test]
    fn lost_writer_gang_skips_abort_broadcast() {
        task::block_on(async {
            let c = cluster(2, DtmConfig::default());
            let mut s = c.session();
            s.begin_distributed_transaction().await.unwrap();
            c.disp.set_reachable(SegmentId(1), false).await;
            assert!(s
                .start_writer_gang(&c.disp.all_segments())
                .await
                .is_err());
            assert!(s.current_gxact().unwrap().writer_gang_lost);
            s.abort_transaction().await.unwrap();
            assert_eq!(s.current_state(), DtxState::None);
            assert_eq!(
                c.segs[0]
                    .faults()
                    .hits(FaultPoint::Segment(DtxProtocolCommand::AbortNoPrepared))
                    .await,
                0
            );
        });
    }

    #[test]
    fn state_history_is_a_path_through_the_graph() {
        task::block_on(async {
            let c = cluster(1, DtmConfig::default());
            let mut s = c.session();
            s.begin_distributed_transaction().await.unwrap();
            s.start_writer_gang(&[SegmentId(0)]).await.unwrap();
            s.prepare_transaction().await.unwrap();
            let history = s.current_gxact().unwrap().history().to_vec();
            for w in history.windows(2) {
                assert!(w[0].can_advance_to(w[1]), "{} -> {}", w[0], w[1]);
            }
            s.abort_transaction().await.unwrap();
        });
    }

    #[test]
    fn exiting_process_aborts_by_gang_reset_only() {
        task::block_on(async {
            let c = cluster(2, DtmConfig::default());
            let mut s = c.session();
            let unprepared = s.begin_distributed_transaction().await.unwrap();
            s.start_writer_gang(&c.disp.all_segments()).await.unwrap();
            s.abort_transaction_on_exit().await.unwrap();
            assert_eq!(s.current_state(), DtxState::None);
            for seg in c.segs.iter() {
                assert_eq!(seg.aborted().await, vec![unprepared.to_string()]);
                assert_eq!(
                    seg.faults()
                        .hits(FaultPoint::Segment(DtxProtocolCommand::AbortNoPrepared))
                        .await,
                    0
                );
            }

            let prepared = s.begin_distributed_transaction().await.unwrap();
            s.start_writer_gang(&c.disp.all_segments()).await.unwrap();
            s.prepare_transaction().await.unwrap();
            let err = s.abort_transaction_on_exit().await.unwrap_err();
            assert_eq!(
                err,
                Error::AbortBroadcastIncomplete {
                    gid: prepared.to_string()
                }
            );
            assert!(err.is_fatal());
            for seg in c.segs.iter() {
                assert_eq!(seg.prepared().await, vec![prepared.to_string()]);
            }
        });
    }
}
