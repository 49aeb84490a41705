// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Transaction-manager state shared by every coordinator session, and crash
//! recovery.
//!
//! The durable [DtxLog] is the source of truth. On startup it is replayed
//! into the committed set: every gid with a committed record and no later
//! forget record. Those transactions reached their commit point, so recovery
//! re-broadcasts their commit. Any other transaction still prepared on some
//! segment never reached its commit point and is aborted.
//!
//! Recovery runs at most once per [TmShared]. The first session to call
//! [TmShared::run_crash_recovery] performs it while holding the control lock;
//! the others queue behind the lock and find the recovered flag set. A
//! failed recovery releases the lock without setting the flag, so the next
//! caller tries again.

use crate::{
    dispatch::dispatch_dtx_protocol_command, faultinjector::FaultPoint, Clock, DispatchMode,
    Dispatcher, DtmConfig, DtxLog, DtxLogRecord, DtxProtocolCommand, Error, FaultInjector, Gid,
    GxactLog, RedoFile, Role, TidMgr,
};
use async_std::sync::{Arc, Mutex};
use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, debug_span, error, info, instrument, trace, warn, Instrument};

struct TmControl {
    recovered: bool,

    /// Committed and not yet forgotten, in no particular order.
    committed: Vec<GxactLog>,
}

impl TmControl {
    // Applies one committed or forget record to the committed set, or in
    // utility mode buffers it in the redo file.
    fn redo(
        &mut self,
        rec: &DtxLogRecord,
        role: Role,
        max_tm_gxacts: usize,
        redo: Option<&RedoFile>,
    ) -> Result<(), Error> {
        if role == Role::Utility {
            trace!("utility mode: saving {:?} for later", rec);
            if let Some(redo) = redo {
                redo.append(rec)?;
            }
            return Ok(());
        }
        match rec {
            DtxLogRecord::DistributedCommit(log) => {
                if self.committed.iter().any(|g| g.gid == log.gid) {
                    return Ok(());
                }
                if self.committed.len() >= max_tm_gxacts {
                    error!(
                        "the limit of {} distributed transactions has been reached",
                        max_tm_gxacts
                    );
                    return Err(Error::TooManyCommittedGxacts(max_tm_gxacts));
                }
                trace!("redo added committed distributed transaction gid = {}", log.gid);
                self.committed.push(*log);
            }
            DtxLogRecord::DistributedForget(log) => {
                match self.committed.iter().position(|g| g.gid == log.gid) {
                    Some(i) => {
                        trace!("redo removed committed distributed transaction gid = {}", log.gid);
                        self.committed.swap_remove(i);
                    }
                    None => debug!(
                        "redo did not find committed distributed transaction gid = {} for forget",
                        log.gid
                    ),
                }
            }
        }
        Ok(())
    }
}

pub struct TmShared {
    config: DtmConfig,
    tidmgr: TidMgr,
    control: Mutex<TmControl>,
    dtm_started: AtomicBool,
    log: Mutex<Box<dyn DtxLog>>,
    redo: Option<RedoFile>,
    faults: FaultInjector,
}

impl TmShared {
    /// Builds the shared state and redoes every record of `log`.
    pub fn new(
        config: DtmConfig,
        clock: Box<dyn Clock>,
        log: Box<dyn DtxLog>,
    ) -> Result<Arc<Self>, Error> {
        Self::with_faults(config, clock, log, FaultInjector::new())
    }

    pub fn with_faults(
        config: DtmConfig,
        clock: Box<dyn Clock>,
        log: Box<dyn DtxLog>,
        faults: FaultInjector,
    ) -> Result<Arc<Self>, Error> {
        let records = log.replay()?;
        let redo = config.redo_path.as_ref().map(RedoFile::new);
        if config.role == Role::Utility && redo.is_none() {
            return Err(Error::RecoveryFailed(
                "utility mode requires a redo file path".into(),
            ));
        }
        let mut control = TmControl {
            recovered: false,
            committed: Vec::new(),
        };
        debug!("redoing {} distributed transaction log records", records.len());
        for rec in records.iter() {
            control.redo(rec, config.role, config.max_tm_gxacts, redo.as_ref())?;
        }
        let tm = TmShared {
            tidmgr: TidMgr::new(clock)?,
            control: Mutex::new(control),
            dtm_started: AtomicBool::new(false),
            log: Mutex::new(log),
            redo,
            faults,
            config,
        };
        Ok(Arc::new(tm))
    }

    pub fn config(&self) -> &DtmConfig {
        &self.config
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub(crate) fn create_gid(&self) -> Result<Gid, Error> {
        self.tidmgr.create_gid()
    }

    /// Whether crash recovery completed and distributed transactions may run.
    pub fn dtm_started(&self) -> bool {
        self.dtm_started.load(Ordering::SeqCst)
    }

    /// Gids in the committed-but-not-forgotten set, sorted.
    pub async fn committed_gxacts(&self) -> Vec<Gid> {
        let mut v: Vec<Gid> = self
            .control
            .lock()
            .await
            .committed
            .iter()
            .map(|g| g.gid)
            .collect();
        v.sort();
        v
    }

    /// Every durable record so far, oldest first.
    pub async fn log_records(&self) -> Result<Vec<DtxLogRecord>, Error> {
        self.log.lock().await.replay()
    }

    fn redo_record(
        &self,
        control: &mut TmControl,
        rec: &DtxLogRecord,
        role: Role,
    ) -> Result<(), Error> {
        control.redo(rec, role, self.config.max_tm_gxacts, self.redo.as_ref())
    }

    /// Durably records the commit point of `gid`, then tracks it as
    /// committed-but-not-forgotten.
    pub(crate) async fn record_distributed_commit(&self, gid: Gid) -> Result<(), Error> {
        let rec = DtxLogRecord::DistributedCommit(GxactLog { gid });
        self.log.lock().await.append(&rec)?;
        let mut control = self.control.lock().await;
        self.redo_record(&mut control, &rec, self.config.role)
    }

    pub(crate) async fn record_distributed_forget(&self, gid: Gid) -> Result<(), Error> {
        let rec = DtxLogRecord::DistributedForget(GxactLog { gid });
        self.log.lock().await.append(&rec)?;
        let mut control = self.control.lock().await;
        self.redo_record(&mut control, &rec, self.config.role)
    }

    /// Runs crash recovery unless some earlier caller already completed it.
    /// A failed attempt is retried once; a second failure is fatal.
    #[instrument(skip(self, dispatcher))]
    pub async fn run_crash_recovery(&self, dispatcher: &dyn Dispatcher) -> Result<(), Error> {
        let mut first = true;
        loop {
            match self.recover_as_needed(dispatcher).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    error!("transaction manager recovery failed: {}", e);
                    return Err(e);
                }
                Err(e) if first => {
                    warn!("transaction manager recovery failed, retrying: {}", e);
                    first = false;
                }
                Err(e) => {
                    error!("transaction manager recovery failed twice: {}", e);
                    return Err(Error::RecoveryFailed(e.to_string()));
                }
            }
        }
    }

    async fn recover_as_needed(&self, dispatcher: &dyn Dispatcher) -> Result<(), Error> {
        let mut control = self.control.lock().await;
        if control.recovered {
            return Ok(());
        }
        self.faults.check(FaultPoint::DtmInit).await?;
        // On error the guard drops here and releases the lock for the next
        // caller to retry.
        self.recover_tm(&mut control, dispatcher).await?;
        control.recovered = true;
        Ok(())
    }

    async fn recover_tm(
        &self,
        control: &mut TmControl,
        dispatcher: &dyn Dispatcher,
    ) -> Result<(), Error> {
        if self.config.role == Role::Utility {
            debug!("utility mode: deferring transaction manager recovery");
            return Ok(());
        }
        let span = debug_span!("recover-in-doubt");
        self.recover_in_doubt_transactions(control, dispatcher)
            .instrument(span)
            .await?;
        self.dtm_started.store(true, Ordering::SeqCst);
        info!("DTM Started");
        Ok(())
    }

    async fn recover_in_doubt_transactions(
        &self,
        control: &mut TmControl,
        dispatcher: &dyn Dispatcher,
    ) -> Result<(), Error> {
        if let Some(redo) = &self.redo {
            let buffered = redo.replay()?;
            debug!("replaying {} records from the redo file", buffered.len());
            for rec in buffered.iter() {
                self.redo_record(control, rec, Role::Dispatch)?;
            }
        }

        debug!(
            "retrying commit notification for {} distributed transactions",
            control.committed.len()
        );
        for log in control.committed.clone() {
            self.notify_committed_in_doubt(dispatcher, log.gid).await?;
            let rec = DtxLogRecord::DistributedForget(log);
            self.log.lock().await.append(&rec)?;
            self.redo_record(control, &rec, Role::Dispatch)?;
        }
        control.committed.clear();

        let in_doubt = gather_in_doubt_transactions(dispatcher).await?;
        for gid in sorted(&in_doubt) {
            self.abort_in_doubt(dispatcher, &gid).await?;
        }

        let remaining = gather_in_doubt_transactions(dispatcher).await?;
        if !remaining.is_empty() {
            let list = sorted(&remaining);
            error!("unresolved in-doubt transactions remain: {:?}", list);
            return Err(Error::UnresolvedInDoubt(list));
        }

        if let Some(redo) = &self.redo {
            redo.remove()?;
        }
        Ok(())
    }

    async fn notify_committed_in_doubt(
        &self,
        dispatcher: &dyn Dispatcher,
        gid: Gid,
    ) -> Result<(), Error> {
        let all = dispatcher.all_segments();
        let cmd = DtxProtocolCommand::RecoveryCommitPrepared;
        let text = gid.to_string();
        let out =
            dispatch_dtx_protocol_command(dispatcher, cmd, &text, &all, DispatchMode::CollectErrors)
                .await?;
        if !out.succeeded {
            error!(
                "Crash recovery broadcast of the distributed transaction 'Commit Prepared' failed for gid = {}",
                gid
            );
            return Err(Error::RecoveryBroadcastFailed {
                command: cmd.tag().to_string(),
                gid: text,
            });
        }
        info!(
            "Crash recovery broadcast of the distributed transaction 'Commit Prepared' succeeded for gid = {}",
            gid
        );
        Ok(())
    }

    async fn abort_in_doubt(&self, dispatcher: &dyn Dispatcher, gid: &str) -> Result<(), Error> {
        let all = dispatcher.all_segments();
        let cmd = DtxProtocolCommand::RecoveryAbortPrepared;
        let out =
            dispatch_dtx_protocol_command(dispatcher, cmd, gid, &all, DispatchMode::CollectErrors)
                .await?;
        if !out.succeeded {
            error!(
                "Crash recovery retry of the distributed transaction 'Abort Prepared' failed for gid = {}",
                gid
            );
            return Err(Error::RecoveryBroadcastFailed {
                command: cmd.tag().to_string(),
                gid: gid.to_string(),
            });
        }
        info!(
            "Crash recovery broadcast of the distributed transaction 'Abort Prepared' succeeded for gid = {}",
            gid
        );
        Ok(())
    }
}

/// Every prepared gid on any segment, without duplicates.
async fn gather_in_doubt_transactions(
    dispatcher: &dyn Dispatcher,
) -> Result<HashSet<String>, Error> {
    let mut found = HashSet::new();
    for (seg, res) in dispatcher.list_prepared(dispatcher.all_segments()).await {
        match res {
            Ok(gids) => {
                for gid in gids {
                    if found.insert(gid.clone()) {
                        debug!("found in-doubt transaction {} on {:?}", gid, seg);
                    }
                }
            }
            Err(detail) => {
                return Err(Error::DispatchFailed {
                    command: "select gid from pg_prepared_xacts".into(),
                    segment: seg.0,
                    detail,
                })
            }
        }
    }
    Ok(found)
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = set.iter().cloned().collect();
    v.sort();
    v
}
