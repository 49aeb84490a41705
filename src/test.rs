// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use weir::{
    CoordinatorSession, Dispatcher, DtmConfig, DtxLogRecord, DtxProtocolCommand, Error,
    FaultKind, FaultPoint, FileDtxLog, GroupId, GroupStatus, GxactLog, LocalDispatcher, MemDtxLog,
    NetworkDispatcher, NullOsGroup, ResGroupCaps, ResGroupConfig, ResGroupRuntime, RolePolicy,
    Segment, SegmentId, SegmentReply, SessionId, SyncBoxFuture, TestClock, TmShared, UserInfo,
};

use async_std::{
    sync::{Arc, Mutex},
    task,
};
use duplexify::Duplex;
use sluice::pipe::{pipe, PipeReader, PipeWriter};
use std::time::Duration;
use tracing::info;

type PipeRw = Duplex<PipeReader, PipeWriter>;
fn duplex_pair() -> (PipeRw, PipeRw) {
    let (a_recv, b_send) = pipe();
    let (b_recv, a_send) = pipe();
    let a_end = Duplex::new(a_recv, a_send);
    let b_end = Duplex::new(b_recv, b_send);
    (a_end, b_end)
}

fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

async fn wait_for_status<F: Fn(&GroupStatus) -> bool>(rt: &ResGroupRuntime, group: GroupId, f: F) {
    for _ in 0..500 {
        if f(&rt.group_status(group).await.unwrap()) {
            return;
        }
        task::sleep(Duration::from_millis(2)).await;
    }
    panic!("{:?} never reached the expected status", group);
}

fn segments(n: i32) -> Vec<Segment> {
    (0..n).map(|i| Segment::new(SegmentId(i))).collect()
}

fn seg_ids(n: i32) -> Vec<SegmentId> {
    (0..n).map(SegmentId).collect()
}

async fn connect_segments(segs: &[Segment]) -> NetworkDispatcher {
    let d = NetworkDispatcher::new(segs.iter().map(|s| s.id()).collect());
    for s in segs {
        let (coord_end, seg_end) = duplex_pair();
        d.connect(s.id(), coord_end).await;
        s.serve(seg_end).await;
    }
    d.launch_workers().await;
    d
}

pub fn network_two_phase_commit() {
    setup_tracing_subscriber();
    task::block_on(async {
        let segs = segments(3);
        let d = connect_segments(&segs).await;
        let tm = TmShared::new(
            DtmConfig::default(),
            Box::new(TestClock::starting_at_secs(1_600_000_000)),
            Box::new(MemDtxLog::new()),
        )
        .unwrap();
        let mut s = CoordinatorSession::new(tm.clone(), Arc::new(d));

        let committed = s.begin_distributed_transaction().await.unwrap();
        s.start_writer_gang(&seg_ids(3)).await.unwrap();
        s.commit_transaction().await.unwrap();

        // A second transaction fails to prepare on one segment and aborts
        // everywhere.
        let aborted = s.begin_distributed_transaction().await.unwrap();
        s.start_writer_gang(&[SegmentId(0), SegmentId(2)])
            .await
            .unwrap();
        segs[2]
            .faults()
            .inject(
                FaultPoint::Segment(DtxProtocolCommand::Prepare),
                FaultKind::Error,
                Some(1),
            )
            .await;
        match s.commit_transaction().await {
            Err(Error::PrepareFailed { gid }) => assert_eq!(gid, aborted.to_string()),
            r => panic!("unexpected result {:?}", r),
        }

        for seg in segs.iter() {
            assert_eq!(seg.committed().await, vec![committed.to_string()]);
            assert!(seg.prepared().await.is_empty());
        }
        assert_eq!(segs[0].aborted().await, vec![aborted.to_string()]);
        assert_eq!(
            tm.log_records().await.unwrap(),
            vec![
                DtxLogRecord::DistributedCommit(GxactLog { gid: committed }),
                DtxLogRecord::DistributedForget(GxactLog { gid: committed }),
            ]
        );
        info!("network commit of {} and abort of {} done", committed, aborted);
    });
}

pub fn crash_after_commit_point_is_finished_by_recovery() {
    setup_tracing_subscriber();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("dtx.log");
    task::block_on(async {
        let segs = segments(2);
        let d = Arc::new(LocalDispatcher::new(segs.clone()));

        let tm = TmShared::new(
            DtmConfig::default(),
            Box::new(TestClock::starting_at_secs(1_600_000_000)),
            Box::new(FileDtxLog::open(&log_path).unwrap()),
        )
        .unwrap();
        let mut s = CoordinatorSession::new(tm.clone(), d.clone());

        // Prepared but never committed: in doubt after the crash.
        let in_doubt = s.begin_distributed_transaction().await.unwrap();
        s.start_writer_gang(&seg_ids(2)).await.unwrap();
        s.prepare_transaction().await.unwrap();

        // The crash happens right after the commit record of a second
        // transaction reaches the log.
        let mut s = CoordinatorSession::new(tm.clone(), d.clone());
        let gid = s.begin_distributed_transaction().await.unwrap();
        s.start_writer_gang(&seg_ids(2)).await.unwrap();
        s.prepare_transaction().await.unwrap();
        tm.faults()
            .inject(FaultPoint::DtmBroadcastCommitPrepared, FaultKind::Fatal, None)
            .await;
        let err = s.commit_prepared_transaction().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(tm.committed_gxacts().await, vec![gid]);
        drop(s);
        drop(tm);

        // Restart from the same log.
        let tm = TmShared::new(
            DtmConfig::default(),
            Box::new(TestClock::starting_at_secs(1_600_000_500)),
            Box::new(FileDtxLog::open(&log_path).unwrap()),
        )
        .unwrap();
        assert_eq!(tm.committed_gxacts().await, vec![gid]);
        assert!(!tm.dtm_started());
        let mut s = CoordinatorSession::new(tm.clone(), d.clone());
        let next = s.begin_distributed_transaction().await.unwrap();
        assert!(tm.dtm_started());
        assert!(next != gid);

        for seg in segs.iter() {
            assert_eq!(seg.committed().await, vec![gid.to_string()]);
            assert!(seg.aborted().await.contains(&in_doubt.to_string()));
            assert!(seg.prepared().await.is_empty());
        }
        assert_eq!(
            tm.log_records().await.unwrap(),
            vec![
                DtxLogRecord::DistributedCommit(GxactLog { gid }),
                DtxLogRecord::DistributedForget(GxactLog { gid }),
            ]
        );
        assert!(tm.committed_gxacts().await.is_empty());

        // Recovery already ran; a later session does not redo it.
        let mut s2 = CoordinatorSession::new(tm.clone(), d.clone());
        s2.begin_distributed_transaction().await.unwrap();
        assert_eq!(tm.log_records().await.unwrap().len(), 2);
    });
}

// A cluster whose segments claim to abort but never let go of one prepared
// transaction.
struct StuckDispatcher;

impl Dispatcher for StuckDispatcher {
    fn all_segments(&self) -> Vec<SegmentId> {
        vec![SegmentId(0), SegmentId(1)]
    }

    fn dispatch_dtx_command(
        &self,
        cmd: DtxProtocolCommand,
        _gid: String,
        segments: Vec<SegmentId>,
    ) -> SyncBoxFuture<Vec<(SegmentId, SegmentReply)>> {
        Box::pin(async move {
            segments
                .into_iter()
                .map(|s| (s, SegmentReply::Ok(cmd.tag().to_string())))
                .collect()
        })
    }

    fn list_prepared(
        &self,
        segments: Vec<SegmentId>,
    ) -> SyncBoxFuture<Vec<(SegmentId, Result<Vec<String>, String>)>> {
        Box::pin(async move {
            segments
                .into_iter()
                .map(|s| (s, Ok(vec!["1600000000-0000000042".to_string()])))
                .collect()
        })
    }

    fn reset_gangs(&self) -> SyncBoxFuture<()> {
        Box::pin(async {})
    }
}

pub fn unresolved_in_doubt_blocks_startup() {
    setup_tracing_subscriber();
    task::block_on(async {
        let tm = TmShared::new(
            DtmConfig::default(),
            Box::new(TestClock::starting_at_secs(1_600_000_000)),
            Box::new(MemDtxLog::new()),
        )
        .unwrap();
        let mut s = CoordinatorSession::new(tm.clone(), Arc::new(StuckDispatcher));
        match s.begin_distributed_transaction().await {
            Err(Error::RecoveryFailed(msg)) => {
                assert!(msg.contains("\"1600000000-0000000042\""), "{}", msg)
            }
            r => panic!("unexpected result {:?}", r),
        }
        assert!(!tm.dtm_started());
    });
}

pub fn admitted_transactions_commit_in_arrival_order() {
    setup_tracing_subscriber();
    task::block_on(async {
        let etl = GroupId(9000);
        let etl_caps = ResGroupCaps {
            concurrency: 1,
            cpu_rate_limit: 20,
            memory_limit: 20,
            memory_shared_quota: 50,
            memory_spill_ratio: 20,
            memory_auditor: 0,
        };
        let config = ResGroupConfig {
            memory_limit: 1.0,
            ..Default::default()
        };
        let policy = Arc::new(RolePolicy::new().with_role("etl", etl));
        let coord_rt = ResGroupRuntime::with_groups(
            config.clone(),
            Arc::new(NullOsGroup::new(1 << 30, 8)),
            policy.clone(),
            &[(etl, etl_caps)],
        )
        .unwrap();
        let seg_rt = ResGroupRuntime::with_groups(
            config,
            Arc::new(NullOsGroup::new(1 << 30, 8)),
            policy,
            &[(etl, etl_caps)],
        )
        .unwrap();

        let segs = segments(2);
        let d = Arc::new(LocalDispatcher::new(segs.clone()));
        let tm = TmShared::new(
            DtmConfig::default(),
            Box::new(TestClock::starting_at_secs(1_600_000_000)),
            Box::new(MemDtxLog::new()),
        )
        .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3u32 {
            let (rt, seg_rt, tm, d, order) = (
                coord_rt.clone(),
                seg_rt.clone(),
                tm.clone(),
                d.clone(),
                order.clone(),
            );
            tasks.push(task::spawn(async move {
                let session = SessionId(i + 1);
                let mut proc = rt.register_proc(session).await;
                let slot = proc.acquire_slot(&UserInfo::new("etl")).await.unwrap();

                let mut s = CoordinatorSession::new(tm, d);
                let gid = s.begin_distributed_transaction().await.unwrap();
                order.lock().await.push(i);

                // The segment-side worker joins the group it was sent.
                let mut worker = seg_rt.register_proc(session).await;
                worker
                    .switch_on_segment(&proc.serialize_group_info())
                    .await
                    .unwrap();
                assert_eq!(worker.group(), etl);
                assert!(worker.reserve_memory(10, 0, false));

                s.start_writer_gang(&seg_ids(2)).await.unwrap();
                if i == 0 {
                    wait_for_status(&rt, etl, |st| st.n_queueing == 2).await;
                }
                s.commit_transaction().await.unwrap();

                worker.release_memory(10);
                worker.exit().await;
                proc.release_slot(slot).await.unwrap();
                proc.exit().await;
                gid
            }));
            // Each arrival is running or queued before the next one.
            let queued = i as usize;
            wait_for_status(&coord_rt, etl, |st| st.n_running == 1 && st.n_queueing == queued)
                .await;
        }
        let mut gids = Vec::new();
        for t in tasks {
            gids.push(t.await.to_string());
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
        for seg in segs.iter() {
            assert_eq!(seg.committed().await, gids);
        }
        let st = coord_rt.group_status(etl).await.unwrap();
        assert_eq!(st.total_executed, 3);
        assert_eq!(st.n_running, 0);
        assert_eq!(
            coord_rt.granted_chunks().await + coord_rt.free_chunks(),
            coord_rt.total_chunks()
        );
        assert_eq!(seg_rt.session_slot(SessionId(1)).await, None);
        assert_eq!(seg_rt.group_status(etl).await.unwrap().mem_usage, 0);
    });
}
