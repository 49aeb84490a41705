// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! This module carries the coordinator's DTX protocol commands to segments
//! over edelcrantz connections. The coordinator end is [NetworkDispatcher];
//! the segment end is [Segment::serve], which answers requests arriving on
//! one connection until it closes.

use crate::{Dispatcher, DtxProtocolCommand, Segment, SegmentId, SegmentReply, SyncBoxFuture};
use async_std::{
    sync::{Arc, Mutex, RwLock},
    task,
};
use futures::{stream::FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, debug_span, trace, warn, Instrument};

type Conn = edelcrantz::Connection<OneWay, Req, Res>;
type Queue = edelcrantz::Queue<OneWay, Req, Res>;

pub(crate) type Connection = (Arc<Mutex<Conn>>, Queue);

pub(crate) type ResponseFuture = SyncBoxFuture<(SegmentId, Result<Res, edelcrantz::Error>)>;

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum Req {
    Dtx {
        cmd: DtxProtocolCommand,
        gid: String,
    },
    ListPrepared,
    ResetSession,
}

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum Res {
    Dtx(SegmentReply),
    Prepared(Vec<String>),
    SessionReset,
    Refused(String),
}

// Everything the protocol sends expects an answer.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum OneWay {}

/// A [Dispatcher] reaching each segment over its own connection. A segment
/// that has no connection, or whose connection failed, answers every
/// command with [SegmentReply::Unreachable].
#[derive(Clone)]
pub struct NetworkDispatcher {
    segments: Arc<Vec<SegmentId>>,
    connections: Arc<RwLock<BTreeMap<SegmentId, Connection>>>,
}

impl NetworkDispatcher {
    /// A dispatcher for a cluster made of `segments`; connect each with
    /// [NetworkDispatcher::connect].
    pub fn new(mut segments: Vec<SegmentId>) -> Self {
        segments.sort();
        segments.dedup();
        NetworkDispatcher {
            segments: Arc::new(segments),
            connections: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Adds a connection to `segment`. The `io` handle should be a
    /// full-duplex `AsyncRead+AsyncWrite` type.
    pub async fn connect<IO: edelcrantz::AsyncReadWrite>(&self, segment: SegmentId, io: IO) {
        debug!("coordinator connecting to {:?}", segment);
        let conn = edelcrantz::Connection::new(io);
        let queue = conn.queue.clone();
        let pair = (Arc::new(Mutex::new(conn)), queue);
        self.connections.write().await.insert(segment, pair);
    }

    /// Starts the tasks that read segment responses off each connection.
    /// Should be called after connecting and before dispatching anything.
    pub fn launch_workers(&self) -> SyncBoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            for (id, conn) in this.connections.read().await.iter() {
                let id = *id;
                let conn = conn.0.clone();
                task::spawn(async move {
                    let mut n: usize = 0;
                    loop {
                        n += 1;
                        let sreq = move |req: Req| {
                            task::spawn(async move {
                                warn!("coordinator refusing {:?} from {:?}", req, id);
                                Res::Refused("the coordinator serves no requests".into())
                            })
                        };
                        let sow = |ow: OneWay| match ow {};
                        let mut guard = conn.lock().await;
                        let span = debug_span!("dispatch", segment=?id, ?n);
                        let res = guard.advance(sreq, sow).instrument(span).await;
                        trace!("connection to {:?} advanced (step {:?}): {:?}", id, n, res);
                        match res {
                            Ok(()) => (),
                            // The broadcast that sent the request stopped
                            // listening; not this connection's problem.
                            Err(edelcrantz::Error::ResponseChannelDropped(_)) => (),
                            Err(_) => break,
                        }
                    }
                    warn!("dispatcher connection to {:?} exited", id);
                });
            }
        })
    }

    async fn send_req(&self, segment: SegmentId, req: Req) -> ResponseFuture {
        match self.connections.read().await.get(&segment) {
            None => Box::pin(async move { (segment, Err(edelcrantz::Error::Queue)) }),
            Some((_, queue)) => {
                let fut = queue.enqueue_request(req);
                Box::pin(async move { (segment, fut.await) })
            }
        }
    }

    async fn send_req_to_segments(
        &self,
        req: Req,
        segments: Vec<SegmentId>,
    ) -> FuturesUnordered<ResponseFuture> {
        trace!("sending {:?} to {:?}", req, segments);
        let futs = FuturesUnordered::new();
        for seg in segments {
            futs.push(self.send_req(seg, req.clone()).await);
        }
        futs
    }
}

impl Dispatcher for NetworkDispatcher {
    fn all_segments(&self) -> Vec<SegmentId> {
        self.segments.to_vec()
    }

    fn dispatch_dtx_command(
        &self,
        cmd: DtxProtocolCommand,
        gid: String,
        segments: Vec<SegmentId>,
    ) -> SyncBoxFuture<Vec<(SegmentId, SegmentReply)>> {
        let this = self.clone();
        Box::pin(async move {
            let req = Req::Dtx { cmd, gid };
            let mut futs = this.send_req_to_segments(req, segments).await;
            let mut replies = Vec::new();
            while let Some((seg, res)) = futs.next().await {
                let reply = match res {
                    Ok(Res::Dtx(reply)) => reply,
                    Ok(other) => SegmentReply::Error(format!("unexpected response {:?}", other)),
                    Err(e) => {
                        debug!("'{}' to {:?} failed: {:?}", cmd, seg, e);
                        SegmentReply::Unreachable
                    }
                };
                replies.push((seg, reply));
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
            let mut futs = this
                .send_req_to_segments(Req::ListPrepared, segments)
                .await;
            let mut res = Vec::new();
            while let Some((seg, r)) = futs.next().await {
                res.push(match r {
                    Ok(Res::Prepared(gids)) => (seg, Ok(gids)),
                    Ok(other) => (seg, Err(format!("unexpected response {:?}", other))),
                    Err(e) => (seg, Err(format!("segment {:?} unreachable: {:?}", seg, e))),
                });
            }
            res.sort();
            res
        })
    }

    fn reset_gangs(&self) -> SyncBoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            let segments: Vec<SegmentId> = this.connections.read().await.keys().cloned().collect();
            let mut futs = this
                .send_req_to_segments(Req::ResetSession, segments)
                .await;
            while let Some((seg, r)) = futs.next().await {
                if let Err(e) = r {
                    debug!("resetting session on {:?} failed: {:?}", seg, e);
                }
            }
        })
    }
}

impl Segment {
    /// Answers the coordinator's requests arriving on `io` from a spawned
    /// task, until the connection fails.
    pub async fn serve<IO: edelcrantz::AsyncReadWrite>(&self, io: IO) {
        let conn = Arc::new(Mutex::new(edelcrantz::Connection::new(io)));
        let this = self.clone();
        debug!("{:?} serving a coordinator connection", this.id());
        task::spawn(async move {
            let mut n: usize = 0;
            loop {
                n += 1;
                let sreq = {
                    let this = this.clone();
                    let span = debug_span!("segment-rpc", segment=?this.id(), ?n);
                    move |req| task::spawn(async move { this.serve_req(req).await }.instrument(span))
                };
                let sow = |ow: OneWay| match ow {};
                let mut guard = conn.lock().await;
                let res = guard.advance(sreq, sow).await;
                match res {
                    Ok(()) => (),
                    Err(edelcrantz::Error::ResponseChannelDropped(_)) => (),
                    Err(_) => break,
                }
            }
            warn!("{:?} coordinator connection exited", this.id());
        });
    }

    pub(crate) fn serve_req(&self, req: Req) -> SyncBoxFuture<Res> {
        let this = self.clone();
        Box::pin(async move { this.serve_req_(req).await })
    }

    async fn serve_req_(&self, req: Req) -> Res {
        trace!("{:?} request {:?}", self.id(), req);
        match req {
            Req::Dtx { cmd, gid } => Res::Dtx(self.perform_dtx_protocol_command(cmd, gid).await),
            Req::ListPrepared => Res::Prepared(self.prepared().await),
            Req::ResetSession => {
                self.reset_session().await;
                Res::SessionReset
            }
        }
    }
}
