// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Named points where tests can make the coordinator or a segment fail on
//! demand, to drive the retry and recovery paths without real crashes.

use crate::{DtxProtocolCommand, Error, Severity};
use async_std::sync::{Arc, Mutex};
use std::collections::HashMap;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Start of transaction manager initialization, before crash recovery.
    DtmInit,
    /// Just before `PREPARE` is broadcast.
    DtmBroadcastPrepare,
    /// Just before the durable committed record is written.
    DtmXLogDistributedCommit,
    /// Just before `COMMIT PREPARED` is broadcast, after the commit point.
    DtmBroadcastCommitPrepared,
    /// Just before `ABORT PREPARED` / `ABORT SOME PREPARED` is broadcast.
    DtmBroadcastAbortPrepared,
    /// A segment receiving the given protocol command.
    Segment(DtxProtocolCommand),
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum FaultKind {
    Error,
    Fatal,
    Panic,
}

impl FaultKind {
    fn severity(&self) -> Severity {
        match self {
            FaultKind::Error => Severity::Error,
            FaultKind::Fatal => Severity::Fatal,
            FaultKind::Panic => Severity::Panic,
        }
    }
}

#[derive(Clone, Debug)]
struct Armed {
    kind: FaultKind,
    /// Remaining triggers; `None` fires forever.
    remaining: Option<usize>,
}

#[derive(Default)]
struct Inner {
    armed: HashMap<FaultPoint, Armed>,
    hits: HashMap<FaultPoint, usize>,
}

#[derive(Clone, Default)]
pub struct FaultInjector {
    inner: Arc<Mutex<Inner>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        FaultInjector::default()
    }

    /// Arms `point` to fail the next `occurrences` times it is reached, or
    /// every time if `occurrences` is `None`.
    pub async fn inject(&self, point: FaultPoint, kind: FaultKind, occurrences: Option<usize>) {
        let mut guard = self.inner.lock().await;
        guard.armed.insert(
            point,
            Armed {
                kind,
                remaining: occurrences,
            },
        );
    }

    pub async fn reset(&self, point: FaultPoint) {
        self.inner.lock().await.armed.remove(&point);
    }

    /// How many times `point` has been reached, armed or not.
    pub async fn hits(&self, point: FaultPoint) -> usize {
        *self.inner.lock().await.hits.get(&point).unwrap_or(&0)
    }

    pub(crate) async fn check(&self, point: FaultPoint) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        *guard.hits.entry(point).or_insert(0) += 1;
        let kind = match guard.armed.get_mut(&point) {
            None => return Ok(()),
            Some(armed) => {
                let kind = armed.kind;
                match armed.remaining.as_mut() {
                    Some(0) => None,
                    Some(n) => {
                        *n -= 1;
                        Some(kind)
                    }
                    None => Some(kind),
                }
            }
        };
        match kind {
            None => {
                guard.armed.remove(&point);
                Ok(())
            }
            Some(kind) => {
                warn!("fault triggered at {:?} ({:?})", point, kind);
                Err(Error::InjectedFault {
                    point: format!("{:?}", point),
                    severity: kind.severity(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    #[test]
    fn counted_fault_fires_then_disarms() {
        task::block_on(async {
            let fi = FaultInjector::new();
            fi.inject(FaultPoint::DtmBroadcastPrepare, FaultKind::Error, Some(2))
                .await;
            assert!(fi.check(FaultPoint::DtmBroadcastPrepare).await.is_err());
            assert!(fi.check(FaultPoint::DtmBroadcastPrepare).await.is_err());
            assert!(fi.check(FaultPoint::DtmBroadcastPrepare).await.is_ok());
            assert!(fi.check(FaultPoint::DtmInit).await.is_ok());
            assert_eq!(fi.hits(FaultPoint::DtmBroadcastPrepare).await, 3);
        });
    }

    #[test]
    fn fault_severity_follows_kind() {
        task::block_on(async {
            let fi = FaultInjector::new();
            fi.inject(FaultPoint::DtmInit, FaultKind::Fatal, None).await;
            for _ in 0..3 {
                let err = fi.check(FaultPoint::DtmInit).await.unwrap_err();
                assert!(err.is_fatal());
            }
            fi.reset(FaultPoint::DtmInit).await;
            assert!(fi.check(FaultPoint::DtmInit).await.is_ok());
        });
    }
}
