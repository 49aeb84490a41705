// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, Gid};
use async_std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

/// Source of the transaction manager's start timestamp.
pub trait Clock: Send + Sync {
    fn current_time(&self) -> SystemTime;
}

/// Wall-clock time.
pub struct RealClock;
impl Clock for RealClock {
    fn current_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A settable clock for tests. Reading it moves it forward one millisecond,
/// so two transaction managers built from it never share a start time at
/// millisecond resolution.
#[derive(Clone, Default)]
pub struct TestClock(Arc<AtomicU64>);
impl TestClock {
    pub fn starting_at_secs(secs: u64) -> Self {
        TestClock(Arc::new(AtomicU64::from(secs * 1000)))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}
impl Clock for TestClock {
    fn current_time(&self) -> SystemTime {
        let ms = self.0.fetch_add(1, Ordering::SeqCst);
        UNIX_EPOCH + Duration::from_millis(ms)
    }
}

/// TidMgr hands out [Gid]s for transactions coordinated by this process. The
/// start timestamp is drawn from the clock once, when the transaction
/// manager's shared state is created; the sequence is a lock-free counter
/// shared by every session.
pub struct TidMgr {
    clock: Box<dyn Clock>,
    start_ts: u32,
    seq: AtomicU32,
}

impl TidMgr {
    pub const FIRST_GXID: u32 = 1;
    pub const LAST_GXID: u32 = u32::MAX;

    pub fn new(clock: Box<dyn Clock>) -> Result<Self, Error> {
        Self::with_next_gxid(clock, Self::FIRST_GXID + 1)
    }

    /// Like [TidMgr::new] but the first issued sequence number is `next`.
    pub fn with_next_gxid(clock: Box<dyn Clock>, next: u32) -> Result<Self, Error> {
        let now = clock.current_time();
        let start_ts = match now.duration_since(UNIX_EPOCH) {
            // Seconds since the epoch fit in 32 bits until 2106.
            Ok(dur) if dur.as_secs() <= u32::MAX as u64 => dur.as_secs() as u32,
            _ => {
                error!("clock reports an unusable start time {:?}", now);
                return Err(Error::InvariantViolation(
                    "transaction manager start time out of range".into(),
                ));
            }
        };
        debug!("transaction manager start timestamp {}", start_ts);
        Ok(TidMgr {
            clock,
            start_ts,
            seq: AtomicU32::new(next.saturating_sub(1).max(Self::FIRST_GXID)),
        })
    }

    pub fn start_ts(&self) -> u32 {
        self.start_ts
    }

    pub fn current_time(&self) -> SystemTime {
        self.clock.current_time()
    }

    /// Issues the next gid. Hitting the last representable sequence number is
    /// unrecoverable for this run: the returned error is of panic severity.
    pub fn create_gid(&self) -> Result<Gid, Error> {
        let prev = self
            .seq
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                if s >= Self::LAST_GXID - 1 {
                    None
                } else {
                    Some(s + 1)
                }
            })
            .map_err(|_| {
                error!("reached the limit of global transaction ids");
                Error::GidExhausted
            })?;
        Ok(Gid::new(self.start_ts, prev + 1))
    }
}
