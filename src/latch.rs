// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use async_std::sync::{Arc, Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Why a blocked process was told to stop waiting.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interrupt {
    QueryCancel,
    StatementTimeout,
    Terminate,
}

#[derive(Default)]
struct LatchState {
    set: bool,
    pending: Option<Interrupt>,
}

/// The per-process wakeable signal. Setting is sticky until the owner resets
/// it, so a wakeup that lands between the owner's check and its wait is not
/// lost.
#[derive(Clone, Default)]
pub(crate) struct Latch {
    inner: Arc<(Mutex<LatchState>, Condvar)>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Latch::default()
    }

    pub(crate) async fn set(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().await.set = true;
        cvar.notify_all();
    }

    pub(crate) async fn reset(&self) {
        let (lock, _) = &*self.inner;
        lock.lock().await.set = false;
    }

    /// Posts an interrupt and wakes the owner. A later interrupt replaces an
    /// unconsumed earlier one.
    pub(crate) async fn interrupt(&self, why: Interrupt) {
        let (lock, cvar) = &*self.inner;
        {
            let mut guard = lock.lock().await;
            guard.pending = Some(why);
            guard.set = true;
        }
        cvar.notify_all();
    }

    /// Consumes a pending interrupt, if any.
    pub(crate) async fn check_for_interrupts(&self) -> Result<(), Error> {
        let (lock, _) = &*self.inner;
        match lock.lock().await.pending.take() {
            None => Ok(()),
            Some(why) => Err(Error::Interrupted(why)),
        }
    }

    pub(crate) async fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let _guard = cvar
            .wait_until(lock.lock().await, |s| s.set || s.pending.is_some())
            .await;
    }
}
