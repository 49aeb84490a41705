// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The resource-group runtime.
//!
//! One [ResGroupRuntime] is shared by every process of a node (coordinator
//! or segment). It owns the group table, the slot pool and the scheduler
//! state behind a single async mutex (the "control lock"), and the memory
//! [Ledger] whose usage counters are updated without it.
//!
//! Each backend process registers and gets a [ProcHandle]. On the
//! coordinator a transaction calls [ProcHandle::acquire_slot], which may
//! wait in the group's FIFO queue, and hands the [SlotHandle] back with
//! [ProcHandle::release_slot] when it ends. On a segment, processes instead
//! call [ProcHandle::switch_on_segment] with the payload the coordinator
//! dispatched; all processes of one session share one slot there.
//!
//! A process's wait is a [Latch]: wakers decide everything under the
//! control lock, record the outcome in the scheduler state, and only set
//! latches once the lock is released.

use crate::{
    admission::{Control, ProcWait},
    caps::check_totals,
    latch::{Interrupt, Latch},
    memquota::{group_mem_expected, slot_mem_spill, Ledger},
    osgroup::OsGroupBackend,
    policy::{GroupSelectionPolicy, UserInfo},
    decode_group_info, encode_group_info, Error, GroupId, GroupStatus, LimitType, ProcId,
    ResGroupCaps, ResGroupConfig, SessionId, SlotId, ADMIN_GROUP, DEFAULT_GROUP,
};
use async_std::{
    sync::{Arc, Mutex},
    task,
};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info, instrument, trace, warn};

async fn wake(latches: Vec<Latch>) {
    for l in latches {
        l.set().await;
    }
}

#[derive(Clone)]
pub struct ResGroupRuntime {
    config: Arc<ResGroupConfig>,
    control: Arc<Mutex<Control>>,
    ledger: Arc<Ledger>,
    os: Arc<dyn OsGroupBackend>,
    policy: Arc<dyn GroupSelectionPolicy>,
    next_proc: Arc<AtomicU32>,
}

impl ResGroupRuntime {
    /// Builds a runtime with the two built-in groups, `default_group` and
    /// `admin_group`.
    pub fn new(
        config: ResGroupConfig,
        os: Arc<dyn OsGroupBackend>,
        policy: Arc<dyn GroupSelectionPolicy>,
    ) -> Result<Self, Error> {
        Self::with_groups(
            config,
            os,
            policy,
            &[
                (DEFAULT_GROUP, ResGroupCaps::default_group()),
                (ADMIN_GROUP, ResGroupCaps::admin_group()),
            ],
        )
    }

    /// Builds a runtime whose catalog holds exactly `groups`.
    pub fn with_groups(
        config: ResGroupConfig,
        os: Arc<dyn OsGroupBackend>,
        policy: Arc<dyn GroupSelectionPolicy>,
        groups: &[(GroupId, ResGroupCaps)],
    ) -> Result<Self, Error> {
        let total = config.total_chunks(os.total_memory());
        let ledger = Ledger::new(total, config.max_resource_groups, config.max_slots);
        let mut ctl = Control::new(&config);
        for (id, caps) in groups {
            install_group(&config, &*os, &ledger, &mut ctl, *id, *caps)?;
        }
        info!(
            "resource groups on {} backend: {} groups, {} slots, {} chunks",
            os.name(),
            groups.len(),
            config.max_slots,
            total
        );
        Ok(ResGroupRuntime {
            config: Arc::new(config),
            control: Arc::new(Mutex::new(ctl)),
            ledger: Arc::new(ledger),
            os,
            policy,
            next_proc: Arc::new(AtomicU32::new(1)),
        })
    }

    pub fn config(&self) -> &ResGroupConfig {
        &self.config
    }

    pub fn total_chunks(&self) -> i32 {
        self.ledger.pool().total_chunks()
    }

    pub fn free_chunks(&self) -> i32 {
        self.ledger.pool().free_chunks()
    }

    /// Chunks currently granted to groups. Together with
    /// [ResGroupRuntime::free_chunks] this always adds up to the total.
    pub async fn granted_chunks(&self) -> i32 {
        let ctl = self.control.lock().await;
        ctl.groups.iter().map(|g| self.ledger.granted(g)).sum()
    }

    pub async fn register_proc(&self, session: SessionId) -> ProcHandle {
        let id = ProcId(self.next_proc.fetch_add(1, Ordering::SeqCst));
        let latch = Latch::new();
        self.control
            .lock()
            .await
            .procs
            .insert(id, ProcWait::new(latch.clone()));
        trace!("registered {:?} for {:?}", id, session);
        ProcHandle {
            id,
            session,
            rt: self.clone(),
            latch,
            state: ProcState::default(),
            exited: false,
        }
    }

    #[instrument(skip(self))]
    pub async fn create_group(&self, id: GroupId, caps: ResGroupCaps) -> Result<(), Error> {
        let mut ctl = self.control.lock().await;
        install_group(&self.config, &*self.os, &self.ledger, &mut ctl, id, caps)
    }

    /// Undoes a `CREATE RESOURCE GROUP` whose transaction aborted.
    #[instrument(skip(self))]
    pub async fn create_on_abort(&self, id: GroupId) -> Result<(), Error> {
        let (latches, removed) = {
            let mut ctl = self.control.lock().await;
            let mut latches = ctl.wake_all(id);
            let removed = ctl.groups.remove(id, &self.ledger).is_some();
            latches.extend(ctl.wake_all_groups(&self.ledger));
            (latches, removed)
        };
        wake(latches).await;
        if removed {
            self.os.destroy_group(id)?;
        }
        Ok(())
    }

    /// First half of `DROP RESOURCE GROUP`: refuses while transactions run
    /// in the group, otherwise locks it so nothing new is admitted.
    #[instrument(skip(self))]
    pub async fn check_for_drop(&self, id: GroupId) -> Result<(), Error> {
        let mut ctl = self.control.lock().await;
        let g = ctl.groups.get_mut(id)?;
        if g.n_running > 0 {
            return Err(Error::GroupBusy {
                group: id,
                running: g.n_running + g.wait_queue.len() as u32,
            });
        }
        g.locked_for_drop = true;
        Ok(())
    }

    /// Second half of `DROP RESOURCE GROUP`, run when its transaction ends.
    /// Waiters are released either way; on commit they will find the group
    /// gone.
    #[instrument(skip(self))]
    pub async fn drop_finish(&self, id: GroupId, commit: bool) -> Result<(), Error> {
        let mut latches = Vec::new();
        let result = {
            let mut ctl = self.control.lock().await;
            drop_finish_locked(&self.ledger, &mut ctl, id, commit, &mut latches)
        };
        wake(latches).await;
        if result? {
            self.os.destroy_group(id)?;
            info!("dropped {:?}", id);
        }
        Ok(())
    }

    /// Applies a committed `ALTER RESOURCE GROUP ... SET <limit> <value>`.
    /// Slots already handed out keep the capabilities they were granted
    /// under.
    #[instrument(skip(self))]
    pub async fn alter_on_commit(
        &self,
        id: GroupId,
        limit: LimitType,
        value: i32,
    ) -> Result<(), Error> {
        let mut latches = Vec::new();
        let result = {
            let mut ctl = self.control.lock().await;
            alter_locked(
                &self.config,
                &self.ledger,
                &mut ctl,
                id,
                limit,
                value,
                &mut latches,
            )
        };
        wake(latches).await;
        let caps = result?;
        match limit {
            LimitType::CpuRateLimit => self.os.set_cpu_limit(id, caps.cpu_rate_limit),
            LimitType::MemoryLimit => self.os.set_memory_limit_bytes(
                id,
                self.config
                    .chunks_to_bytes(group_mem_expected(self.total_chunks(), &caps)),
            ),
            _ => Ok(()),
        }
    }

    pub async fn group_status(&self, id: GroupId) -> Result<GroupStatus, Error> {
        self.control.lock().await.groups.status(id, &self.ledger)
    }

    pub async fn group_ids(&self) -> Vec<GroupId> {
        let ctl = self.control.lock().await;
        let mut ids: Vec<GroupId> = ctl.groups.iter().map(|g| g.id).collect();
        ids.sort();
        ids
    }

    /// The segment-side slot `session` currently shares, if any.
    pub async fn session_slot(&self, session: SessionId) -> Option<SlotId> {
        self.control
            .lock()
            .await
            .session_slots
            .get(&session)
            .copied()
    }

    /// Delivers a cancel or termination request to a process, waking it if
    /// it is waiting for a slot.
    pub async fn interrupt(&self, proc: ProcId, why: Interrupt) -> Result<(), Error> {
        let latch = {
            let ctl = self.control.lock().await;
            ctl.procs
                .get(&proc)
                .map(|w| w.latch.clone())
                .ok_or_else(|| Error::InvariantViolation(format!("{:?} is not registered", proc)))?
        };
        debug!("interrupting {:?}: {:?}", proc, why);
        latch.interrupt(why).await;
        Ok(())
    }

    async fn wait_cancel(&self, proc: ProcId) {
        let latches = {
            let mut ctl = self.control.lock().await;
            ctl.wait_cancel(proc, &self.ledger)
        };
        wake(latches).await;
    }

    async fn cleanup(&self, proc: ProcId, session: SessionId, mut state: ProcState) {
        let latches = {
            let mut ctl = self.control.lock().await;
            let mut latches = ctl.wait_cancel(proc, &self.ledger);
            latches.extend(state.detach(&mut ctl, &self.ledger, session));
            if let Some(slot) = state.held.take() {
                if let Err(e) = ctl.put_slot(slot, &self.ledger) {
                    warn!("{:?} exiting with {:?}: {}", proc, slot, e);
                }
                latches.extend(ctl.wake_all_groups(&self.ledger));
            }
            ctl.procs.remove(&proc);
            latches
        };
        wake(latches).await;
        trace!("{:?} exited", proc);
    }
}

fn install_group(
    config: &ResGroupConfig,
    os: &dyn OsGroupBackend,
    ledger: &Ledger,
    ctl: &mut Control,
    id: GroupId,
    caps: ResGroupCaps,
) -> Result<(), Error> {
    caps.validate(config.max_connections)?;
    check_totals(
        ctl.groups
            .iter()
            .map(|g| &g.caps)
            .chain(std::iter::once(&caps)),
    )?;
    let g = ctl.groups.insert(id, caps, ledger)?;
    let got = ledger.auto_reserve(g);
    let bytes = config.chunks_to_bytes(group_mem_expected(ledger.pool().total_chunks(), &caps));
    let os_result = os
        .create_group(id)
        .and_then(|_| os.set_cpu_limit(id, caps.cpu_rate_limit))
        .and_then(|_| os.set_memory_limit_bytes(id, bytes));
    if let Err(e) = os_result {
        ctl.groups.remove(id, ledger);
        return Err(e);
    }
    debug!("created {:?} with {} chunks: {:?}", id, got, caps);
    Ok(())
}

fn drop_finish_locked(
    ledger: &Ledger,
    ctl: &mut Control,
    id: GroupId,
    commit: bool,
    latches: &mut Vec<Latch>,
) -> Result<bool, Error> {
    latches.extend(ctl.wake_all(id));
    if !commit {
        if let Some(g) = ctl.groups.find_mut(id) {
            g.locked_for_drop = false;
        }
        return Ok(false);
    }
    // Session slots still attached to are freed by their last process.
    for slot in ctl.slots.of_group(id) {
        let data = ctl.slots.get(slot);
        if data.session_owned && ledger.slot(slot).n_procs() == 0 {
            if let Some(session) = data.session {
                latches.extend(ctl.free_session_slot(session, slot, ledger)?);
            }
        }
    }
    let removed = ctl.groups.remove(id, ledger).is_some();
    latches.extend(ctl.wake_all_groups(ledger));
    Ok(removed)
}

fn alter_locked(
    config: &ResGroupConfig,
    ledger: &Ledger,
    ctl: &mut Control,
    id: GroupId,
    limit: LimitType,
    value: i32,
    latches: &mut Vec<Latch>,
) -> Result<ResGroupCaps, Error> {
    let mut caps = ctl.groups.get(id)?.caps;
    caps.set(limit, value);
    caps.validate(config.max_connections)?;
    let altered = &caps;
    check_totals(
        ctl.groups
            .iter()
            .map(move |g| if g.id == id { altered } else { &g.caps }),
    )?;
    let g = ctl.groups.get_mut(id)?;
    g.caps = caps;
    ledger.auto_release(g);
    ledger.auto_reserve(g);
    debug!("{:?} now {:?}", id, caps);
    latches.extend(ctl.wake_up_waiters(id, ledger));
    latches.extend(ctl.wake_all_groups(ledger));
    Ok(caps)
}

#[derive(Clone, Copy, Debug)]
struct Attachment {
    group: GroupId,
    idx: usize,
    slot: SlotId,
}

/// What a process knows about its own group membership and memory.
#[derive(Default)]
struct ProcState {
    attached: Option<Attachment>,

    /// A slot taken through admission, until released.
    held: Option<SlotId>,

    caps: ResGroupCaps,
    mem_usage: i32,
    do_mem_check: bool,
    waiver_used: bool,
}

impl ProcState {
    fn attach(
        &mut self,
        ctl: &Control,
        ledger: &Ledger,
        group: GroupId,
        slot: SlotId,
    ) -> Result<(), Error> {
        let idx = ctl.groups.get(group)?.idx;
        ledger.slot(slot).inc_procs();
        if self.mem_usage > 0 {
            ledger.inc_usage(idx, slot, self.mem_usage);
        }
        self.caps = ctl.slots.get(slot).caps;
        self.attached = Some(Attachment { group, idx, slot });
        self.do_mem_check = true;
        Ok(())
    }

    fn detach(&mut self, ctl: &mut Control, ledger: &Ledger, session: SessionId) -> Vec<Latch> {
        let a = match self.attached.take() {
            Some(a) => a,
            None => return Vec::new(),
        };
        if self.do_mem_check && self.mem_usage > 0 && ledger.group(a.idx).group_id() == a.group {
            ledger.dec_usage(a.idx, a.slot, self.mem_usage);
        }
        self.do_mem_check = false;
        let remaining = ledger.slot(a.slot).dec_procs();
        let data = ctl.slots.get(a.slot);
        if remaining > 0 || !data.in_use || !data.session_owned {
            return Vec::new();
        }
        match ctl.free_session_slot(session, a.slot, ledger) {
            Ok(latches) => latches,
            Err(e) => {
                warn!("freeing session {:?}: {}", a.slot, e);
                Vec::new()
            }
        }
    }

    fn switch(
        &mut self,
        ctl: &mut Control,
        ledger: &Ledger,
        session: SessionId,
        group: GroupId,
        caps: ResGroupCaps,
        latches: &mut Vec<Latch>,
    ) -> Result<bool, Error> {
        if !group.is_valid() {
            latches.extend(self.detach(ctl, ledger, session));
            return Ok(false);
        }
        let current = ctl
            .session_slots
            .get(&session)
            .copied()
            .filter(|s| ctl.slots.get(*s).group == group);
        let slot = match current {
            Some(slot) => slot,
            None => ctl.alloc_session_slot(session, group, caps, ledger)?,
        };
        if self.attached.map(|a| a.slot) != Some(slot) {
            latches.extend(self.detach(ctl, ledger, session));
            self.attach(ctl, ledger, group, slot)?;
        }
        Ok(true)
    }
}

/// Proof of holding an admission slot. Give it back with
/// [ProcHandle::release_slot].
#[derive(Debug, PartialEq, Eq)]
pub struct SlotHandle {
    group: GroupId,
    slot: SlotId,
}

impl SlotHandle {
    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }
}

// Cancels an in-progress wait if the waiting future is dropped.
struct CancelGuard {
    rt: Option<ResGroupRuntime>,
    proc: ProcId,
}

impl CancelGuard {
    fn disarm(&mut self) {
        self.rt = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(rt) = self.rt.take() {
            let proc = self.proc;
            task::spawn(async move { rt.wait_cancel(proc).await });
        }
    }
}

pub struct ProcHandle {
    id: ProcId,
    session: SessionId,
    rt: ResGroupRuntime,
    latch: Latch,
    state: ProcState,
    exited: bool,
}

impl ProcHandle {
    pub fn id(&self) -> ProcId {
        self.id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The group the process is attached to, or the invalid group.
    pub fn group(&self) -> GroupId {
        self.state
            .attached
            .map_or(GroupId::INVALID, |a| a.group)
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.state.attached.map(|a| a.slot)
    }

    pub fn caps(&self) -> ResGroupCaps {
        self.state.caps
    }

    pub fn mem_usage(&self) -> i32 {
        self.state.mem_usage
    }

    /// Whether a reservation ever succeeded only thanks to its overuse
    /// allowance.
    pub fn waiver_used(&self) -> bool {
        self.state.waiver_used
    }

    /// Admits the process's transaction into the group its user maps to,
    /// waiting in line if the group is full.
    #[instrument(skip(self))]
    pub async fn acquire_slot(&mut self, user: &UserInfo) -> Result<SlotHandle, Error> {
        if self.state.held.is_some() {
            return Err(Error::InvariantViolation(format!(
                "{:?} already holds a slot",
                self.id
            )));
        }
        let group = self.rt.policy.select_group(user);
        let mut retried = false;
        let slot = loop {
            let admitted = {
                let mut ctl = self.rt.control.lock().await;
                ctl.try_admit(self.id, group, &self.rt.ledger, retried)?
            };
            if let Some(slot) = admitted {
                break slot;
            }
            debug!("waiting for a slot in {:?}", group);
            match self.wait_for_slot().await? {
                Some(slot) => break slot,
                None => retried = true,
            }
        };
        self.state.held = Some(slot);

        let rt = self.rt.clone();
        {
            let mut ctl = rt.control.lock().await;
            self.state.attach(&ctl, &rt.ledger, group, slot)?;
            ctl.slots.get_mut(slot).session = Some(self.session);
        }
        let handle = SlotHandle { group, slot };
        if let Err(e) = rt.os.assign_process(group, self.id) {
            self.release_slot(handle).await?;
            return Err(e);
        }
        debug!("admitted into {:?} on {:?}", group, slot);
        Ok(handle)
    }

    async fn wait_for_slot(&self) -> Result<Option<SlotId>, Error> {
        let mut guard = CancelGuard {
            rt: Some(self.rt.clone()),
            proc: self.id,
        };
        loop {
            self.latch.reset().await;
            if let Err(e) = self.latch.check_for_interrupts().await {
                guard.disarm();
                self.rt.wait_cancel(self.id).await;
                return Err(e);
            }
            {
                let mut ctl = self.rt.control.lock().await;
                if !ctl.is_waiting(self.id) {
                    guard.disarm();
                    return Ok(ctl.claim_grant(self.id));
                }
            }
            self.latch.wait().await;
        }
    }

    #[instrument(skip(self))]
    pub async fn release_slot(&mut self, handle: SlotHandle) -> Result<(), Error> {
        if self.state.held != Some(handle.slot) {
            return Err(Error::InvariantViolation(format!(
                "{:?} does not hold {:?}",
                self.id, handle.slot
            )));
        }
        let rt = self.rt.clone();
        let (latches, result) = {
            let mut ctl = rt.control.lock().await;
            let mut latches = self.state.detach(&mut ctl, &rt.ledger, self.session);
            self.state.held = None;
            let result = ctl.put_slot(handle.slot, &rt.ledger);
            latches.extend(ctl.wake_up_waiters(handle.group, &rt.ledger));
            latches.extend(ctl.wake_all_groups(&rt.ledger));
            (latches, result)
        };
        wake(latches).await;
        result
    }

    /// Joins, changes or leaves a group on a segment according to the
    /// payload the coordinator dispatched.
    #[instrument(skip(self, buf))]
    pub async fn switch_on_segment(&mut self, buf: &[u8]) -> Result<(), Error> {
        let (group, caps) = decode_group_info(buf)?;
        let rt = self.rt.clone();
        let mut latches = Vec::new();
        let result = {
            let mut ctl = rt.control.lock().await;
            self.state
                .switch(&mut ctl, &rt.ledger, self.session, group, caps, &mut latches)
        };
        wake(latches).await;
        if result? {
            rt.os.assign_process(group, self.id)?;
            trace!("switched to {:?} on {:?}", group, self.slot());
        }
        Ok(())
    }

    /// The payload to dispatch to segments for the current transaction.
    pub fn serialize_group_info(&self) -> Vec<u8> {
        match self.state.attached {
            Some(a) => encode_group_info(a.group, &self.state.caps),
            None => encode_group_info(GroupId::INVALID, &ResGroupCaps::default()),
        }
    }

    /// Bytes one query of this process may use before spilling.
    pub fn query_memory_limit(&self) -> u64 {
        match self.state.attached {
            None => 0,
            Some(_) => {
                let chunks = slot_mem_spill(self.rt.total_chunks(), &self.state.caps);
                self.rt.config.chunks_to_bytes(chunks)
            }
        }
    }

    /// Charges `chunks` to the process. Returns false only when the group's
    /// shared area would be overused by more than `overuse_chunks` and the
    /// allocation is not critical; nothing is charged then. A negative
    /// `chunks` is refused outright.
    pub fn reserve_memory(&mut self, chunks: i32, overuse_chunks: i32, critical: bool) -> bool {
        if chunks < 0 {
            error!("{:?}: refusing to reserve {} memory chunks", self.id, chunks);
            return false;
        }
        self.state.mem_usage += chunks;
        let a = match self.state.attached {
            Some(a) if self.state.do_mem_check => a,
            _ => return true,
        };
        let ledger = &self.rt.ledger;
        if ledger.group(a.idx).group_id() != a.group {
            // Dropped under us; stop checking.
            self.state.do_mem_check = false;
            return true;
        }
        let overuse = ledger.inc_usage(a.idx, a.slot, chunks);
        if overuse > 0 {
            if !critical && overuse > overuse_chunks {
                ledger.dec_usage(a.idx, a.slot, chunks);
                self.state.mem_usage -= chunks;
                if overuse_chunks == 0 {
                    self.dump_memory_info();
                }
                return false;
            }
            self.state.waiver_used = true;
        }
        true
    }

    pub fn release_memory(&mut self, chunks: i32) {
        if chunks < 0 {
            error!("{:?}: ignoring release of {} memory chunks", self.id, chunks);
            return;
        }
        self.state.mem_usage -= chunks;
        let a = match self.state.attached {
            Some(a) if self.state.do_mem_check => a,
            _ => return,
        };
        let ledger = &self.rt.ledger;
        if ledger.group(a.idx).group_id() != a.group {
            self.state.do_mem_check = false;
            return;
        }
        ledger.dec_usage(a.idx, a.slot, chunks);
    }

    pub fn dump_memory_info(&self) -> String {
        let ledger = &self.rt.ledger;
        let mut out = format!("{:?}: usage={}", self.id, self.state.mem_usage);
        if let Some(a) = self.state.attached {
            let s = ledger.slot(a.slot);
            let g = ledger.group(a.idx);
            out.push_str(&format!(
                "; {:?}: quota={} usage={} procs={}; {:?}: usage={} shared_usage={} shared_granted={}",
                a.slot,
                s.mem_quota(),
                s.mem_usage(),
                s.n_procs(),
                a.group,
                g.mem_usage(),
                g.mem_shared_usage(),
                g.mem_shared_granted()
            ));
        }
        out.push_str(&format!(
            "; pool: free={} total={}",
            ledger.pool().free_chunks(),
            ledger.pool().total_chunks()
        ));
        info!("{}", out);
        out
    }

    /// Unregisters the process, giving back anything it still holds.
    pub async fn exit(mut self) {
        self.exited = true;
        let state = std::mem::take(&mut self.state);
        self.rt.cleanup(self.id, self.session, state).await;
    }
}

impl Drop for ProcHandle {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        let state = std::mem::take(&mut self.state);
        let (rt, id, session) = (self.rt.clone(), self.id, self.session);
        task::spawn(async move { rt.cleanup(id, session, state).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NullOsGroup, RolePolicy};
    use std::time::Duration;

    const ETL: GroupId = GroupId(9000);

    fn caps(concurrency: i32, memory_limit: i32, shared: i32) -> ResGroupCaps {
        ResGroupCaps {
            concurrency,
            cpu_rate_limit: 10,
            memory_limit,
            memory_shared_quota: shared,
            memory_spill_ratio: 20,
            memory_auditor: 0,
        }
    }

    fn config() -> ResGroupConfig {
        ResGroupConfig {
            max_resource_groups: 8,
            max_slots: 16,
            memory_limit: 1.0,
            ..Default::default()
        }
    }

    // 1000 one-MiB chunks.
    fn runtime(groups: &[(GroupId, ResGroupCaps)]) -> (ResGroupRuntime, Arc<NullOsGroup>) {
        let os = Arc::new(NullOsGroup::new(1000 << 20, 4));
        let policy = RolePolicy::new().with_role("etl", ETL);
        let rt = ResGroupRuntime::with_groups(config(), os.clone(), Arc::new(policy), groups)
            .unwrap();
        (rt, os)
    }

    async fn wait_for_queue(rt: &ResGroupRuntime, group: GroupId, n: usize) {
        for _ in 0..500 {
            if rt.group_status(group).await.unwrap().n_queueing == n {
                return;
            }
            task::sleep(Duration::from_millis(2)).await;
        }
        panic!("{:?} never had {} waiters", group, n);
    }

    #[test]
    fn waiters_are_admitted_in_arrival_order() {
        let _ = tracing_subscriber::fmt::try_init();
        task::block_on(async {
            let (rt, _os) = runtime(&[(ETL, caps(1, 20, 50))]);
            let user = UserInfo::new("etl");
            let mut a = rt.register_proc(SessionId(1)).await;
            let held = a.acquire_slot(&user).await.unwrap();
            assert_eq!(held.group(), ETL);

            let order = Arc::new(Mutex::new(Vec::new()));
            let mut tasks = Vec::new();
            for (i, name) in ["b", "c"].iter().enumerate() {
                let mut p = rt.register_proc(SessionId(2 + i as u32)).await;
                let (order, user, name) = (order.clone(), user.clone(), *name);
                tasks.push(task::spawn(async move {
                    let h = p.acquire_slot(&user).await.unwrap();
                    order.lock().await.push(name);
                    task::sleep(Duration::from_millis(5)).await;
                    p.release_slot(h).await.unwrap();
                    p.exit().await;
                }));
                wait_for_queue(&rt, ETL, i + 1).await;
            }
            a.release_slot(held).await.unwrap();
            for t in tasks {
                t.await;
            }
            assert_eq!(*order.lock().await, vec!["b", "c"]);
            let st = rt.group_status(ETL).await.unwrap();
            assert_eq!(st.total_executed, 3);
            assert_eq!(st.total_queued, 2);
            assert_eq!(st.n_running, 0);
            a.exit().await;
        });
    }

    #[test]
    fn dropping_a_group_fails_its_waiters() {
        let _ = tracing_subscriber::fmt::try_init();
        task::block_on(async {
            // Concurrency zero: everyone queues.
            let (rt, os) = runtime(&[(ETL, caps(0, 10, 50))]);
            let mut p = rt.register_proc(SessionId(1)).await;
            let t = task::spawn(async move {
                let r = p.acquire_slot(&UserInfo::new("etl")).await;
                p.exit().await;
                r
            });
            wait_for_queue(&rt, ETL, 1).await;
            rt.check_for_drop(ETL).await.unwrap();
            rt.drop_finish(ETL, true).await.unwrap();
            assert_eq!(t.await.err(), Some(Error::GroupConcurrentlyDropped(ETL)));
            assert!(os.limits(ETL).is_none());
            assert_eq!(rt.free_chunks(), rt.total_chunks());
            assert_eq!(
                rt.group_status(ETL).await.err(),
                Some(Error::GroupNotFound(ETL))
            );
        });
    }

    #[test]
    fn busy_group_cannot_be_dropped() {
        task::block_on(async {
            let (rt, _os) = runtime(&[(ETL, caps(1, 10, 50))]);
            let user = UserInfo::new("etl");
            let mut a = rt.register_proc(SessionId(1)).await;
            let h = a.acquire_slot(&user).await.unwrap();
            assert_eq!(
                rt.check_for_drop(ETL).await,
                Err(Error::GroupBusy {
                    group: ETL,
                    running: 1
                })
            );
            a.release_slot(h).await.unwrap();

            rt.check_for_drop(ETL).await.unwrap();
            assert!(rt.group_status(ETL).await.unwrap().locked_for_drop);
            rt.drop_finish(ETL, false).await.unwrap();
            assert!(!rt.group_status(ETL).await.unwrap().locked_for_drop);
            let h = a.acquire_slot(&user).await.unwrap();
            a.release_slot(h).await.unwrap();
            a.exit().await;
        });
    }

    #[test]
    fn reservation_beyond_shared_area_is_refused() {
        let _ = tracing_subscriber::fmt::try_init();
        task::block_on(async {
            // 100 chunks: one slot quota of 50 and 50 shared.
            let (rt, _os) = runtime(&[(ETL, caps(1, 10, 50))]);
            let mut p = rt.register_proc(SessionId(1)).await;
            let h = p.acquire_slot(&UserInfo::new("etl")).await.unwrap();
            assert!(p.reserve_memory(50, 0, false));
            assert!(p.reserve_memory(50, 0, false));
            let before = rt.group_status(ETL).await.unwrap();
            assert_eq!(before.mem_shared_usage, 50);
            assert_eq!(before.mem_shared_granted, 50);

            assert!(!p.reserve_memory(1, 0, false));
            assert_eq!(rt.group_status(ETL).await.unwrap(), before);
            assert_eq!(p.mem_usage(), 100);
            assert!(!p.waiver_used());

            assert!(p.reserve_memory(3, 5, false));
            assert!(p.waiver_used());
            assert!(p.reserve_memory(10, 0, true));
            p.release_memory(113);

            // Negative amounts would charge the ledger backwards.
            assert!(!p.reserve_memory(-5, 0, true));
            p.release_memory(-5);
            assert_eq!(p.mem_usage(), 0);
            let after = rt.group_status(ETL).await.unwrap();
            assert_eq!(after.mem_usage, 0);
            assert_eq!(after.mem_shared_usage, 0);

            assert_eq!(p.query_memory_limit(), 20 << 20);
            assert_eq!(
                rt.granted_chunks().await + rt.free_chunks(),
                rt.total_chunks()
            );
            p.release_slot(h).await.unwrap();
            p.exit().await;
        });
    }

    #[test]
    fn cancelled_waits_leave_no_trace() {
        let _ = tracing_subscriber::fmt::try_init();
        task::block_on(async {
            let (rt, _os) = runtime(&[(ETL, caps(1, 10, 50))]);
            let user = UserInfo::new("etl");
            let mut a = rt.register_proc(SessionId(1)).await;
            let held = a.acquire_slot(&user).await.unwrap();

            // A waiter whose future is dropped.
            let mut b = rt.register_proc(SessionId(2)).await;
            let b_id = b.id();
            let r = async_std::future::timeout(Duration::from_millis(20), b.acquire_slot(&user))
                .await;
            assert!(r.is_err());
            wait_for_queue(&rt, ETL, 0).await;

            // A waiter that is interrupted.
            let t = task::spawn(async move {
                let r = b.acquire_slot(&UserInfo::new("etl")).await;
                (b, r)
            });
            wait_for_queue(&rt, ETL, 1).await;
            rt.interrupt(b_id, Interrupt::QueryCancel).await.unwrap();
            let (b, r) = t.await;
            assert_eq!(r.err(), Some(Error::Interrupted(Interrupt::QueryCancel)));

            let st = rt.group_status(ETL).await.unwrap();
            assert_eq!(st.n_queueing, 0);
            assert_eq!(st.n_running, 1);
            a.release_slot(held).await.unwrap();
            assert_eq!(rt.group_status(ETL).await.unwrap().n_running, 0);
            b.exit().await;
            a.exit().await;
        });
    }

    #[test]
    fn altering_concurrency_admits_waiters() {
        task::block_on(async {
            let (rt, os) = runtime(&[(ETL, caps(1, 10, 50))]);
            let user = UserInfo::new("etl");
            let mut a = rt.register_proc(SessionId(1)).await;
            let held = a.acquire_slot(&user).await.unwrap();
            let mut b = rt.register_proc(SessionId(2)).await;
            let t = task::spawn(async move {
                let h = b.acquire_slot(&UserInfo::new("etl")).await.unwrap();
                b.release_slot(h).await.unwrap();
                b.exit().await;
            });
            wait_for_queue(&rt, ETL, 1).await;
            rt.alter_on_commit(ETL, LimitType::Concurrency, 2)
                .await
                .unwrap();
            t.await;

            assert!(rt
                .alter_on_commit(ETL, LimitType::MemoryLimit, 101)
                .await
                .is_err());
            rt.alter_on_commit(ETL, LimitType::CpuRateLimit, 20)
                .await
                .unwrap();
            assert_eq!(os.limits(ETL).unwrap().cpu_percent, 20);
            assert_eq!(rt.group_status(ETL).await.unwrap().caps.concurrency, 2);
            a.release_slot(held).await.unwrap();
            a.exit().await;
        });
    }

    #[test]
    fn session_processes_share_a_segment_slot() {
        let _ = tracing_subscriber::fmt::try_init();
        task::block_on(async {
            let os = Arc::new(NullOsGroup::new(1000 << 20, 4));
            let rt = ResGroupRuntime::new(config(), os.clone(), Arc::new(RolePolicy::new()))
                .unwrap();
            assert_eq!(rt.group_ids().await, vec![DEFAULT_GROUP, ADMIN_GROUP]);
            let buf = encode_group_info(DEFAULT_GROUP, &ResGroupCaps::default_group());
            let mut p1 = rt.register_proc(SessionId(7)).await;
            let mut p2 = rt.register_proc(SessionId(7)).await;
            let mut p3 = rt.register_proc(SessionId(8)).await;
            p1.switch_on_segment(&buf).await.unwrap();
            p2.switch_on_segment(&buf).await.unwrap();
            p3.switch_on_segment(&buf).await.unwrap();
            assert!(p1.slot().is_some());
            assert_eq!(p1.slot(), p2.slot());
            assert!(p3.slot() != p1.slot());
            assert_eq!(p1.serialize_group_info(), buf);
            assert!(os
                .limits(DEFAULT_GROUP)
                .unwrap()
                .processes
                .contains(&p2.id()));

            // Session slots are not admissions.
            let st = rt.group_status(DEFAULT_GROUP).await.unwrap();
            assert_eq!(st.n_running, 0);
            assert_eq!(st.mem_quota_used, 14);

            let none = encode_group_info(GroupId::INVALID, &ResGroupCaps::default());
            p1.switch_on_segment(&none).await.unwrap();
            assert_eq!(p1.slot(), None);
            assert_eq!(p1.group(), GroupId::INVALID);
            assert_eq!(rt.session_slot(SessionId(7)).await, p2.slot());
            p2.switch_on_segment(&none).await.unwrap();
            assert_eq!(rt.session_slot(SessionId(7)).await, None);
            assert_eq!(
                rt.group_status(DEFAULT_GROUP).await.unwrap().mem_quota_used,
                7
            );

            assert!(matches!(
                p1.switch_on_segment(&buf[..10]).await,
                Err(Error::Wire(_))
            ));
            p1.exit().await;
            p2.exit().await;
            p3.exit().await;
            assert_eq!(rt.session_slot(SessionId(8)).await, None);
        });
    }

    #[test]
    fn creation_rolled_back_returns_everything() {
        task::block_on(async {
            let (rt, os) = runtime(&[]);
            rt.create_group(ETL, caps(2, 20, 50)).await.unwrap();
            assert_eq!(rt.group_ids().await, vec![ETL]);
            assert_eq!(os.limits(ETL).unwrap().cpu_percent, 10);
            assert!(rt.free_chunks() < rt.total_chunks());

            rt.create_on_abort(ETL).await.unwrap();
            assert!(rt.group_ids().await.is_empty());
            assert!(os.limits(ETL).is_none());
            assert_eq!(rt.free_chunks(), rt.total_chunks());
        });
    }

    #[test]
    fn query_memory_limit_is_the_slot_spill() {
        task::block_on(async {
            let (rt, _os) = runtime(&[(ETL, caps(2, 20, 50))]);
            let mut p = rt.register_proc(SessionId(1)).await;
            assert_eq!(p.query_memory_limit(), 0);
            let h = p.acquire_slot(&UserInfo::new("etl")).await.unwrap();
            // 1000 * 20% = 200 chunks for the group, 20% of that split over
            // two slots.
            assert_eq!(p.query_memory_limit(), 20 << 20);
            p.release_slot(h).await.unwrap();
            assert_eq!(p.query_memory_limit(), 0);
            p.exit().await;
        });
    }
}
