// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Resource group capabilities and the fixed-width form in which the
//! coordinator ships a transaction's group to the segments.
//!
//! The wire payload is seven network-order 32-bit fields: the group id,
//! then every capability in [LimitType] order. A payload for the invalid
//! group carries all-zero capabilities and tells the segment to detach.

use crate::{Error, GroupId};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    Concurrency,
    CpuRateLimit,
    MemoryLimit,
    MemorySharedQuota,
    MemorySpillRatio,
    MemoryAuditor,
}

impl LimitType {
    pub const ALL: [LimitType; 6] = [
        LimitType::Concurrency,
        LimitType::CpuRateLimit,
        LimitType::MemoryLimit,
        LimitType::MemorySharedQuota,
        LimitType::MemorySpillRatio,
        LimitType::MemoryAuditor,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LimitType::Concurrency => "concurrency",
            LimitType::CpuRateLimit => "cpu_rate_limit",
            LimitType::MemoryLimit => "memory_limit",
            LimitType::MemorySharedQuota => "memory_shared_quota",
            LimitType::MemorySpillRatio => "memory_spill_ratio",
            LimitType::MemoryAuditor => "memory_auditor",
        }
    }

    fn range(&self, max_connections: i32) -> (i32, i32) {
        match self {
            LimitType::Concurrency => (0, max_connections),
            LimitType::CpuRateLimit => (1, 100),
            LimitType::MemoryLimit => (1, 100),
            LimitType::MemorySharedQuota => (0, 100),
            LimitType::MemorySpillRatio => (0, 100),
            LimitType::MemoryAuditor => (0, 1),
        }
    }
}

/// All percentages are whole numbers in `0..=100`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResGroupCaps {
    pub concurrency: i32,
    pub cpu_rate_limit: i32,
    pub memory_limit: i32,
    pub memory_shared_quota: i32,
    pub memory_spill_ratio: i32,
    pub memory_auditor: i32,
}

impl ResGroupCaps {
    pub fn default_group() -> Self {
        ResGroupCaps {
            concurrency: 20,
            cpu_rate_limit: 30,
            memory_limit: 30,
            memory_shared_quota: 50,
            memory_spill_ratio: 20,
            memory_auditor: 0,
        }
    }

    pub fn admin_group() -> Self {
        ResGroupCaps {
            concurrency: 10,
            cpu_rate_limit: 10,
            memory_limit: 10,
            memory_shared_quota: 50,
            memory_spill_ratio: 20,
            memory_auditor: 0,
        }
    }

    pub fn get(&self, limit: LimitType) -> i32 {
        match limit {
            LimitType::Concurrency => self.concurrency,
            LimitType::CpuRateLimit => self.cpu_rate_limit,
            LimitType::MemoryLimit => self.memory_limit,
            LimitType::MemorySharedQuota => self.memory_shared_quota,
            LimitType::MemorySpillRatio => self.memory_spill_ratio,
            LimitType::MemoryAuditor => self.memory_auditor,
        }
    }

    pub fn set(&mut self, limit: LimitType, value: i32) {
        let field = match limit {
            LimitType::Concurrency => &mut self.concurrency,
            LimitType::CpuRateLimit => &mut self.cpu_rate_limit,
            LimitType::MemoryLimit => &mut self.memory_limit,
            LimitType::MemorySharedQuota => &mut self.memory_shared_quota,
            LimitType::MemorySpillRatio => &mut self.memory_spill_ratio,
            LimitType::MemoryAuditor => &mut self.memory_auditor,
        };
        *field = value;
    }

    /// Checks every capability against its own range.
    pub fn validate(&self, max_connections: i32) -> Result<(), Error> {
        for limit in LimitType::ALL.iter() {
            let (lo, hi) = limit.range(max_connections);
            let v = self.get(*limit);
            if v < lo || v > hi {
                return Err(Error::InvalidCapability(format!(
                    "{} range is [{}, {}], got {}",
                    limit.name(),
                    lo,
                    hi,
                    v
                )));
            }
        }
        Ok(())
    }
}

/// Checks that the groups together ask for at most all of the CPU and all of
/// the memory.
pub(crate) fn check_totals<'a, I>(caps: I) -> Result<(), Error>
where
    I: IntoIterator<Item = &'a ResGroupCaps>,
{
    let (mut cpu, mut mem) = (0i64, 0i64);
    for c in caps {
        cpu += c.cpu_rate_limit as i64;
        mem += c.memory_limit as i64;
    }
    if cpu > 100 {
        return Err(Error::InvalidCapability(format!(
            "total cpu_rate_limit exceeded the limit of 100, got {}",
            cpu
        )));
    }
    if mem > 100 {
        return Err(Error::InvalidCapability(format!(
            "total memory_limit exceeded the limit of 100, got {}",
            mem
        )));
    }
    Ok(())
}

pub const GROUP_INFO_LEN: usize = 4 * (1 + LimitType::ALL.len());

pub fn encode_group_info(group: GroupId, caps: &ResGroupCaps) -> Vec<u8> {
    let mut buf = vec![0u8; GROUP_INFO_LEN];
    BigEndian::write_u32(&mut buf[0..4], group.0);
    if group.is_valid() {
        for (i, limit) in LimitType::ALL.iter().enumerate() {
            let off = 4 * (i + 1);
            BigEndian::write_i32(&mut buf[off..off + 4], caps.get(*limit));
        }
    }
    buf
}

pub fn decode_group_info(buf: &[u8]) -> Result<(GroupId, ResGroupCaps), Error> {
    if buf.len() != GROUP_INFO_LEN {
        return Err(Error::Wire(format!(
            "expected {} bytes of group info, got {}",
            GROUP_INFO_LEN,
            buf.len()
        )));
    }
    let group = GroupId(BigEndian::read_u32(&buf[0..4]));
    let mut caps = ResGroupCaps::default();
    for (i, limit) in LimitType::ALL.iter().enumerate() {
        let off = 4 * (i + 1);
        caps.set(*limit, BigEndian::read_i32(&buf[off..off + 4]));
    }
    Ok((group, caps))
}
