// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Whether the coordinator is dispatching to segments or running alone in
/// utility (maintenance) mode. In utility mode no segments are reachable, so
/// crash recovery is deferred and redo of commit records is buffered in the
/// redo file instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Dispatch,
    Utility,
}

impl Default for Role {
    fn default() -> Self {
        Role::Dispatch
    }
}

/// Settings of the distributed transaction manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtmConfig {
    /// Number of times phase two is re-broadcast after the first
    /// `COMMIT PREPARED` or `ABORT PREPARED` fails.
    pub phase2_retry_count: usize,

    /// Capacity of the committed-but-not-forgotten set.
    pub max_tm_gxacts: usize,

    pub role: Role,

    /// Where utility mode buffers committed/forget redo. `None` disables the
    /// redo file, which is only acceptable when the role is never utility.
    pub redo_path: Option<PathBuf>,
}

impl Default for DtmConfig {
    fn default() -> Self {
        DtmConfig {
            phase2_retry_count: 10,
            max_tm_gxacts: 250,
            role: Role::Dispatch,
            redo_path: None,
        }
    }
}

/// Settings of the resource-group runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResGroupConfig {
    /// Number of entries in the group table.
    pub max_resource_groups: usize,

    /// Number of slots shared by all groups.
    pub max_slots: usize,

    /// Fraction of system memory given to all resource groups.
    pub memory_limit: f64,

    /// Number of primary segments sharing this host's memory.
    pub segments_on_host: u32,

    /// A memory chunk is `1 << chunk_size_in_bits` bytes.
    pub chunk_size_in_bits: u32,

    /// Upper bound of a group's `concurrency` capability.
    pub max_connections: i32,
}

impl Default for ResGroupConfig {
    fn default() -> Self {
        ResGroupConfig {
            max_resource_groups: 100,
            max_slots: 300,
            memory_limit: 0.7,
            segments_on_host: 1,
            chunk_size_in_bits: 20,
            max_connections: 250,
        }
    }
}

impl ResGroupConfig {
    /// Chunks available to this segment's memory pool for a host with
    /// `total_memory` bytes.
    pub fn total_chunks(&self, total_memory: u64) -> i32 {
        let segments = self.segments_on_host.max(1) as f64;
        let bytes = (total_memory as f64 * self.memory_limit / segments) as u64;
        let chunks = bytes >> self.chunk_size_in_bits;
        chunks.min(i32::MAX as u64) as i32
    }

    pub fn chunks_to_bytes(&self, chunks: i32) -> u64 {
        (chunks.max(0) as u64) << self.chunk_size_in_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_chunks_from_host_memory() {
        let cfg = ResGroupConfig {
            memory_limit: 0.5,
            segments_on_host: 2,
            ..Default::default()
        };
        // 8 GiB * 0.5 / 2 = 2 GiB = 2048 one-MiB chunks
        assert_eq!(cfg.total_chunks(8 << 30), 2048);
        assert_eq!(cfg.chunks_to_bytes(3), 3 << 20);
        assert_eq!(cfg.chunks_to_bytes(-1), 0);
    }
}
