// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Gids are the cluster-wide names of distributed transactions.
///
/// They have a few properties worth knowing about:
///
///   - They are unique across coordinator restarts: the first component is
///     the second at which the transaction manager started, the second a
///     sequence number local to that run.
///   - They are ordered by (start, sequence), which is also issue order within
///     one run.
///   - Their textual form is what segments see and what the prepared
///     transaction listing reports; in-doubt transactions found on segments
///     are handled as opaque strings since they may predate this run.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gid {
    pub start_ts: u32,
    pub gxid: u32,
}

impl Gid {
    pub fn new(start_ts: u32, gxid: u32) -> Gid {
        Gid { start_ts, gxid }
    }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:010}", self.start_ts, self.gxid)
    }
}

impl std::fmt::Debug for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl FromStr for Gid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::BadLogRecord(format!("malformed gid {:?}", s));
        let (ts, seq) = s.split_once('-').ok_or_else(bad)?;
        if seq.len() < 10 {
            return Err(bad());
        }
        let start_ts = ts.parse::<u32>().map_err(|_| bad())?;
        let gxid = seq.parse::<u32>().map_err(|_| bad())?;
        Ok(Gid { start_ts, gxid })
    }
}
