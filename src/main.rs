// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use weir::*;

#[cfg(test)]
mod test;

// These scenarios live outside the library so that they only exercise the
// public API, the way an embedding coordinator or segment would.

#[test]
fn network_two_phase_commit() {
    test::network_two_phase_commit();
}

#[test]
fn crash_after_commit_point_is_finished_by_recovery() {
    test::crash_after_commit_point_is_finished_by_recovery();
}

#[test]
fn unresolved_in_doubt_blocks_startup() {
    test::unresolved_in_doubt_blocks_startup();
}

#[test]
fn admitted_transactions_commit_in_arrival_order() {
    test::admitted_transactions_commit_in_arrival_order();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
