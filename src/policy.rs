// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{GroupId, ADMIN_GROUP, DEFAULT_GROUP};
use std::collections::HashMap;

/// What the catalog knows about the user starting a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserInfo {
    pub name: String,
    pub superuser: bool,
}

impl UserInfo {
    pub fn new(name: &str) -> Self {
        UserInfo {
            name: name.to_string(),
            superuser: false,
        }
    }

    pub fn superuser(name: &str) -> Self {
        UserInfo {
            name: name.to_string(),
            superuser: true,
        }
    }
}

/// Decides which group a transaction is admitted through. Installed once
/// when the runtime is built.
pub trait GroupSelectionPolicy: Send + Sync + 'static {
    fn select_group(&self, user: &UserInfo) -> GroupId;
}

/// Uses the role's configured group, falling back to the admin group for
/// superusers and the default group for everyone else.
#[derive(Clone, Debug, Default)]
pub struct RolePolicy {
    roles: HashMap<String, GroupId>,
}

impl RolePolicy {
    pub fn new() -> Self {
        RolePolicy::default()
    }

    pub fn with_role(mut self, role: &str, group: GroupId) -> Self {
        self.roles.insert(role.to_string(), group);
        self
    }
}

impl GroupSelectionPolicy for RolePolicy {
    fn select_group(&self, user: &UserInfo) -> GroupId {
        match self.roles.get(&user.name) {
            Some(g) if g.is_valid() => *g,
            _ if user.superuser => ADMIN_GROUP,
            _ => DEFAULT_GROUP,
        }
    }
}
