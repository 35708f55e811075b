//! Role membership for the in-memory store.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::domain::Identity;

/// `member` acts for `role` if it is `role`, a superuser, or reaches `role`
/// through grants.
#[derive(Debug, Clone, Default)]
pub struct RoleGraph {
    superusers: BTreeSet<Identity>,
    /// member -> roles granted directly to it
    granted: HashMap<Identity, BTreeSet<Identity>>,
}

impl RoleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn superuser(&mut self, role: Identity) {
        self.superusers.insert(role);
    }

    pub fn grant(&mut self, role: Identity, member: Identity) {
        self.granted.entry(member).or_default().insert(role);
    }

    pub fn has_privs_of(&self, member: &Identity, role: &Identity) -> bool {
        if member == role || self.superusers.contains(member) {
            return true;
        }

        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([member]);
        while let Some(current) = queue.pop_front() {
            let Some(roles) = self.granted.get(current) else {
                continue;
            };
            for next in roles {
                if next == role {
                    return true;
                }
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }
}
