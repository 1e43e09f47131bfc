use std::collections::BTreeMap;

use parking_lot::RwLock;
use relay_proto::Role;

use crate::registry::ConnectionId;

/// Result of a single [`RoleBindings::bind`] call, captured under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindOutcome {
    pub previous: Option<ConnectionId>,
    pub both_bound: bool,
}

impl BindOutcome {
    /// True when the bind replaced a different connection.
    pub fn superseded(&self, id: ConnectionId) -> Option<ConnectionId> {
        self.previous.filter(|previous| *previous != id)
    }
}

/// Maps each role to at most one connection. The latest bind always wins;
/// the superseded connection is left open for the transport to deal with.
#[derive(Debug, Default)]
pub struct RoleBindings {
    table: RwLock<BTreeMap<Role, ConnectionId>>,
}

impl RoleBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, role: Role, id: ConnectionId) -> BindOutcome {
        let mut table = self.table.write();
        let previous = table.insert(role, id);
        BindOutcome {
            previous,
            both_bound: Role::ALL.iter().all(|role| table.contains_key(role)),
        }
    }

    pub fn lookup(&self, role: Role) -> Option<ConnectionId> {
        self.table.read().get(&role).copied()
    }

    pub fn both_bound(&self) -> bool {
        let table = self.table.read();
        Role::ALL.iter().all(|role| table.contains_key(role))
    }

    pub fn roles_of(&self, id: ConnectionId) -> Vec<Role> {
        self.table
            .read()
            .iter()
            .filter(|(_, bound)| **bound == id)
            .map(|(role, _)| *role)
            .collect()
    }

    /// Drops every binding that points at `id` and returns the roles it held.
    pub fn evict(&self, id: ConnectionId) -> Vec<Role> {
        let mut table = self.table.write();
        let roles: Vec<Role> = table
            .iter()
            .filter(|(_, bound)| **bound == id)
            .map(|(role, _)| *role)
            .collect();
        for role in &roles {
            table.remove(role);
        }
        roles
    }

    pub fn snapshot(&self) -> BTreeMap<Role, ConnectionId> {
        self.table.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn last_bind_wins() {
        let bindings = RoleBindings::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();

        assert_eq!(bindings.bind(Role::UiDriver, first).previous, None);
        let outcome = bindings.bind(Role::UiDriver, second);
        assert_eq!(outcome.previous, Some(first));
        assert_eq!(outcome.superseded(second), Some(first));
        assert_eq!(bindings.lookup(Role::UiDriver), Some(second));
    }

    #[test_timeout::timeout]
    fn rebinding_the_same_connection_supersedes_nothing() {
        let bindings = RoleBindings::new();
        let id = ConnectionId::new();
        bindings.bind(Role::Instrumentation, id);
        let outcome = bindings.bind(Role::Instrumentation, id);
        assert_eq!(outcome.superseded(id), None);
    }

    #[test_timeout::timeout]
    fn both_bound_needs_every_role() {
        let bindings = RoleBindings::new();
        let ui = ConnectionId::new();
        let swizzler = ConnectionId::new();

        assert!(!bindings.both_bound());
        assert!(!bindings.bind(Role::UiDriver, ui).both_bound);
        assert!(!bindings.both_bound());
        assert!(bindings.bind(Role::Instrumentation, swizzler).both_bound);
        assert!(bindings.both_bound());

        assert_eq!(bindings.evict(ui), vec![Role::UiDriver]);
        assert!(!bindings.both_bound());
        assert_eq!(bindings.lookup(Role::UiDriver), None);
    }

    #[test_timeout::timeout]
    fn evicting_a_superseded_connection_keeps_the_new_binding() {
        let bindings = RoleBindings::new();
        let stale = ConnectionId::new();
        let fresh = ConnectionId::new();
        bindings.bind(Role::UiDriver, stale);
        bindings.bind(Role::UiDriver, fresh);

        assert!(bindings.evict(stale).is_empty());
        assert_eq!(bindings.lookup(Role::UiDriver), Some(fresh));
    }

    #[test_timeout::timeout]
    fn one_connection_may_hold_both_roles() {
        let bindings = RoleBindings::new();
        let id = ConnectionId::new();
        bindings.bind(Role::UiDriver, id);
        bindings.bind(Role::Instrumentation, id);

        assert_eq!(bindings.roles_of(id), Role::ALL.to_vec());
        assert_eq!(bindings.evict(id).len(), 2);
        assert!(bindings.snapshot().is_empty());
    }
}
