//! In-process load balancer.
//!
//! Listeners each forward to exactly one target group. Repointing a
//! listener is a single write under the lock, so every request routed
//! after the update lands on the new group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, warn};

use bluegreen_core::TargetGroupRef;

use crate::switch::RoutingError;

/// Snapshot of one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerInfo {
    pub name: String,
    pub target_group: TargetGroupRef,
    /// Successful repoints since the listener was created.
    pub updates: u64,
}

struct ListenerEntry {
    target_group: TargetGroupRef,
    updates: u64,
}

#[derive(Default)]
struct Faults {
    /// Updates still to be rejected with `Unavailable`.
    failing_updates: u32,
    /// Reject every call until cleared.
    unavailable: bool,
}

#[derive(Default)]
struct Inner {
    listeners: HashMap<String, ListenerEntry>,
    /// Registered target groups and the requests each has served.
    target_groups: HashMap<TargetGroupRef, AtomicU64>,
    faults: Faults,
}

/// Cheaply cloneable handle; clones share the same configuration.
#[derive(Clone, Default)]
pub struct LoadBalancer {
    inner: Arc<RwLock<Inner>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_target_group(&self, target_group: &TargetGroupRef) {
        let mut inner = self.inner.write().expect("load balancer lock");
        inner
            .target_groups
            .entry(target_group.clone())
            .or_insert_with(|| AtomicU64::new(0));
        debug!(%target_group, "target group registered");
    }

    /// Create (or replace) a listener forwarding to `target_group`.
    pub fn create_listener(
        &self,
        name: &str,
        target_group: &TargetGroupRef,
    ) -> Result<(), RoutingError> {
        let mut inner = self.inner.write().expect("load balancer lock");
        if !inner.target_groups.contains_key(target_group) {
            return Err(RoutingError::UnknownTargetGroup(target_group.to_string()));
        }
        inner.listeners.insert(
            name.to_string(),
            ListenerEntry {
                target_group: target_group.clone(),
                updates: 0,
            },
        );
        debug!(listener = name, %target_group, "listener created");
        Ok(())
    }

    /// Where `listener` currently forwards.
    pub fn listener_target(&self, listener: &str) -> Result<TargetGroupRef, RoutingError> {
        let inner = self.inner.read().expect("load balancer lock");
        if inner.faults.unavailable {
            return Err(RoutingError::Unavailable("describe-listeners throttled".into()));
        }
        inner
            .listeners
            .get(listener)
            .map(|l| l.target_group.clone())
            .ok_or_else(|| RoutingError::ListenerNotFound(listener.to_string()))
    }

    /// Repoint `listener` at `target_group` in one update.
    pub fn point_listener(
        &self,
        listener: &str,
        target_group: &TargetGroupRef,
    ) -> Result<(), RoutingError> {
        let mut inner = self.inner.write().expect("load balancer lock");
        if inner.faults.unavailable {
            return Err(RoutingError::Unavailable("modify-listener throttled".into()));
        }
        if inner.faults.failing_updates > 0 {
            inner.faults.failing_updates -= 1;
            warn!(listener, %target_group, "injected listener update failure");
            return Err(RoutingError::Unavailable("modify-listener failed".into()));
        }
        if !inner.target_groups.contains_key(target_group) {
            return Err(RoutingError::UnknownTargetGroup(target_group.to_string()));
        }
        let entry = inner
            .listeners
            .get_mut(listener)
            .ok_or_else(|| RoutingError::ListenerNotFound(listener.to_string()))?;
        entry.target_group = target_group.clone();
        entry.updates += 1;
        Ok(())
    }

    /// Route one request through `listener`, returning the group that served it.
    pub fn route(&self, listener: &str) -> Option<TargetGroupRef> {
        let inner = self.inner.read().expect("load balancer lock");
        let target_group = &inner.listeners.get(listener)?.target_group;
        if let Some(served) = inner.target_groups.get(target_group) {
            served.fetch_add(1, Ordering::Relaxed);
        }
        Some(target_group.clone())
    }

    /// Requests served by a target group so far.
    pub fn served(&self, target_group: &TargetGroupRef) -> u64 {
        let inner = self.inner.read().expect("load balancer lock");
        inner
            .target_groups
            .get(target_group)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    pub fn update_count(&self, listener: &str) -> u64 {
        let inner = self.inner.read().expect("load balancer lock");
        inner.listeners.get(listener).map(|l| l.updates).unwrap_or_default()
    }

    pub fn listeners(&self) -> Vec<ListenerInfo> {
        let inner = self.inner.read().expect("load balancer lock");
        let mut out: Vec<ListenerInfo> = inner
            .listeners
            .iter()
            .map(|(name, l)| ListenerInfo {
                name: name.clone(),
                target_group: l.target_group.clone(),
                updates: l.updates,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Reject the next `n` listener updates with a retryable error.
    pub fn fail_next_updates(&self, n: u32) {
        self.inner.write().expect("load balancer lock").faults.failing_updates = n;
    }

    /// Reject every call until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.write().expect("load balancer lock").faults.unavailable = unavailable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tg(name: &str) -> TargetGroupRef {
        TargetGroupRef::new(name)
    }

    fn lb() -> LoadBalancer {
        let lb = LoadBalancer::new();
        lb.register_target_group(&tg("tg-blue"));
        lb.register_target_group(&tg("tg-green"));
        lb.create_listener("prod-https", &tg("tg-blue")).unwrap();
        lb
    }

    #[test]
    fn listener_needs_registered_group() {
        let lb = LoadBalancer::new();
        assert!(matches!(
            lb.create_listener("x", &tg("tg-blue")),
            Err(RoutingError::UnknownTargetGroup(_))
        ));
    }

    #[test]
    fn traffic_moves_as_a_step() {
        let lb = lb();
        for _ in 0..5 {
            lb.route("prod-https");
        }
        lb.point_listener("prod-https", &tg("tg-green")).unwrap();
        for _ in 0..3 {
            lb.route("prod-https");
        }
        assert_eq!(lb.served(&tg("tg-blue")), 5);
        assert_eq!(lb.served(&tg("tg-green")), 3);
    }

    #[test]
    fn unavailable_blocks_reads_and_writes() {
        let lb = lb();
        lb.set_unavailable(true);
        assert!(lb.listener_target("prod-https").unwrap_err().is_retryable());
        assert!(lb.point_listener("prod-https", &tg("tg-green")).is_err());

        lb.set_unavailable(false);
        assert_eq!(lb.listener_target("prod-https").unwrap(), tg("tg-blue"));
    }

    #[test]
    fn failing_updates_are_counted_down() {
        let lb = lb();
        lb.fail_next_updates(2);
        assert!(lb.point_listener("prod-https", &tg("tg-green")).is_err());
        assert!(lb.point_listener("prod-https", &tg("tg-green")).is_err());
        lb.point_listener("prod-https", &tg("tg-green")).unwrap();
        assert_eq!(lb.update_count("prod-https"), 1);
    }

    #[test]
    fn listeners_snapshot_is_sorted() {
        let lb = lb();
        lb.create_listener("beta-https", &tg("tg-green")).unwrap();
        let names: Vec<_> = lb.listeners().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["beta-https", "prod-https"]);
    }

    #[test]
    fn route_on_missing_listener() {
        assert!(lb().route("nope").is_none());
    }
}
