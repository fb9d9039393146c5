//! `ToolRegistry` (§4.B "Registry").
//!
//! Concurrent, `Arc`-backed catalog of `Tool` implementations, grounded
//! directly on `kernel::registry::AdapterRegistry`'s `DashMap`-based
//! concurrent-registry shape — replacing its connect/disconnect lifecycle
//! with the ACL-on-load bookkeeping §4.B actually asks for.

use std::sync::Arc;

use adk_core::model::Role;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::tool::Tool;

/// Concurrent registry of tools, keyed by name. Cheaply cloneable.
#[derive(Clone)]
pub struct ToolRegistry {
    inner: Arc<DashMap<String, Arc<dyn Tool>>>,
    /// Whether a given tool name is administratively enabled. Absent from
    /// this map defaults to `true` once registered (registration is itself
    /// the enable action); the map exists so an admin action can disable a
    /// tool without unregistering it.
    enabled: Arc<DashMap<String, bool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            enabled: Arc::new(DashMap::new()),
        }
    }

    /// Register a tool. If an ACL (`allowed_roles`) was already declared
    /// for a tool of this name before it was registered, that's a
    /// registered-but-not-in-ACL vs. in-ACL-but-not-registered mismatch;
    /// §4.B only requires logging these, which happens here and in
    /// `load_with_acl_report`.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if tool.allowed_roles().is_empty() {
            warn!(tool = %name, "tool registered with an empty ACL; defaulting to admin-only");
        }
        self.enabled.entry(name.clone()).or_insert(true);
        info!(tool = %name, "tool registered");
        self.inner.insert(name, tool);
    }

    pub fn unregister(&self, name: &str) {
        self.inner.remove(name);
        self.enabled.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.inner.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.get(name).map(|e| *e).unwrap_or(false)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) {
        self.enabled.insert(name.to_string(), enabled);
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    /// Tools visible to `role`: enabled and role-permitted (§4.B selection
    /// gate), used by the planner to build its tool catalog.
    pub fn list_visible_to(&self, role: Role) -> Vec<Arc<dyn Tool>> {
        self.inner
            .iter()
            .filter(|e| self.is_enabled(e.key()) && e.value().allowed_roles().contains(&role))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Cross-check a declared ACL map (name -> allowed roles) against what
    /// is actually registered, logging both mismatch directions per
    /// §4.B: "logs tools registered-but-not-in-ACL (treated admin-only),
    /// and tools-in-ACL-but-not-registered (warning)".
    pub fn audit_acl(&self, declared_acl_names: &[String]) {
        for name in self.list_names() {
            if !declared_acl_names.iter().any(|n| n == &name) {
                info!(tool = %name, "tool registered but absent from ACL; treated admin-only");
            }
        }
        for name in declared_acl_names {
            if self.get(name).is_none() {
                warn!(tool = %name, "tool present in ACL but not registered");
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
