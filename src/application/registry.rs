//! Merged tool catalog across connected servers, plus the one-shot
//! confirmation gate.

use crate::domain::types::ToolDescriptor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

struct RegisteredTool {
    descriptor: ToolDescriptor,
    /// One-shot confirmation grant. Check-and-clear is a single atomic swap
    /// so concurrent invokers cannot both observe a live grant.
    grant: AtomicBool,
}

/// Result of attempting to consume a confirmation grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStatus {
    /// A live grant existed and was cleared by this caller.
    Consumed,
    /// The tool is registered but no grant exists.
    NoGrant,
    /// The tool is not registered (its server may have disconnected).
    UnknownTool,
}

/// Tool name -> descriptor routing table.
///
/// Tool names are global: on collision the first registration wins and the
/// duplicate is dropped with a warning. (Descriptor-order priority was
/// considered and may replace this rule; see DESIGN.md.)
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server's catalog. Returns how many tools were accepted.
    pub fn register_catalog(&self, server_id: &str, tools: Vec<ToolDescriptor>) -> usize {
        let mut map = self.tools.write().expect("registry lock");
        let mut accepted = 0;
        for tool in tools {
            if let Some(existing) = map.get(&tool.name) {
                warn!(
                    tool = %tool.name,
                    kept = %existing.descriptor.server_id,
                    dropped = %server_id,
                    "tool name collision, keeping first registration"
                );
                continue;
            }
            debug!(tool = %tool.name, server = %server_id, "tool registered");
            map.insert(
                tool.name.clone(),
                Arc::new(RegisteredTool {
                    descriptor: tool,
                    grant: AtomicBool::new(false),
                }),
            );
            accepted += 1;
        }
        accepted
    }

    /// Atomically swap a server's catalog for a fresh one. Any grants on the
    /// server's previous tools are discarded with the old entries.
    pub fn replace_catalog(&self, server_id: &str, tools: Vec<ToolDescriptor>) -> usize {
        let mut map = self.tools.write().expect("registry lock");
        map.retain(|_, entry| entry.descriptor.server_id != server_id);
        let mut accepted = 0;
        for tool in tools {
            if let Some(existing) = map.get(&tool.name) {
                warn!(
                    tool = %tool.name,
                    kept = %existing.descriptor.server_id,
                    dropped = %server_id,
                    "tool name collision, keeping first registration"
                );
                continue;
            }
            map.insert(
                tool.name.clone(),
                Arc::new(RegisteredTool {
                    descriptor: tool,
                    grant: AtomicBool::new(false),
                }),
            );
            accepted += 1;
        }
        accepted
    }

    /// Drop every tool owned by a server. Returns how many were removed.
    pub fn unregister_server(&self, server_id: &str) -> usize {
        let mut map = self.tools.write().expect("registry lock");
        let before = map.len();
        map.retain(|_, entry| entry.descriptor.server_id != server_id);
        before - map.len()
    }

    pub fn resolve(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools
            .read()
            .expect("registry lock")
            .get(name)
            .map(|entry| entry.descriptor.clone())
    }

    /// All registered tools, sorted by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .read()
            .expect("registry lock")
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Set a one-shot grant for a registered tool. Returns false (and sets
    /// nothing) when the tool is unknown.
    pub fn grant_confirmation(&self, name: &str) -> bool {
        match self.tools.read().expect("registry lock").get(name) {
            Some(entry) => {
                entry.grant.store(true, Ordering::SeqCst);
                debug!(tool = %name, "confirmation granted");
                true
            }
            None => {
                warn!(tool = %name, "confirmation grant requested for unknown tool");
                false
            }
        }
    }

    /// Consume the tool's grant if one exists. Exactly one of any number of
    /// concurrent callers observes `Consumed`.
    pub fn try_consume_grant(&self, name: &str) -> GrantStatus {
        match self.tools.read().expect("registry lock").get(name) {
            Some(entry) => {
                if entry.grant.swap(false, Ordering::SeqCst) {
                    GrantStatus::Consumed
                } else {
                    GrantStatus::NoGrant
                }
            }
            None => GrantStatus::UnknownTool,
        }
    }

    /// Whether a live grant exists, without consuming it.
    pub fn has_grant(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("registry lock")
            .get(name)
            .map(|entry| entry.grant.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().expect("registry lock").is_empty()
    }

    /// How many tools a given server currently owns.
    pub fn tools_for_server(&self, server_id: &str) -> usize {
        self.tools
            .read()
            .expect("registry lock")
            .values()
            .filter(|entry| entry.descriptor.server_id == server_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, server: &str, gated: bool) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            server_id: server.to_string(),
            description: Some(format!("test tool {name}")),
            requires_confirmation: gated,
            input_schema: None,
        }
    }

    #[test]
    fn register_and_resolve() {
        let registry = ToolRegistry::new();
        let accepted = registry.register_catalog("fs", vec![tool("read_file", "fs", false)]);
        assert_eq!(accepted, 1);
        let resolved = registry.resolve("read_file").expect("registered");
        assert_eq!(resolved.server_id, "fs");
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn collision_keeps_first_registration() {
        let registry = ToolRegistry::new();
        registry.register_catalog("first", vec![tool("search", "first", false)]);
        let accepted = registry.register_catalog("second", vec![tool("search", "second", false)]);
        assert_eq!(accepted, 0);
        assert_eq!(registry.resolve("search").expect("kept").server_id, "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes_only_that_servers_tools() {
        let registry = ToolRegistry::new();
        registry.register_catalog("fs", vec![tool("read_file", "fs", false)]);
        registry.register_catalog("clock", vec![tool("get_time", "clock", false)]);

        assert_eq!(registry.unregister_server("fs"), 1);
        assert!(registry.resolve("read_file").is_none());
        assert!(registry.resolve("get_time").is_some());
    }

    #[test]
    fn replace_catalog_swaps_in_new_tools() {
        let registry = ToolRegistry::new();
        registry.register_catalog("fs", vec![tool("read_file", "fs", false)]);
        registry.grant_confirmation("read_file");

        let count = registry.replace_catalog(
            "fs",
            vec![tool("read_file", "fs", false), tool("write_file", "fs", true)],
        );
        assert_eq!(count, 2);
        // The replacement entry carries no grant from the old catalog.
        assert!(!registry.has_grant("read_file"));
    }

    #[test]
    fn grant_is_consumed_exactly_once() {
        let registry = ToolRegistry::new();
        registry.register_catalog("fs", vec![tool("delete_file", "fs", true)]);

        assert_eq!(registry.try_consume_grant("delete_file"), GrantStatus::NoGrant);
        assert!(registry.grant_confirmation("delete_file"));
        assert_eq!(registry.try_consume_grant("delete_file"), GrantStatus::Consumed);
        assert_eq!(registry.try_consume_grant("delete_file"), GrantStatus::NoGrant);
    }

    #[test]
    fn grant_on_unknown_tool_is_refused() {
        let registry = ToolRegistry::new();
        assert!(!registry.grant_confirmation("ghost"));
        assert_eq!(registry.try_consume_grant("ghost"), GrantStatus::UnknownTool);
    }

    #[test]
    fn concurrent_consumers_split_one_grant() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register_catalog("fs", vec![tool("delete_file", "fs", true)]);
        registry.grant_confirmation("delete_file");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                registry.try_consume_grant("delete_file")
            }));
        }
        let outcomes: Vec<GrantStatus> = handles
            .into_iter()
            .map(|h| h.join().expect("thread join"))
            .collect();

        let consumed = outcomes
            .iter()
            .filter(|s| **s == GrantStatus::Consumed)
            .count();
        assert_eq!(consumed, 1);
        assert!(outcomes.iter().all(|s| *s != GrantStatus::UnknownTool));
    }
}
