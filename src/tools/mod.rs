//! Per-server cache of the last successful `tools/list`.
//!
//! Authoritative at call time: `tools/call` dispatch is gated on a cache
//! hit so unknown tool names fail locally without a child round-trip. The
//! registry's denormalized copy is only a discovery hint.

use crate::types::ToolDescriptor;
use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct CachedTools {
    pub tools: Vec<ToolDescriptor>,
    /// Incremented on each refresh; lets observers detect staleness.
    pub version: u64,
}

#[derive(Default)]
pub struct ToolCache {
    entries: DashMap<String, CachedTools>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached set for a server, bumping the version.
    pub fn refresh(&self, server_id: &str, tools: Vec<ToolDescriptor>) -> u64 {
        let mut version = 1;
        self.entries
            .entry(server_id.to_string())
            .and_modify(|cached| {
                cached.version += 1;
                cached.tools = tools.clone();
                version = cached.version;
            })
            .or_insert_with(|| CachedTools { tools, version: 1 });
        version
    }

    /// Drop the cached set; the next call path must repopulate it.
    pub fn invalidate(&self, server_id: &str) {
        self.entries.remove(server_id);
    }

    pub fn get(&self, server_id: &str) -> Option<CachedTools> {
        self.entries.get(server_id).map(|e| e.value().clone())
    }

    pub fn has_tool(&self, server_id: &str, tool: &str) -> Option<bool> {
        self.entries
            .get(server_id)
            .map(|e| e.tools.iter().any(|t| t.name == tool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            extra: Default::default(),
        }
    }

    #[test]
    fn refresh_bumps_version() {
        let cache = ToolCache::new();
        assert_eq!(cache.refresh("fs", vec![tool("read")]), 1);
        assert_eq!(cache.refresh("fs", vec![tool("read"), tool("write")]), 2);
        assert_eq!(cache.get("fs").unwrap().tools.len(), 2);
    }

    #[test]
    fn invalidate_forgets_entry() {
        let cache = ToolCache::new();
        cache.refresh("fs", vec![tool("read")]);
        cache.invalidate("fs");
        assert!(cache.get("fs").is_none());
        assert!(cache.has_tool("fs", "read").is_none());
    }

    #[test]
    fn has_tool_gates_unknown_names() {
        let cache = ToolCache::new();
        cache.refresh("fs", vec![tool("read")]);
        assert_eq!(cache.has_tool("fs", "read"), Some(true));
        assert_eq!(cache.has_tool("fs", "nope"), Some(false));
    }
}
