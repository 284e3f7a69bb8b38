//! Tool registry: the aggregated tool list across all live connections.
//!
//! Provides:
//! - Atomic per-server replacement of tool lists
//! - Lookup by qualified name (`server.tool`) or unique bare name
//! - Structural validation of a tool call against the registered schema
//! - Similar-name suggestions for unknown tools
//!
//! Every copy handed out is sorted by `(server_id, name)` so the order is
//! stable across snapshots.

use std::collections::BTreeMap;

use super::errors::McpError;
use super::types::ToolDescriptor;

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all MCP servers.
///
/// Keyed by owning server id. A server's list is only ever replaced as a
/// whole, so a reader never sees two generations of one server's tools.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `server_id → tools`, each list sorted by name with no duplicates.
    servers: BTreeMap<String, Vec<ToolDescriptor>>,
}

/// Outcome of looking up a tool by the name a caller supplied.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResolution<'a> {
    /// Exactly one tool matched.
    Found(&'a ToolDescriptor),
    /// A bare name is offered by more than one server.
    Ambiguous { candidates: Vec<String> },
    /// Nothing matched. Carries close qualified names, best first.
    NotFound { suggestions: Vec<String> },
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every tool owned by `server_id` in one step.
    ///
    /// Tools are stamped with the owning server. A repeated name keeps the
    /// last definition the server sent.
    pub fn replace_server_tools(&mut self, server_id: &str, tools: Vec<ToolDescriptor>) {
        let mut by_name: BTreeMap<String, ToolDescriptor> = BTreeMap::new();
        for mut tool in tools {
            tool.server_id = server_id.to_string();
            by_name.insert(tool.name.clone(), tool);
        }
        self.servers
            .insert(server_id.to_string(), by_name.into_values().collect());
    }

    /// Remove all tools belonging to a server. Returns whether any were held.
    pub fn unregister_server(&mut self, server_id: &str) -> bool {
        self.servers.remove(server_id).is_some()
    }

    /// Remove every server's tools.
    pub fn clear(&mut self) {
        self.servers.clear();
    }

    /// Copy of every tool, ordered by `(server_id, name)`.
    pub fn all_tools(&self) -> Vec<ToolDescriptor> {
        self.servers.values().flatten().cloned().collect()
    }

    /// Tools owned by one server.
    pub fn tools_for_server(&self, server_id: &str) -> &[ToolDescriptor] {
        self.servers
            .get(server_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ids of servers holding at least one registration, sorted.
    pub fn server_ids(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.servers.values().map(Vec::len).sum()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a tool by `server.tool` or by a bare tool name.
    ///
    /// Strategy (first match wins):
    /// 1. **Qualified:** the prefix up to a dot is a server id owning the rest.
    /// 2. **Bare:** the whole name is a tool name on exactly one server.
    ///
    /// Tool names may themselves contain dots, so every split point is tried.
    pub fn resolve(&self, name: &str) -> ToolResolution<'_> {
        for (idx, _) in name.match_indices('.') {
            let (server, tool) = (&name[..idx], &name[idx + 1..]);
            if let Some(found) = self.find(server, tool) {
                return ToolResolution::Found(found);
            }
        }

        let matches: Vec<&ToolDescriptor> = self
            .servers
            .values()
            .flatten()
            .filter(|t| t.name == name)
            .collect();

        match matches.as_slice() {
            [only] => ToolResolution::Found(only),
            [] => ToolResolution::NotFound {
                suggestions: self.find_similar(name, 3),
            },
            many => ToolResolution::Ambiguous {
                candidates: many
                    .iter()
                    .map(|t| format!("{}.{}", t.server_id, t.name))
                    .collect(),
            },
        }
    }

    /// Look up a tool on a specific server.
    pub fn find(&self, server_id: &str, tool_name: &str) -> Option<&ToolDescriptor> {
        self.servers
            .get(server_id)?
            .iter()
            .find(|t| t.name == tool_name)
    }

    /// Validate a tool call: tool exists and arguments carry the required fields.
    ///
    /// This is a basic structural check. Full JSON Schema validation is left
    /// to the server itself.
    pub fn validate_tool_call(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<&ToolDescriptor, McpError> {
        let def = match self.resolve(tool_name) {
            ToolResolution::Found(def) => def,
            ToolResolution::Ambiguous { candidates } => {
                return Err(McpError::InvalidArguments {
                    tool: tool_name.to_string(),
                    reason: format!("ambiguous tool name, qualify it as one of: {}", candidates.join(", ")),
                })
            }
            ToolResolution::NotFound { .. } => {
                return Err(McpError::UnknownTool {
                    name: tool_name.to_string(),
                })
            }
        };

        if let Some(required) = def.input_schema.get("required").and_then(|r| r.as_array()) {
            let args_obj = arguments.as_object();
            for field_name in required.iter().filter_map(|f| f.as_str()) {
                let has_field = args_obj
                    .map(|obj| obj.contains_key(field_name))
                    .unwrap_or(false);
                if !has_field {
                    return Err(McpError::InvalidArguments {
                        tool: tool_name.to_string(),
                        reason: format!("missing required field: '{field_name}'"),
                    });
                }
            }
        }

        Ok(def)
    }

    /// Up to `max_results` qualified names most similar to `name`, best first.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = name.rsplit('.').next().unwrap_or(name);

        let mut scored: Vec<(String, f64)> = self
            .servers
            .values()
            .flatten()
            .map(|t| (format!("{}.{}", t.server_id, t.name), similarity(query, &t.name)))
            .filter(|(_, score)| *score > 0.3)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity in 0.0–1.0 (1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

// ─── Tests ───────────────────────────────────────────────────────────────────
