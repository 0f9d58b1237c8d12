//! Memory tool names and the enabled-tools policy

use std::collections::{BTreeSet, HashMap};

pub const ADD_TOOL: &str = "memory_add";
pub const UPDATE_TOOL: &str = "memory_update";
pub const DELETE_TOOL: &str = "memory_delete";
pub const CLEAR_TOOL: &str = "memory_clear";
pub const SEARCH_TOOL: &str = "memory_search";
pub const LOAD_TOOL: &str = "memory_load";

/// Every tool name a memory service understands
pub const ALL_TOOLS: [&str; 6] = [
    ADD_TOOL,
    UPDATE_TOOL,
    DELETE_TOOL,
    CLEAR_TOOL,
    SEARCH_TOOL,
    LOAD_TOOL,
];

/// Tools that mutate memories, in prompt order
pub const MUTATION_TOOLS: [&str; 4] = [ADD_TOOL, UPDATE_TOOL, DELETE_TOOL, CLEAR_TOOL];

/// Tools an agent may call directly while extraction runs in the background
const AUTO_MODE_EXPOSED: [&str; 2] = [SEARCH_TOOL, LOAD_TOOL];

/// Enabled state per tool when an extractor drives memory writes
const AUTO_MODE_DEFAULTS: [(&str, bool); 6] = [
    (ADD_TOOL, true),
    (UPDATE_TOOL, true),
    (DELETE_TOOL, true),
    (CLEAR_TOOL, false),
    (SEARCH_TOOL, true),
    (LOAD_TOOL, false),
];

pub fn is_valid_tool_name(name: &str) -> bool {
    ALL_TOOLS.contains(&name)
}

/// Allow-list of tool names.
///
/// An empty list permits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnabledTools {
    names: BTreeSet<String>,
}

impl EnabledTools {
    /// Permit every tool
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Agentic-mode defaults: add, update, search and load
    pub fn service_defaults() -> Self {
        Self::only([ADD_TOOL, UPDATE_TOOL, SEARCH_TOOL, LOAD_TOOL])
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.names.is_empty() || self.names.contains(name)
    }

    /// True when the list is empty and therefore permits all tools
    pub fn permits_all(&self) -> bool {
        self.names.is_empty()
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn remove(&mut self, name: &str) {
        self.names.remove(name);
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Overlay auto-mode defaults, leaving explicitly configured tools alone.
    pub fn apply_auto_mode_defaults(&mut self, explicitly_set: &HashMap<String, bool>) {
        for (name, enabled) in AUTO_MODE_DEFAULTS {
            if explicitly_set.contains_key(name) {
                continue;
            }
            if enabled {
                self.insert(name);
            } else {
                self.remove(name);
            }
        }
    }

    /// Tool names an agent may be handed, sorted.
    ///
    /// With auto extraction on, only search and load are ever exposed; the
    /// mutation tools run in the background.
    pub fn exposed_tools(&self, auto_mode: bool) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = ALL_TOOLS
            .iter()
            .copied()
            .filter(|name| !auto_mode || AUTO_MODE_EXPOSED.contains(name))
            .filter(|name| self.is_enabled(name))
            .collect();
        names.sort_unstable();
        names
    }
}

impl<S: Into<String>> FromIterator<S> for EnabledTools {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::only(iter)
    }
}
