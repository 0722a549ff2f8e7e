use serde::{Deserialize, Serialize};
use std::fmt;

/// Plugin filename, compared case-insensitively. The original spelling is
/// kept for display and for the on-disk plugin lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginName(String);

impl PluginName {
    pub fn new(name: &str) -> Self {
        PluginName(name.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn folded(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl PartialEq for PluginName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for PluginName {}

impl PartialOrd for PluginName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PluginName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.folded().cmp(&other.folded())
    }
}

impl std::hash::Hash for PluginName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.folded().hash(state);
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginName {
    fn from(name: &str) -> Self {
        PluginName::new(name)
    }
}

/// A known plugin: its filename plus the structural facts the order rules
/// need. Active/inactive state lives in the active plugin log, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plugin {
    pub name: PluginName,
    pub is_master: bool,
    pub is_light_master: bool,
    pub masters: Vec<PluginName>,
}

impl Plugin {
    pub fn new(name: impl Into<PluginName>) -> Self {
        let name = name.into();
        let (is_master, is_light_master) = flags_from_extension(name.as_str());
        Plugin {
            name,
            is_master,
            is_light_master,
            masters: Vec::new(),
        }
    }

    pub fn master(name: impl Into<PluginName>) -> Self {
        Plugin {
            name: name.into(),
            is_master: true,
            is_light_master: false,
            masters: Vec::new(),
        }
    }

    pub fn with_masters(mut self, masters: &[&str]) -> Self {
        self.masters = masters.iter().map(|name| PluginName::new(name)).collect();
        self
    }
}

// Default flags come from the filename; `register` can override them once
// real header data is available.
fn flags_from_extension(name: &str) -> (bool, bool) {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".esm") {
        (true, false)
    } else if lower.ends_with(".esl") {
        (false, true)
    } else {
        (false, false)
    }
}
