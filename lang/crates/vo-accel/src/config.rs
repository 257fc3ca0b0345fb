//! Host configuration for acceleration units.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::loader::SearchPath;
use crate::unit_spec::split_unit_list;

/// Version string reported to units through `get_vm_version`.
pub const DEFAULT_VM_VERSION: &str = concat!("vo ", env!("CARGO_PKG_VERSION"));

/// Acceleration settings collected from the command line and environment.
#[derive(Debug, Clone)]
pub struct AccelConfig {
    /// Master switch. When off, declared units are ignored.
    pub enabled: bool,
    /// Unit options in declaration order.
    pub units: Vec<String>,
    pub search_path: SearchPath,
    pub vm_version: String,
    pub flags: Arc<FlagStore>,
}

impl AccelConfig {
    /// Disabled config with an empty search path.
    pub fn new() -> Self {
        Self {
            enabled: false,
            units: Vec::new(),
            search_path: SearchPath::default(),
            vm_version: DEFAULT_VM_VERSION.to_string(),
            flags: Arc::new(FlagStore::new()),
        }
    }

    /// Like [`AccelConfig::new`] with the search path read from the environment.
    pub fn from_env() -> Self {
        Self {
            search_path: SearchPath::from_env(),
            ..Self::new()
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn unit(mut self, option: impl Into<String>) -> Self {
        self.units.push(option.into());
        self
    }

    pub fn units<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.units.extend(options.into_iter().map(Into::into));
        self
    }

    /// Append units from a newline-separated list.
    pub fn with_unit_list(mut self, text: &str) -> Self {
        self.units.extend(split_unit_list(text).map(str::to_string));
        self
    }

    pub fn search_path(mut self, search_path: SearchPath) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn vm_version(mut self, version: impl Into<String>) -> Self {
        self.vm_version = version.into();
        self
    }

    /// Define a host flag visible to units.
    pub fn flag(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.define(name, value);
        self
    }
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Host flags units may read and write through the env.
///
/// Only defined flags can be set; units cannot create new ones.
#[derive(Debug, Default)]
pub struct FlagStore {
    flags: RwLock<IndexMap<String, String>>,
}

impl FlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define or overwrite a flag.
    pub fn define(&self, name: impl Into<String>, value: impl Into<String>) {
        self.flags.write().insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.flags.read().get(name).cloned()
    }

    /// Update an existing flag. Returns false if it is not defined.
    pub fn set(&self, name: &str, value: &str) -> bool {
        match self.flags.write().get_mut(name) {
            Some(slot) => {
                *slot = value.to_string();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.flags
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = AccelConfig::new()
            .enabled(true)
            .unit("a_1")
            .with_unit_list("b_1?x=y\n\nc_2\n")
            .units(["d_1"]);
        assert!(config.enabled);
        assert_eq!(config.units, vec!["a_1", "b_1?x=y", "c_2", "d_1"]);
    }

    #[test]
    fn test_default_is_disabled() {
        let config = AccelConfig::default();
        assert!(!config.enabled);
        assert!(config.units.is_empty());
        assert!(config.vm_version.starts_with("vo "));
    }

    #[test]
    fn test_flags() {
        let flags = FlagStore::new();
        assert!(!flags.set("Missing", "1"));
        flags.define("TieredStopAtLevel", "4");
        assert_eq!(flags.get("TieredStopAtLevel").as_deref(), Some("4"));
        assert!(flags.set("TieredStopAtLevel", "1"));
        assert_eq!(flags.get("TieredStopAtLevel").as_deref(), Some("1"));
        assert_eq!(flags.snapshot(), vec![("TieredStopAtLevel".to_string(), "1".to_string())]);
    }
}
