//! Layered configuration.
//!
//! Resolution order, highest wins: explicit overrides, process environment
//! (`BD_*`), project config (`.beads/config.yaml`), user config
//! (`~/.config/bd/config.yaml`), built-in defaults.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::{IssueType, Priority};
use crate::util::id::IdConfig;

/// Recognized keys and their defaults. Unknown keys are carried verbatim so
/// callers layered above the engine can stash their own settings.
pub const DEFAULTS: &[(&str, &str)] = &[
    ("issue_prefix", "bd"),
    ("default_priority", "2"),
    ("default_type", "task"),
    ("max_collision_prob", "0.25"),
    ("min_hash_length", "3"),
    ("max_hash_length", "8"),
    ("import.orphan_handling", "allow"),
    ("export.error_policy", "strict"),
    ("auto_export.error_policy", "best-effort"),
    ("export.retry_attempts", "3"),
    ("export.retry_backoff_ms", "100"),
    ("export.write_manifest", "false"),
];

const ENV_PREFIX: &str = "BD_";

/// One source of configuration values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLayer {
    values: HashMap<String, String>,
}

impl ConfigLayer {
    /// Layer holding the built-in defaults.
    #[must_use]
    pub fn defaults() -> Self {
        let values = DEFAULTS
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { values }
    }

    /// Read a YAML file into a layer; nested maps flatten with dots
    /// (`import: {orphan_handling: skip}` becomes `import.orphan_handling`).
    /// A missing file yields an empty layer.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let mut layer = Self::default();
        flatten_yaml(&value, "", &mut layer.values);
        Ok(layer)
    }

    /// Read `BD_*` environment variables for every recognized key.
    #[must_use]
    pub fn from_env() -> Self {
        let mut layer = Self::default();
        for (key, _) in DEFAULTS {
            let var = format!("{ENV_PREFIX}{}", key.replace('.', "_").to_uppercase());
            if let Ok(value) = env::var(&var) {
                layer.values.insert((*key).to_string(), value);
            }
        }
        layer
    }

    /// Build a layer from explicit key/value overrides.
    #[must_use]
    pub fn from_overrides(overrides: &HashMap<String, String>) -> Self {
        Self {
            values: overrides.clone(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Merge `other` on top of this layer (higher precedence wins).
    pub fn merge_from(&mut self, other: &Self) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }
}

fn flatten_yaml(value: &serde_yaml::Value, prefix: &str, out: &mut HashMap<String, String>) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                let Some(key) = k.as_str() else { continue };
                let full = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_yaml(v, &full, out);
            }
        }
        serde_yaml::Value::Null => {}
        serde_yaml::Value::Bool(b) => {
            out.insert(prefix.to_string(), b.to_string());
        }
        serde_yaml::Value::Number(n) => {
            out.insert(prefix.to_string(), n.to_string());
        }
        serde_yaml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        serde_yaml::Value::Sequence(_) | serde_yaml::Value::Tagged(_) => {}
    }
}

/// Merged configuration with typed accessors for the core keys.
#[derive(Debug, Clone)]
pub struct Config {
    merged: ConfigLayer,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            merged: ConfigLayer::defaults(),
        }
    }
}

impl Config {
    /// Load and merge all layers for a workspace.
    pub fn load(workspace_dir: &Path, overrides: &HashMap<String, String>) -> Result<Self> {
        let mut merged = ConfigLayer::defaults();
        merged.merge_from(&user_layer()?);
        merged.merge_from(&ConfigLayer::from_yaml(
            &workspace_dir.join("config.yaml"),
        )?);
        merged.merge_from(&ConfigLayer::from_env());
        merged.merge_from(&ConfigLayer::from_overrides(overrides));
        Ok(Self { merged })
    }

    /// Build a config from a single pre-merged layer (tests, embedders).
    #[must_use]
    pub fn from_layer(layer: ConfigLayer) -> Self {
        let mut merged = ConfigLayer::defaults();
        merged.merge_from(&layer);
        Self { merged }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.merged.values.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn issue_prefix(&self) -> &str {
        self.get("issue_prefix").unwrap_or("bd")
    }

    pub fn default_priority(&self) -> Result<Priority> {
        self.get("default_priority")
            .unwrap_or("2")
            .parse::<i32>()
            .map_err(|_| Error::Config("default_priority must be an integer".into()))
            .and_then(Priority::new)
    }

    pub fn default_type(&self) -> Result<IssueType> {
        self.get("default_type").unwrap_or("task").parse()
    }

    /// ID generation parameters assembled from the hash keys.
    #[must_use]
    pub fn id_config(&self) -> IdConfig {
        let defaults = IdConfig::default();
        IdConfig {
            prefix: self.issue_prefix().to_string(),
            min_hash_length: self
                .get("min_hash_length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_hash_length),
            max_hash_length: self
                .get("max_hash_length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_hash_length),
            max_collision_prob: self
                .get("max_collision_prob")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_collision_prob),
        }
    }

    #[must_use]
    pub fn orphan_handling(&self) -> &str {
        self.get("import.orphan_handling").unwrap_or("allow")
    }

    #[must_use]
    pub fn export_error_policy(&self) -> &str {
        self.get("export.error_policy").unwrap_or("strict")
    }

    #[must_use]
    pub fn auto_export_error_policy(&self) -> &str {
        self.get("auto_export.error_policy").unwrap_or("best-effort")
    }

    #[must_use]
    pub fn export_retry_attempts(&self) -> u32 {
        self.get("export.retry_attempts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3)
    }

    #[must_use]
    pub fn export_retry_backoff_ms(&self) -> u64 {
        self.get("export.retry_backoff_ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100)
    }

    #[must_use]
    pub fn write_manifest(&self) -> bool {
        self.get("export.write_manifest")
            .map(|v| v == "true" || v == "1" || v == "yes")
            .unwrap_or(false)
    }
}

fn user_layer() -> Result<ConfigLayer> {
    let Ok(home) = env::var("HOME") else {
        return Ok(ConfigLayer::default());
    };
    ConfigLayer::from_yaml(
        &Path::new(&home)
            .join(".config")
            .join("bd")
            .join("config.yaml"),
    )
}
