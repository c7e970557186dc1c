//! Runtime configuration — size ranges and the language catalog

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{GateError, Result};

/// A `[min, max]` range with a default used when the caller leaves the value unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
    pub min: u64,
    pub max: u64,
    pub def: u64,
}

impl RangeConfig {
    /// Resolve a requested value: 0 picks the default, anything outside the range is rejected
    pub fn resolve(&self, what: &str, value: u64) -> Result<u64> {
        if value == 0 {
            return Ok(self.def);
        }
        if value < self.min || value > self.max {
            return Err(GateError::Config(format!(
                "{} {} is outside [{}, {}]",
                what, value, self.min, self.max
            )));
        }
        Ok(value)
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.min > self.max || self.def < self.min || self.def > self.max {
            return Err(GateError::Config(format!(
                "runtime.{}: expected min <= def <= max, got {}/{}/{}",
                what, self.min, self.def, self.max
            )));
        }
        Ok(())
    }
}

/// Per-language runtime settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Whether sources must be built before running
    #[serde(default)]
    pub build: bool,

    /// Command run inside the build pod
    #[serde(default)]
    pub build_cmd: Vec<String>,
}

/// Runtime configuration block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Function timeout range in seconds (default: 1..60, def 1)
    #[serde(default = "default_timeout")]
    pub timeout: RangeConfig,

    /// Function memory range in MB (default: 64..1024, def 128)
    #[serde(default = "default_memory")]
    pub memory: RangeConfig,

    /// Hard ceiling on replicas per function (default: 32)
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,

    /// Language tag → runtime settings
    #[serde(default = "default_languages")]
    pub languages: HashMap<String, LanguageConfig>,
}

fn default_timeout() -> RangeConfig {
    RangeConfig {
        min: 1,
        max: 60,
        def: 1,
    }
}

fn default_memory() -> RangeConfig {
    RangeConfig {
        min: 64,
        max: 1024,
        def: 128,
    }
}

fn default_max_replicas() -> u32 {
    32
}

fn default_languages() -> HashMap<String, LanguageConfig> {
    let mut languages = HashMap::new();
    for lang in ["python", "nodejs", "ruby"] {
        languages.insert(lang.to_string(), LanguageConfig::default());
    }
    languages.insert(
        "golang".to_string(),
        LanguageConfig {
            build: true,
            build_cmd: vec!["go".into(), "build".into(), "-o".into(), "function".into()],
        },
    );
    languages.insert(
        "swift".to_string(),
        LanguageConfig {
            build: true,
            build_cmd: vec!["swift".into(), "build".into()],
        },
    );
    languages
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            memory: default_memory(),
            max_replicas: default_max_replicas(),
            languages: default_languages(),
        }
    }
}

impl RuntimeConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        self.timeout.validate("timeout")?;
        self.memory.validate("memory")?;
        if self.max_replicas == 0 {
            return Err(GateError::Config(
                "runtime.max_replicas must be greater than 0".to_string(),
            ));
        }
        if self.languages.is_empty() {
            return Err(GateError::Config(
                "runtime.languages must define at least one language".to_string(),
            ));
        }
        for (lang, cfg) in &self.languages {
            if cfg.build && cfg.build_cmd.is_empty() {
                return Err(GateError::Config(format!(
                    "runtime.languages.{}: build = true requires build_cmd",
                    lang
                )));
            }
        }
        Ok(())
    }
}

/// Resolved capabilities of one language runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub lang: String,
    pub build: bool,
    pub build_cmd: Vec<String>,
}

/// Immutable language tag → runtime mapping, built once at startup
#[derive(Debug, Clone, Default)]
pub struct RuntimeCatalog {
    runtimes: HashMap<String, RuntimeInfo>,
}

impl RuntimeCatalog {
    /// Build the catalog from the runtime configuration
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let runtimes = config
            .languages
            .iter()
            .map(|(lang, cfg)| {
                let info = RuntimeInfo {
                    lang: lang.clone(),
                    build: cfg.build,
                    build_cmd: cfg.build_cmd.clone(),
                };
                (lang.clone(), info)
            })
            .collect();
        Self { runtimes }
    }

    /// Look up a language, failing with a config error for unknown tags
    pub fn get(&self, lang: &str) -> Result<&RuntimeInfo> {
        self.runtimes
            .get(lang)
            .ok_or_else(|| GateError::Config(format!("Unknown language '{}'", lang)))
    }

    /// Whether functions in this language go through a build step
    pub fn requires_build(&self, lang: &str) -> bool {
        self.runtimes.get(lang).map(|r| r.build).unwrap_or(false)
    }

    /// Runtimes sorted by language tag
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RuntimeInfo)> {
        let mut entries: Vec<_> = self
            .runtimes
            .iter()
            .map(|(lang, info)| (lang.as_str(), info))
            .collect();
        entries.sort_by_key(|(lang, _)| *lang);
        entries.into_iter()
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_resolve_default() {
        let range = default_memory();
        assert_eq!(range.resolve("memory", 0).unwrap(), 128);
        assert_eq!(range.resolve("memory", 256).unwrap(), 256);
    }

    #[test]
    fn test_range_resolve_out_of_bounds() {
        let range = default_memory();
        assert!(range.resolve("memory", 32).is_err());
        assert!(range.resolve("memory", 2048).is_err());
    }

    #[test]
    fn test_invalid_range_rejected() {
        let config = RuntimeConfig {
            timeout: RangeConfig {
                min: 10,
                max: 5,
                def: 7,
            },
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_language_requires_cmd() {
        let mut config = RuntimeConfig::default();
        config.languages.insert(
            "rust".into(),
            LanguageConfig {
                build: true,
                build_cmd: vec![],
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = RuntimeCatalog::from_config(&RuntimeConfig::default());
        assert!(catalog.requires_build("golang"));
        assert!(!catalog.requires_build("python"));
        assert!(catalog.get("cobol").is_err());
        assert_eq!(catalog.get("golang").unwrap().build_cmd[0], "go");
        assert_eq!(catalog.len(), 5);
    }
}
