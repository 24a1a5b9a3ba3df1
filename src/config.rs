use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Placement-layer configuration (spec §6 "config" collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdConfig {
    /// Whether multi-disk placement is enabled at all. When `false`,
    /// `for_each_object` falls back to the single legacy `obj_path` and
    /// `handle_eio`/lookups report `MdError::Eio`.
    pub enable_md: bool,
    /// Legacy single-disk path used when `enable_md` is `false`.
    pub obj_path: PathBuf,
    /// Name of the dedicated work-queue that carries recovery work items.
    pub md_wqueue: String,
}

impl Default for MdConfig {
    fn default() -> Self {
        MdConfig {
            enable_md: true,
            obj_path: PathBuf::from("/var/lib/store/obj"),
            md_wqueue: "md_recovery".to_string(),
        }
    }
}

/// Work-queue engine configuration: the knobs the grow/shrink predicates
/// read (spec §4.1). Kept separate from `MdConfig` because a host may run
/// the engine without placement at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WqeConfig {
    /// Length of the post-grow/post-activity shrink-protection window.
    #[serde(with = "duration_millis")]
    pub protection_window: Duration,
}

impl Default for WqeConfig {
    fn default() -> Self {
        WqeConfig {
            protection_window: Duration::from_millis(1000),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Top-level configuration bundle, following this crate's existing
/// presets-plus-validation convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub md: MdConfig,
    pub wqe: WqeConfig,
}

impl Config {
    /// Default configuration for production use.
    pub fn production() -> Self {
        Config {
            md: MdConfig::default(),
            wqe: WqeConfig::default(),
        }
    }

    /// Development configuration: placement disabled by default so a
    /// single-disk checkout doesn't need a real disk pool to boot.
    pub fn development() -> Self {
        let mut config = Self::production();
        config.md.enable_md = false;
        config
    }

    /// Testing configuration: a short protection window so hysteresis
    /// tests don't have to sleep for a full second.
    pub fn testing() -> Self {
        let mut config = Self::production();
        config.wqe.protection_window = Duration::from_millis(50);
        config
    }

    /// Load from JSON.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("failed to parse config: {}", e))
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Validate configuration, collecting every problem found rather than
    /// failing on the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.md.md_wqueue.is_empty() {
            errors.push("md.md_wqueue must not be empty".to_string());
        }
        if self.wqe.protection_window.is_zero() {
            errors.push("wqe.protection_window must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::production()
    }
}

/// Fluent builder, mirroring this crate's existing `ConfigBuilder`.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::production(),
        }
    }

    pub fn from_preset(preset: &str) -> Self {
        let config = match preset {
            "development" => Config::development(),
            "testing" => Config::testing(),
            _ => Config::production(),
        };
        ConfigBuilder { config }
    }

    pub fn enable_md(mut self, enable: bool) -> Self {
        self.config.md.enable_md = enable;
        self
    }

    pub fn obj_path(mut self, path: PathBuf) -> Self {
        self.config.md.obj_path = path;
        self
    }

    pub fn md_wqueue(mut self, name: impl Into<String>) -> Self {
        self.config.md.md_wqueue = name.into();
        self
    }

    pub fn protection_window(mut self, window: Duration) -> Self {
        self.config.wqe.protection_window = window;
        self
    }

    pub fn build(self) -> anyhow::Result<Config> {
        match self.config.validate() {
            Ok(()) => Ok(self.config),
            Err(errors) => Err(anyhow::anyhow!(
                "configuration validation failed: {}",
                errors.join("; ")
            )),
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
