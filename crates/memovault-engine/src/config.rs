use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the engine.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Fine-tuning for the in-memory identity tier (L1).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Weight budget, in approximate bytes of cached outcomes.
    pub max_capacity: u64,

    /// Drop entries untouched for this long. Unset keeps them until epoch
    /// purge or capacity pressure.
    #[serde(with = "humantime_serde")]
    pub time_to_idle: Option<Duration>,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            // A single very large run can grow L1 without bound; 32 MiB of
            // memoized outcomes is a lot of spine for very little fat.
            max_capacity: 32 * 1024 * 1024,
            time_to_idle: None,
        }
    }
}

/// Fine-tuning for the durable content tier (L2).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DurableCacheConfig {
    /// Maximum resident entries before the eviction policy kicks in.
    pub max_entries: usize,

    /// Maximum total payload bytes kept in the durable store.
    pub max_bytes: u64,
}

impl Default for DurableCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 64 * 1024,
            max_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Per-tier cache configuration.
#[derive(Debug, Clone, Copy, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    pub in_memory: InMemoryCacheConfig,
    pub durable: DurableCacheConfig,
}

/// The engine configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the filesystem-backed durable tier. Leaving this unset
    /// disables durable caching; the in-memory tier is always active.
    pub cache_dir: Option<PathBuf>,

    /// Per-tier budgets.
    pub caches: CacheConfigs,

    /// Allow duplicate evaluation of provably cheap thunks instead of
    /// blocking on another thread's in-flight evaluation.
    pub cheap_thunk_fast_path: bool,

    /// Log level and format.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            caches: CacheConfigs::default(),
            cheap_thunk_fast_path: true,
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        serde_yaml::from_str(&source)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl de::Visitor<'_> for V {
        type Value = LevelFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a log level (off, error, warn, info, debug, trace)")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            value
                .parse()
                .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(V)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert!(config.cache_dir.is_none());
        assert!(config.cheap_thunk_fast_path);
        assert_eq!(config.logging.level, LevelFilter::INFO);
        assert!(config.caches.durable.max_entries > 0);
    }

    #[test]
    fn parses_yaml() {
        let config: Config = serde_yaml::from_str(
            r#"
cache_dir: /tmp/memovault
caches:
  in_memory:
    max_capacity: 1024
    time_to_idle: 5m
  durable:
    max_entries: 10
    max_bytes: 4096
cheap_thunk_fast_path: false
logging:
  level: debug
  format: json
"#,
        )
        .unwrap();

        assert_eq!(config.cache_dir.as_deref(), Some(Path::new("/tmp/memovault")));
        assert_eq!(config.caches.in_memory.max_capacity, 1024);
        assert_eq!(
            config.caches.in_memory.time_to_idle,
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.caches.durable.max_entries, 10);
        assert!(!config.cheap_thunk_fast_path);
        assert_eq!(config.logging.level, LevelFilter::DEBUG);
        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
