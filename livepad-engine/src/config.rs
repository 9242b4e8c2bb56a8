//! Configuration management for livepad

use crate::cache::CacheConfig;
use crate::memory::MemoryConfig;
use crate::registry::RestartPolicy;
use crate::throttle::ThrottleConfig;
use anyhow::{anyhow, bail, Context};
use livepad_common::Language;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the function instrumented code reports values through
pub const DEFAULT_DEBUG_FUNCTION: &str = "__livepad_debug";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LivepadConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Per-language worker settings, keyed by language name
    #[serde(default = "default_languages")]
    pub languages: BTreeMap<String, LanguageConfig>,
}

/// Registry-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a freshly spawned worker may take to send `ready`
    #[serde(default = "EngineConfig::default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Added to the caller timeout to form the safety timeout
    #[serde(default = "EngineConfig::default_safety_grace", with = "humantime_serde")]
    pub safety_grace: Duration,
    /// Terminate a worker that missed the safety timeout
    #[serde(default = "default_true")]
    pub recycle_on_hard_timeout: bool,
    /// Capacity of the broadcast event channel
    #[serde(default = "EngineConfig::default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl EngineConfig {
    fn default_ready_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_safety_grace() -> Duration {
        Duration::from_secs(2)
    }

    fn default_event_capacity() -> usize {
        1024
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Self::default_ready_timeout(),
            safety_grace: Self::default_safety_grace(),
            recycle_on_hard_timeout: true,
            event_capacity: Self::default_event_capacity(),
            restart: RestartPolicy::default(),
        }
    }
}

/// Worker settings for one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Program and arguments that start the worker
    pub worker_command: Vec<String>,
    /// Optional external transpiler worker
    #[serde(default)]
    pub transpiler_command: Option<Vec<String>>,
    #[serde(default = "LanguageConfig::default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,
    #[serde(default = "LanguageConfig::default_debug_function")]
    pub debug_function_name: String,
    /// Run the instrumentation pipeline before dispatch
    #[serde(default = "default_true")]
    pub instrument: bool,
    /// Track interpreter memory and issue cleanups
    #[serde(default)]
    pub memory_management: bool,
    #[serde(default = "LanguageConfig::default_max_iterations")]
    pub max_iterations: u64,
    #[serde(default = "LanguageConfig::default_check_interval")]
    pub check_interval: u64,
}

impl LanguageConfig {
    fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_debug_function() -> String {
        DEFAULT_DEBUG_FUNCTION.to_string()
    }

    fn default_max_iterations() -> u64 {
        10_000
    }

    fn default_check_interval() -> u64 {
        100
    }

    /// Worker started from `program args...`
    pub fn new<I, S>(worker_command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            worker_command: worker_command.into_iter().map(Into::into).collect(),
            transpiler_command: None,
            default_timeout: Self::default_timeout(),
            debug_function_name: Self::default_debug_function(),
            instrument: true,
            memory_management: false,
            max_iterations: Self::default_max_iterations(),
            check_interval: Self::default_check_interval(),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_memory_management(mut self) -> Self {
        self.memory_management = true;
        self
    }

    /// Built-in defaults, relative to the working directory
    pub fn default_for(language: Language) -> Self {
        match language {
            Language::JavaScript | Language::TypeScript => {
                Self::new(["node", "workers/javascript.js"])
            }
            Language::Python => {
                Self::new(["python3", "-u", "workers/python.py"]).with_memory_management()
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_languages() -> BTreeMap<String, LanguageConfig> {
    Language::ALL
        .iter()
        .map(|lang| (lang.as_str().to_string(), LanguageConfig::default_for(*lang)))
        .collect()
}

impl LivepadConfig {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing default file yields the built-in defaults; a missing explicit
    /// path is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::with_default_languages()),
            },
        };

        if !config_path.exists() {
            if explicit {
                bail!("Config file {} does not exist", config_path.display());
            }
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            return Ok(Self::with_default_languages());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config {}", config_path.display()))?;
        tracing::info!(path = %config_path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: LivepadConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// `~/.config/livepad/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("livepad").join("config.toml"))
    }

    /// Defaults including the built-in worker commands
    pub fn with_default_languages() -> Self {
        Self {
            languages: default_languages(),
            ..Self::default()
        }
    }

    /// Configured languages, in a stable order
    pub fn language_configs(&self) -> anyhow::Result<Vec<(Language, LanguageConfig)>> {
        self.languages
            .iter()
            .map(|(name, cfg)| {
                let lang: Language = name.parse().map_err(|e| anyhow!("{}", e))?;
                Ok((lang, cfg.clone()))
            })
            .collect()
    }

    pub fn language(&self, language: Language) -> Option<&LanguageConfig> {
        self.languages.get(language.as_str())
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.k == 0 {
            bail!("cache.k must be at least 1");
        }
        if self.throttle.min_delay > self.throttle.max_delay {
            bail!("throttle.min_delay must not exceed throttle.max_delay");
        }
        if self.throttle.window == 0 {
            bail!("throttle.window must be at least 1");
        }
        let m = &self.memory;
        if !(m.soft_limit_bytes <= m.hard_limit_bytes && m.hard_limit_bytes <= m.critical_limit_bytes)
        {
            bail!("memory limits must satisfy soft <= hard <= critical");
        }
        if self.engine.event_capacity == 0 {
            bail!("engine.event_capacity must be at least 1");
        }
        for (name, cfg) in &self.languages {
            name.parse::<Language>().map_err(|e| anyhow!("{}", e))?;
            if cfg.worker_command.is_empty() {
                bail!("languages.{name}.worker_command must not be empty");
            }
            if cfg.check_interval == 0 {
                bail!("languages.{name}.check_interval must be at least 1");
            }
            if cfg.debug_function_name.is_empty()
                || !cfg
                    .debug_function_name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
            {
                bail!("languages.{name}.debug_function_name must be a plain identifier");
            }
        }
        Ok(())
    }
}
