use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Tunables for the bridge and the store. Every field has a default, so a partial file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub call_timeout_ms: u64,
    pub slow_call_warn_ms: u64,
    /// Extension version the page was built against; compared by exact string match.
    pub required_version: String,
    pub page_size: usize,
    pub probe_interval_ms: u64,
    pub probe_ceiling_ms: u64,
    pub new_entries_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            slow_call_warn_ms: 2_000,
            required_version: "1.0.0".to_string(),
            page_size: 20,
            probe_interval_ms: 200,
            probe_ceiling_ms: 10_000,
            new_entries_interval_ms: 10_000,
        }
    }
}

impl HubConfig {
    /// Load from `path`, else from the platform config dir, else defaults; then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };
        let mut cfg = match file {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config: {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_parse("IVEHUB_CALL_TIMEOUT_MS") { self.call_timeout_ms = v; }
        if let Some(v) = env_parse("IVEHUB_PAGE_SIZE") { self.page_size = v; }
        if let Some(v) = env_parse("IVEHUB_PROBE_CEILING_MS") { self.probe_ceiling_ms = v; }
        if let Ok(v) = std::env::var("IVEHUB_REQUIRED_VERSION") {
            if !v.trim().is_empty() { self.required_version = v.trim().to_string(); }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 { bail!("page_size must be at least 1"); }
        if self.call_timeout_ms == 0 { bail!("call_timeout_ms must be positive"); }
        if self.probe_interval_ms == 0 || self.new_entries_interval_ms == 0 {
            bail!("poll intervals must be positive");
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration { Duration::from_millis(self.call_timeout_ms) }
    pub fn slow_call_warn(&self) -> Duration { Duration::from_millis(self.slow_call_warn_ms) }
    pub fn probe_interval(&self) -> Duration { Duration::from_millis(self.probe_interval_ms) }
    pub fn probe_ceiling(&self) -> Duration { Duration::from_millis(self.probe_ceiling_ms) }
    pub fn new_entries_interval(&self) -> Duration { Duration::from_millis(self.new_entries_interval_ms) }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "iveplay", "ivehub").map(|p| p.config_dir().join("ivehub.toml"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
