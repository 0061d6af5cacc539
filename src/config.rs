//! Configuration Management
//!
//! Handles persistent configuration storage for graphrecon.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default API root
pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/beta";

/// Default per-call timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// User configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// API root URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-call HTTP timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// User agent sent with every request
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Directories holding resource declarations
    #[serde(default)]
    pub spec_dirs: Vec<PathBuf>,
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("graphrecon").join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    /// Get effective base URL (CLI > config > default)
    pub fn effective_base_url(&self, cli: Option<&str>) -> String {
        cli.map(str::to_string)
            .or_else(|| self.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Get effective per-call timeout
    pub fn effective_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Get effective user agent
    pub fn effective_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("graphrecon/{}", env!("CARGO_PKG_VERSION")))
    }

    /// Get effective declaration directories (CLI entries first)
    pub fn effective_spec_dirs(&self, cli: &[PathBuf]) -> Vec<PathBuf> {
        let mut all: Vec<PathBuf> = cli.to_vec();
        for dir in &self.spec_dirs {
            if !all.contains(dir) {
                all.push(dir.clone());
            }
        }
        if all.is_empty() {
            if let Some(default) = dirs::config_dir().map(|p| p.join("graphrecon").join("resources")) {
                all.push(default);
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_values() {
        let config = Config {
            base_url: Some("https://example.com/v1".into()),
            timeout_secs: Some(5),
            user_agent: None,
            spec_dirs: vec![PathBuf::from("/a")],
        };
        assert_eq!(config.effective_base_url(None), "https://example.com/v1");
        assert_eq!(config.effective_base_url(Some("http://x")), "http://x");
        assert_eq!(config.effective_timeout(), Duration::from_secs(5));
        assert!(config.effective_user_agent().starts_with("graphrecon/"));
        assert_eq!(
            config.effective_spec_dirs(&[PathBuf::from("/b"), PathBuf::from("/a")]),
            vec![PathBuf::from("/b"), PathBuf::from("/a")]
        );
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.effective_base_url(None), DEFAULT_BASE_URL);
        assert_eq!(config.effective_timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }
}
