//! CLI configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/panbd/config.toml`
//! - Windows: `%APPDATA%/panbd/config.toml`
//!
//! Credentials and application keys may also come from `BAIDU_*`
//! environment variables, which take precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use panbd_transfer::{RetryPolicy, TokenGrant};

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Download block size in MiB (1 to 100).
    #[serde(default = "default_block_size_mib")]
    pub block_size_mib: u64,

    /// Worker pool size; unset picks one less than the CPU count.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Attempts per chunk before the transfer is interrupted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_min_delay_ms")]
    pub retry_min_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Naming-conflict policy for uploads (`rtype`).
    #[serde(default = "default_rename_policy")]
    pub rename_policy: u8,

    /// Uploads are confined to `/apps/{app_name}`.
    #[serde(default)]
    pub app_name: String,

    #[serde(default)]
    pub app_key: String,

    #[serde(default)]
    pub secret_key: String,

    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_block_size_mib() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_min_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_rename_policy() -> u8 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size_mib: default_block_size_mib(),
            workers: None,
            max_attempts: default_max_attempts(),
            retry_min_delay_ms: default_retry_min_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            rename_policy: default_rename_policy(),
            app_name: String::new(),
            app_key: String::new(),
            secret_key: String::new(),
            access_token: String::new(),
            refresh_token: None,
            expires_at: None,
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or creates a default file if not found.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Tokens live in this file.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Applies `BAIDU_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(token) = get("BAIDU_ACCESS_TOKEN") {
            self.access_token = token;
        }
        if let Some(token) = get("BAIDU_REFRESH_TOKEN") {
            self.refresh_token = Some(token);
        }
        if let Some(raw) = get("BAIDU_EXPIREDAT") {
            let at = DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("BAIDU_EXPIREDAT is not RFC 3339: {raw}"))?;
            self.expires_at = Some(at.with_timezone(&Utc));
        }
        if let Some(key) = get("BAIDU_API_APPKEY") {
            self.app_key = key;
        }
        if let Some(key) = get("BAIDU_API_SECRETKEY") {
            self.secret_key = key;
        }
        if let Some(name) = get("BAIDU_APPNAME") {
            self.app_name = name;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> anyhow::Result<RetryPolicy> {
        anyhow::ensure!(self.max_attempts >= 1, "max_attempts must be at least 1");
        anyhow::ensure!(
            self.retry_min_delay_ms <= self.retry_max_delay_ms,
            "retry_min_delay_ms must not exceed retry_max_delay_ms"
        );
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            min_delay: Duration::from_millis(self.retry_min_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        })
    }

    /// The stored token grant, or `None` when no access token is configured.
    pub fn grant(&self) -> Option<TokenGrant> {
        if self.access_token.is_empty() {
            return None;
        }
        Some(TokenGrant {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
        })
    }

    /// Stores a refreshed grant. Returns `true` if anything changed.
    pub fn update_grant(&mut self, grant: &TokenGrant) -> bool {
        let changed = self.access_token != grant.access_token
            || self.refresh_token != grant.refresh_token
            || self.expires_at != grant.expires_at;
        if changed {
            self.access_token = grant.access_token.clone();
            self.refresh_token = grant.refresh_token.clone();
            self.expires_at = grant.expires_at;
        }
        changed
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("panbd").join("config.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("panbd")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.block_size_mib, 10);
        assert_eq!(config.workers, None);
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.rename_policy, 1);
        assert!(config.grant().is_none());
    }

    #[test]
    fn config_partial_toml() {
        let config: Config = toml::from_str("block_size_mib = 20\nworkers = 4").unwrap();
        assert_eq!(config.block_size_mib, 20);
        assert_eq!(config.workers, Some(4));
        assert_eq!(config.retry_max_delay_ms, 5000);
    }

    #[test]
    fn load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let config = Config {
            app_name: "demo".into(),
            access_token: "at".into(),
            expires_at: Some(Utc::now()),
            ..Config::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.app_name, "demo");
        assert_eq!(loaded.access_token, "at");
        assert!(loaded.expires_at.is_some());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BAIDU_ACCESS_TOKEN", "env-at"),
            ("BAIDU_REFRESH_TOKEN", "env-rt"),
            ("BAIDU_EXPIREDAT", "2030-01-02T03:04:05+08:00"),
            ("BAIDU_APPNAME", "envapp"),
            ("BAIDU_API_APPKEY", ""),
        ]);
        let mut config = Config {
            access_token: "file-at".into(),
            app_key: "file-key".into(),
            ..Config::default()
        };
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.access_token, "env-at");
        assert_eq!(config.refresh_token.as_deref(), Some("env-rt"));
        assert_eq!(config.app_name, "envapp");
        // Empty variables do not override.
        assert_eq!(config.app_key, "file-key");
        let expires = config.expires_at.unwrap();
        assert_eq!(expires.to_rfc3339(), "2030-01-01T19:04:05+00:00");
    }

    #[test]
    fn bad_expiry_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(|k| (k == "BAIDU_EXPIREDAT").then(|| "tomorrow".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("BAIDU_EXPIREDAT"));
    }

    #[test]
    fn retry_policy_from_config() {
        let config = Config {
            max_attempts: 3,
            retry_min_delay_ms: 10,
            retry_max_delay_ms: 20,
            ..Config::default()
        };
        let policy = config.retry_policy().unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.min_delay, Duration::from_millis(10));

        let inverted = Config {
            retry_min_delay_ms: 30,
            ..config
        };
        assert!(inverted.retry_policy().is_err());
    }

    #[test]
    fn update_grant_reports_changes() {
        let mut config = Config {
            access_token: "old".into(),
            ..Config::default()
        };
        let same = config.grant().unwrap();
        assert!(!config.update_grant(&same));

        let fresh = TokenGrant {
            access_token: "new".into(),
            refresh_token: Some("rt".into()),
            expires_at: None,
        };
        assert!(config.update_grant(&fresh));
        assert_eq!(config.access_token, "new");
    }

    #[test]
    fn config_path_not_empty() {
        assert!(config_path().to_string_lossy().contains("panbd"));
    }
}
