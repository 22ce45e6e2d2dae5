//! YAML configuration: process-wide settings plus one entry per
//! synchronizable source. Loaded once at startup and read-only afterwards.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

pub const CONFIG_DIR_NAME: &str = "config";
pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const LOG_DIR_NAME: &str = "logs";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "DEV")]
    pub dev: bool,
    #[serde(rename = "ENABLE_API")]
    pub enable_api: bool,
    #[serde(rename = "API_HOST")]
    pub api_host: String,
    #[serde(rename = "API_PORT")]
    pub api_port: u16,
    #[serde(rename = "API_TOKEN")]
    pub api_token: String,
    #[serde(rename = "WEBHOOK_TOKEN")]
    pub webhook_token: String,
    #[serde(rename = "TELEGRAM_API_KEY")]
    pub telegram_api_key: String,
    #[serde(rename = "TELEGRAM_USER_ID")]
    pub telegram_user_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            dev: false,
            enable_api: false,
            api_host: strmsync_api::DEFAULT_API_HOST.to_owned(),
            api_port: strmsync_api::DEFAULT_API_PORT,
            api_token: String::new(),
            webhook_token: String::new(),
            telegram_api_key: String::new(),
            telegram_user_id: String::new(),
        }
    }
}

/// One synchronizable source. Field names match the YAML keys under
/// `Alist2StrmList`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_source_dir")]
    pub source_dir: String,
    pub target_dir: Utf8PathBuf,
    /// Save every emitted file directly under `target_dir`, without the
    /// remote directory structure. Implies locator files only.
    #[serde(default)]
    pub flatten_mode: bool,
    #[serde(default)]
    pub subtitle: bool,
    #[serde(default)]
    pub image: bool,
    #[serde(default)]
    pub nfo: bool,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub overwrite: bool,
    /// Extra download extensions, comma-separated.
    #[serde(default, alias = "other_ext")]
    pub other_exts: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_downloaders")]
    pub max_downloaders: usize,
    /// Delete local files that the remote no longer has.
    #[serde(default)]
    pub sync_server: bool,
    #[serde(default)]
    pub locator_content_prefix: String,
    #[serde(default)]
    pub cron: Option<String>,
}

fn default_url() -> String {
    "http://localhost:5244".to_owned()
}

fn default_source_dir() -> String {
    "/".to_owned()
}

fn default_mode() -> String {
    "LocatorPublicURL".to_owned()
}

fn default_max_workers() -> usize {
    50
}

fn default_max_downloaders() -> usize {
    5
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "Settings", default)]
    pub settings: Settings,
    #[serde(rename = "Alist2StrmList", default)]
    pub sources: Vec<SourceConfig>,
}

impl ConfigFile {
    pub fn load(path: &Utf8Path) -> Result<ConfigFile, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: ConfigFile =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() {
                return Err(ConfigError::Invalid(
                    "every source needs a non-empty id".to_owned(),
                ));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source id {:?}",
                    source.id
                )));
            }
            if source.target_dir.as_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "source {:?} has an empty target_dir",
                    source.id
                )));
            }
        }
        if self.settings.enable_api && self.settings.api_token.is_empty() {
            return Err(ConfigError::Invalid(
                "ENABLE_API requires a non-empty API_TOKEN".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
Settings:
  DEV: false
  ENABLE_API: true
  API_HOST: 127.0.0.1
  API_PORT: 9001
  API_TOKEN: secret
  WEBHOOK_TOKEN: hook-secret
Alist2StrmList:
  - id: movies
    url: https://alist.example.com
    token: alist-token
    source_dir: /media/movies
    target_dir: /srv/strm/movies
    subtitle: true
    mode: LocatorPublicURL
    sync_server: true
    cron: "0 3 * * *"
  - id: shows
    url: https://alist.example.com
    username: admin
    password: hunter2
    source_dir: /media/shows
    target_dir: /srv/strm/shows
"#;

    #[test]
    fn parses_sample_config() {
        let config: ConfigFile = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert!(config.settings.enable_api);
        assert_eq!(config.settings.api_host, "127.0.0.1");
        assert_eq!(config.sources.len(), 2);

        let movies = &config.sources[0];
        assert_eq!(movies.id, "movies");
        assert!(movies.subtitle);
        assert!(movies.sync_server);
        assert_eq!(movies.cron.as_deref(), Some("0 3 * * *"));
        // defaults fill the omitted fields
        assert_eq!(movies.max_workers, 50);
        assert_eq!(movies.max_downloaders, 5);
        assert!(!movies.overwrite);

        let shows = &config.sources[1];
        assert_eq!(shows.mode, "LocatorPublicURL");
        assert!(shows.cron.is_none());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let yaml = r#"
Alist2StrmList:
  - { id: movies, target_dir: /a }
  - { id: movies, target_dir: /b }
"#;
        let config: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate source id"));
    }

    #[test]
    fn rejects_api_without_token() {
        let yaml = "Settings: { ENABLE_API: true }";
        let config: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_file_is_a_valid_config() {
        let config: ConfigFile = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert!(!config.settings.enable_api);
        assert!(config.sources.is_empty());
    }
}
