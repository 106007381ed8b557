//! Configuration for E621 Downloader
//!
//! This module provides functionality for:
//! 1. Loading `config.toml` (paths, limits, rate, logging, options)
//! 2. Loading `e621.toml` (credentials, defaults and the declared searches)
//! 3. Writing defaults when a file is missing and backing up a broken one
//! 4. Validating the directory tree and fingerprinting the search declarations

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::e621::{ClientConfig, Credentials};
use crate::pipeline::condition::{Condition, ConditionError};
use crate::pipeline::matcher::compile_all;
use crate::pipeline::post::Rating;
use crate::pipeline::spec::{SearchSpec, SearchSpecs};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Directory tree is inconsistent: {0}")]
    Integrity(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error("Invalid condition for '{directory}': {source}")]
    Condition {
        directory: String,
        #[source]
        source: ConditionError,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// config.toml

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Paths {
    pub download_directory: String,
    pub state_directory: String,
    pub log_directory: String,
    pub database_file: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            download_directory: "./downloads".to_string(),
            state_directory: "./state".to_string(),
            log_directory: "./logs".to_string(),
            database_file: "./data/posts.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Limits {
    pub posts_per_page: u32,
    /// Tags sent to the board per search; the rest are checked locally.
    pub max_search_tags: usize,
    pub filename_max_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            posts_per_page: 320,
            max_search_tags: 5,
            filename_max_len: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Pools {
    pub max_download_concurrency: usize,
}

impl Default for Pools {
    fn default() -> Self {
        Self {
            max_download_concurrency: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Rate {
    pub min_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for Rate {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            retry_attempts: 5,
            retry_backoff_ms: 300,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub poll_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { poll_interval_ms: 250 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Options {
    /// Replay the local post store instead of querying e621.
    pub offline: bool,
    /// Store every fetched page in the local post store.
    pub cache_posts: bool,
    pub make_hardlinks: bool,
    /// Delete files in declared directories that this run did not place.
    pub prune_downloads: bool,
    pub include_md5: bool,
    pub filename_format: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Api {
    pub base_url: String,
    pub user_agent: String,
}

impl Default for Api {
    fn default() -> Self {
        Self {
            base_url: "https://e621.net".to_string(),
            user_agent: format!("e621dl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub limits: Limits,
    pub pools: Pools,
    pub rate: Rate,
    pub queue: QueueSettings,
    pub logging: LoggingConfig,
    pub options: Options,
    pub api: Api,
}

impl AppConfig {
    pub fn client_config(&self, auth: &Auth) -> ClientConfig {
        let credentials = (!auth.login.is_empty() && !auth.api_key.is_empty()).then(|| Credentials {
            login: auth.login.clone(),
            api_key: auth.api_key.clone(),
        });
        let user_agent = match &credentials {
            Some(creds) => format!("{} (by {} on e621)", self.api.user_agent, creds.login),
            None => self.api.user_agent.clone(),
        };

        ClientConfig {
            base_url: self.api.base_url.clone(),
            user_agent,
            credentials,
            min_interval: Duration::from_millis(self.rate.min_interval_ms),
            retry_attempts: self.rate.retry_attempts,
            retry_backoff: Duration::from_millis(self.rate.retry_backoff_ms),
            timeout: Duration::from_secs(self.rate.timeout_secs),
        }
    }
}

// e621.toml

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Auth {
    pub login: String,
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Defaults {
    pub days: u32,
    pub ratings: Vec<String>,
    pub min_score: i64,
    pub min_favs: u64,
    pub post_limit: Option<u64>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            days: 1,
            ratings: vec!["s".to_string()],
            min_score: i64::MIN,
            min_favs: 0,
            post_limit: None,
        }
    }
}

/// One `[[search]]` table. Unset values fall back to `[defaults]`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SearchEntry {
    pub directory: String,
    pub tags: Vec<String>,
    pub blacklist: Vec<String>,
    pub anylist: Vec<String>,
    pub condition: Option<String>,
    pub days: Option<u32>,
    pub ratings: Option<Vec<String>>,
    pub min_score: Option<i64>,
    pub min_favs: Option<u64>,
    pub post_limit: Option<u64>,
    pub subdirectories: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct E621Config {
    /// Applied to every search.
    pub blacklist: Vec<String>,
    /// Post ids that are never downloaded.
    pub blocked_posts: Vec<u64>,
    pub auth: Auth,
    pub defaults: Defaults,
    #[serde(rename = "search")]
    pub searches: Vec<SearchEntry>,
}

impl Default for E621Config {
    fn default() -> Self {
        Self {
            blacklist: vec!["gore".to_string()],
            blocked_posts: Vec::new(),
            auth: Auth::default(),
            defaults: Defaults::default(),
            searches: vec![
                SearchEntry {
                    directory: "Cats".to_string(),
                    tags: vec!["cat".to_string()],
                    subdirectories: vec!["Kittens".to_string()],
                    ..SearchEntry::default()
                },
                SearchEntry {
                    directory: "Kittens".to_string(),
                    tags: vec!["cat".to_string(), "sleeping".to_string()],
                    post_limit: Some(20),
                    ..SearchEntry::default()
                },
            ],
        }
    }
}

impl E621Config {
    /// Checks everything that can be checked before going online.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut declared = HashSet::new();
        for entry in &self.searches {
            if entry.directory.trim().is_empty() {
                return Err(ConfigError::Invalid("a search has an empty directory name".to_string()));
            }
            if !declared.insert(entry.directory.as_str()) {
                return Err(ConfigError::Integrity(format!(
                    "directory '{}' is declared twice",
                    entry.directory
                )));
            }
        }

        for entry in &self.searches {
            for child in &entry.subdirectories {
                if !declared.contains(child.as_str()) {
                    return Err(ConfigError::Integrity(format!(
                        "'{}' lists subdirectory '{}', which is not declared",
                        entry.directory, child
                    )));
                }
            }
            self.ratings_for(entry)?;
            parse_condition(entry)?;
        }

        if self.defaults.days == 0 || self.searches.iter().any(|s| s.days == Some(0)) {
            return Err(ConfigError::Invalid("days must be at least 1".to_string()));
        }
        Ok(())
    }

    fn ratings_for(&self, entry: &SearchEntry) -> ConfigResult<BTreeSet<Rating>> {
        entry
            .ratings
            .as_ref()
            .unwrap_or(&self.defaults.ratings)
            .iter()
            .map(|r| r.parse::<Rating>().map_err(ConfigError::Invalid))
            .collect()
    }

    pub fn days_for(&self, entry: &SearchEntry) -> u32 {
        entry.days.unwrap_or(self.defaults.days)
    }

    /// Every tag that needs alias resolution, lowercased.
    pub fn tags_to_resolve(&self) -> BTreeSet<String> {
        self.searches
            .iter()
            .flat_map(|s| s.tags.iter().chain(&s.blacklist).chain(&s.anylist))
            .chain(&self.blacklist)
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Compiles the declared searches, replacing tags through `canonical`.
    /// Tags mapped to an empty string are dropped.
    pub fn build_specs(&self, canonical: &HashMap<String, String>) -> ConfigResult<SearchSpecs> {
        let resolve = |tags: &[String]| -> Vec<String> {
            tags.iter()
                .map(|t| {
                    let key = t.trim().to_lowercase();
                    canonical.get(&key).cloned().unwrap_or(key)
                })
                .filter(|t| !t.is_empty())
                .collect()
        };

        let global_blacklist = compile_all(resolve(&self.blacklist));

        let mut specs = Vec::with_capacity(self.searches.len());
        for entry in &self.searches {
            let spec = SearchSpec::new(entry.directory.clone())
                .whitelist(resolve(&entry.tags))
                .blacklist(resolve(&entry.blacklist))
                .anylist(resolve(&entry.anylist))
                .condition(parse_condition(entry)?)
                .inherit_blacklist(&global_blacklist)
                .ratings(self.ratings_for(entry)?)
                .min_score(entry.min_score.unwrap_or(self.defaults.min_score))
                .min_favs(entry.min_favs.unwrap_or(self.defaults.min_favs))
                .max_days_ago(i64::from(self.days_for(entry)))
                .post_limit(entry.post_limit.or(self.defaults.post_limit))
                .subdirectories(entry.subdirectories.iter().cloned());
            specs.push(spec);
        }
        Ok(SearchSpecs::new(specs))
    }

    /// BLAKE3 of the canonical serialization, credentials excluded, so only
    /// changes to what is searched invalidate saved progress.
    pub fn fingerprint(&self) -> ConfigResult<String> {
        let mut canonical = self.clone();
        canonical.auth = Auth::default();
        let serialized = toml::to_string(&canonical)?;
        Ok(blake3::hash(serialized.as_bytes()).to_hex().to_string())
    }
}

fn parse_condition(entry: &SearchEntry) -> ConfigResult<Option<Condition>> {
    match entry.condition.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(source) => Condition::parse(source)
            .map(Some)
            .map_err(|source| ConfigError::Condition {
                directory: entry.directory.clone(),
                source,
            }),
    }
}

/// Loads both configuration files from one directory.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    app_config: AppConfig,
    e621_config: E621Config,
    config_dir: PathBuf,
    created_e621_config: bool,
}

impl ConfigManager {
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir)?;
        let e621_path = config_dir.join("e621.toml");
        let created_e621_config = !e621_path.exists();
        let e621_config = Self::load_e621_config(&e621_path)?;

        Ok(Self {
            app_config,
            e621_config,
            config_dir,
            created_e621_config,
        })
    }

    fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join("config.toml");

        if !config_path.exists() {
            warn!("Config file not found, writing defaults to {}", config_path.display());
            let default_config = AppConfig::default();
            fs::write(&config_path, toml::to_string_pretty(&default_config)?)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse config.toml: {}", e);
                info!("Backing up old config and creating new one with default values");

                if let Err(backup_err) = fs::rename(&config_path, config_path.with_extension("toml.backup")) {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                fs::write(&config_path, toml::to_string_pretty(&default_config)?)?;
                Ok(default_config)
            }
        }
    }

    // A broken e621.toml is an error: replacing it would silently change what gets downloaded.
    fn load_e621_config(config_path: &Path) -> ConfigResult<E621Config> {
        if !config_path.exists() {
            warn!("Search config not found, writing an example to {}", config_path.display());
            let default_config = E621Config::default();
            fs::write(config_path, toml::to_string_pretty(&default_config)?)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(config_path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    pub fn e621_config(&self) -> &E621Config {
        &self.e621_config
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// True when `e621.toml` did not exist and an example was written.
    pub fn created_e621_config(&self) -> bool {
        self.created_e621_config
    }

    /// Queue state file for this configuration.
    pub fn state_file(&self) -> PathBuf {
        Path::new(&self.app_config.paths.state_directory).join("e621.queue.json")
    }
}
