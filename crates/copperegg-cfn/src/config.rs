// Configuration loading and parsing (copperegg.toml, credentials.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_API_URL: &str = "https://api.copperegg.com";
pub const DEFAULT_REVEALCLOUD_INDEX_PATH: &str = "/v2/revealcloud/systems.json?show_hidden=1";
pub const DEFAULT_REVEALCLOUD_DELETE_PATH: &str = "/v2/revealcloud/uuids";
pub const DEFAULT_REVEALUPTIME_CREATE_PATH: &str = "/v2/revealuptime/probes.json";
pub const DEFAULT_REVEALUPTIME_DELETE_PATH: &str = "/v2/revealuptime/probes";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LISTENER_PORT: u16 = 9101;

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub copperegg: CoppereggConfig,
    pub credentials: CredentialsConfig,
    pub listener_port: u16,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.copperegg.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            copperegg: CoppereggConfig::default(),
            credentials: CredentialsConfig::default(),
            listener_port: DEFAULT_LISTENER_PORT,
        }
    }
}

// ---------------------------------------------------------------------------
// copperegg.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire copperegg.toml file.
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    copperegg: CoppereggConfig,
    #[serde(default)]
    listener: ListenerSection,
}

#[derive(Debug, Clone, Deserialize)]
struct ListenerSection {
    #[serde(default = "default_listener_port")]
    port: u16,
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_LISTENER_PORT,
        }
    }
}

fn default_listener_port() -> u16 {
    DEFAULT_LISTENER_PORT
}

/// Endpoints and paths for the two CopperEgg products we talk to.
///
/// RevealCloud tracks monitored servers; RevealUptime owns the probes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoppereggConfig {
    pub revealcloud_url: String,
    pub revealcloud_index_path: String,
    pub revealcloud_delete_path: String,
    pub revealuptime_url: String,
    pub revealuptime_create_path: String,
    pub revealuptime_delete_path: String,
    pub request_timeout_secs: u64,
}

impl Default for CoppereggConfig {
    fn default() -> Self {
        Self {
            revealcloud_url: DEFAULT_API_URL.to_string(),
            revealcloud_index_path: DEFAULT_REVEALCLOUD_INDEX_PATH.to_string(),
            revealcloud_delete_path: DEFAULT_REVEALCLOUD_DELETE_PATH.to_string(),
            revealuptime_url: DEFAULT_API_URL.to_string(),
            revealuptime_create_path: DEFAULT_REVEALUPTIME_CREATE_PATH.to_string(),
            revealuptime_delete_path: DEFAULT_REVEALUPTIME_DELETE_PATH.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub revealcloud_username: Option<String>,
    pub revealcloud_password: Option<String>,
    pub revealuptime_username: Option<String>,
    pub revealuptime_password: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/copperegg.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// Does not copy defaults; `load_config()` handles that.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- copperegg.toml (required) ---
    let main_path = config_dir.join("copperegg.toml");
    let main_text = read_file(&main_path)?;
    let file: ConfigFile = toml::from_str(&main_text).map_err(|e| ConfigError::ParseError {
        path: main_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        copperegg: file.copperegg,
        credentials,
        listener_port: file.listener.port,
    };

    validate(&config)?;

    Ok(config)
}

/// Files read by `load_config_from`. `credentials.toml` only ships as an
/// `.example`, so it is seeded only when an operator drops a real one into
/// `defaults/`.
const CONFIG_FILES: [&str; 2] = ["copperegg.toml", "credentials.toml"];

/// Seed `config/` with whichever of `CONFIG_FILES` it lacks, taken from
/// `defaults/`. Existing files are never overwritten. Returns the paths that
/// were written.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");
    let copy_error = |message: String| ConfigError::DefaultsCopyError { message };

    if !defaults_dir.is_dir() && !config_dir.is_dir() {
        return Err(copy_error(format!(
            "neither defaults/ nor config/ directory found in {}",
            base_dir.display()
        )));
    }

    let mut seeded = Vec::new();
    for name in CONFIG_FILES {
        let source = defaults_dir.join(name);
        let target = config_dir.join(name);
        if target.exists() || !source.is_file() {
            continue;
        }
        std::fs::create_dir_all(&config_dir)
            .map_err(|e| copy_error(format!("cannot create {}: {e}", config_dir.display())))?;
        std::fs::copy(&source, &target).map_err(|e| {
            copy_error(format!(
                "cannot copy {} to {}: {e}",
                source.display(),
                target.display()
            ))
        })?;
        seeded.push(target);
    }

    Ok(seeded)
}

/// Loads config relative to the current working directory, copying default
/// config files in first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let c = &config.copperegg;

    let url_fields: &[(&str, &str)] = &[
        ("copperegg.revealcloud_url", c.revealcloud_url.as_str()),
        ("copperegg.revealuptime_url", c.revealuptime_url.as_str()),
    ];
    for (name, val) in url_fields {
        match reqwest::Url::parse(val) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => {
                return Err(ConfigError::ValidationError {
                    field: name.to_string(),
                    message: format!("unsupported scheme `{}`", url.scheme()),
                });
            }
            Err(e) => {
                return Err(ConfigError::ValidationError {
                    field: name.to_string(),
                    message: format!("invalid url `{val}`: {e}"),
                });
            }
        }
    }

    let path_fields: &[(&str, &str)] = &[
        ("copperegg.revealcloud_index_path", c.revealcloud_index_path.as_str()),
        ("copperegg.revealcloud_delete_path", c.revealcloud_delete_path.as_str()),
        ("copperegg.revealuptime_create_path", c.revealuptime_create_path.as_str()),
        ("copperegg.revealuptime_delete_path", c.revealuptime_delete_path.as_str()),
    ];
    for (name, val) in path_fields {
        if !val.starts_with('/') {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: format!("must start with `/`, got `{val}`"),
            });
        }
    }

    if c.request_timeout_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "copperegg.request_timeout_secs".into(),
            message: "must be greater than 0".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
