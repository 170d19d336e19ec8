//! Configuration Vault – reads/writes `~/.lucy/config.toml`.

use lucy_bridge::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted operator configuration stored in `~/.lucy/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// rosbridge URL used when `/connect` is given no argument and no
    /// connection has succeeded yet.
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    /// Last URL a connect or reconnect succeeded against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_url: Option<String>,

    /// Show bridge activity logs. When off only warnings and errors print.
    #[serde(default)]
    pub enable_logs: bool,

    /// Period of the joint-state publish loop started by `/send on`.
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,

    #[serde(default)]
    pub bridge: BridgeConfig,
}

fn default_bridge_url() -> String {
    "wss://localhost:9090".to_string()
}
fn default_publish_interval_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            last_url: None,
            enable_logs: false,
            publish_interval_ms: default_publish_interval_ms(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl Config {
    /// URL to use when the operator does not name one.
    pub fn preferred_url(&self) -> &str {
        self.last_url.as_deref().unwrap_or(&self.bridge_url)
    }
}

/// Return the path to `~/.lucy/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".lucy").join("config.toml")
}

/// Load the config from disk with `LUCY_*` overrides applied.  Returns
/// `None` if the file does not exist.
///
/// The result is for running with; never write it back, or one-off
/// overrides become permanent.  Edit the file through `read_from`.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    let mut cfg = read_from(path)?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// The file contents exactly as stored, without environment overrides.
pub(crate) fn read_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `LUCY_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `LUCY_BRIDGE_URL` | `bridge_url` |
/// | `LUCY_ENABLE_LOGS` | `enable_logs` (`1`/`true`/`on`) |
/// | `LUCY_CONNECT_TIMEOUT_MS` | `bridge.connect_timeout_ms` |
/// | `LUCY_PUBLISH_INTERVAL_MS` | `publish_interval_ms` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Apply overrides looked up by variable name.
pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("LUCY_BRIDGE_URL")
        && !v.trim().is_empty()
    {
        cfg.bridge_url = v.trim().to_string();
    }
    if let Some(v) = lookup("LUCY_ENABLE_LOGS")
        && let Some(flag) = parse_flag(&v)
    {
        cfg.enable_logs = flag;
    }
    if let Some(v) = lookup("LUCY_CONNECT_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
        && ms > 0
    {
        cfg.bridge.connect_timeout_ms = ms;
    }
    if let Some(v) = lookup("LUCY_PUBLISH_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
        && ms > 0
    {
        cfg.publish_interval_ms = ms;
    }
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Save the config to disk, creating `~/.lucy/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner-only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

/// Record `url` as the last URL that worked.
pub fn remember_url(url: &str) -> Result<(), String> {
    remember_url_at(&config_path(), url)
}

pub(crate) fn remember_url_at(path: &Path, url: &str) -> Result<(), String> {
    let mut cfg = read_from(path)?.unwrap_or_default();
    cfg.last_url = Some(url.to_string());
    save_to(&cfg, path)
}
