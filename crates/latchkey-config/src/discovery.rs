//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `<config_dir>/config.toml` (`LATCHKEY_CONFIG_DIR`, else the platform config dir)
//! 2. `./latchkey.toml` (project-local)
//! 3. `LATCHKEY_CLIENT_ID` / `LATCHKEY_BACKEND` environment variables
//! 4. CLI arguments (handled externally)

use std::path::{Path, PathBuf};

use crate::{BackendKind, ClientConfig, ConfigError, FlowSection, LatchkeyConfig, Result};

const PROJECT_CONFIG_FILE: &str = "latchkey.toml";

const USER_CONFIG_FILE: &str = "config.toml";

const APP_NAME: &str = "latchkey";

/// Environment variable to override the config directory.
pub const CONFIG_DIR_ENV: &str = "LATCHKEY_CONFIG_DIR";

/// Overrides `[client] client_id`.
pub const CLIENT_ID_ENV: &str = "LATCHKEY_CLIENT_ID";

/// Overrides `[flow] backend`.
pub const BACKEND_ENV: &str = "LATCHKEY_BACKEND";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: LatchkeyConfig,
    /// Sources that were checked, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Problems that did not stop loading (e.g., an unparseable layer).
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Discover, merge, and apply environment overrides.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], but `config_dir` replaces both `LATCHKEY_CONFIG_DIR`
/// and the platform default when given.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = LatchkeyConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_config_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => xdg_config_path(),
    };
    if let Some(path) = user_config_path {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut config, &project_path, &mut warnings));

    apply_env_overrides(&mut config)?;

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<LatchkeyConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    LatchkeyConfig::from_toml(&contents)
}

/// Path of the user config file.
pub fn xdg_config_path() -> Option<PathBuf> {
    xdg_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// The user config directory.
///
/// Checks `LATCHKEY_CONFIG_DIR` first, then falls back to the platform default
/// (`~/.config/latchkey` on Linux, `~/Library/Application Support/latchkey` on macOS).
pub fn xdg_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Apply `LATCHKEY_CLIENT_ID` and `LATCHKEY_BACKEND` from the process environment.
pub fn apply_env_overrides(config: &mut LatchkeyConfig) -> Result<()> {
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides(
    config: &mut LatchkeyConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(client_id) = lookup(CLIENT_ID_ENV).filter(|v| !v.is_empty()) {
        config
            .client
            .get_or_insert_with(ClientConfig::default)
            .client_id = Some(client_id);
    }
    if let Some(backend) = lookup(BACKEND_ENV).filter(|v| !v.is_empty()) {
        let backend: BackendKind = backend.parse()?;
        config.flow.get_or_insert_with(FlowSection::default).backend = backend;
    }
    Ok(())
}

fn load_layer(config: &mut LatchkeyConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    if !path.is_file() {
        return ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        };
    }

    let loaded = match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            true
        }
        Err(e) => {
            warnings.push(format!("Failed to load {}: {}", path.display(), e));
            false
        }
    };
    ConfigSource {
        path: path.to_path_buf(),
        loaded,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
