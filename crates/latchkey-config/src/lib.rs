//! Configuration for latchkey.
//!
//! TOML config with one section per concern (`[client]`, `[loopback]`,
//! `[scheme]`, `[flow]`), layered from the user config dir and a
//! project-local `latchkey.toml`, then environment overrides.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    BACKEND_ENV, CLIENT_ID_ENV, CONFIG_DIR_ENV, ConfigSource, LoadedConfig, apply_env_overrides,
    load_config, load_config_file, load_config_with_options, xdg_config_dir,
    xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
