//! Listen addresses loaded from a TOML file.
//!
//! ```toml
//! [[listen]]
//! network = "tcp"
//! host = "0.0.0.0"
//! port = 8080
//!
//! [[listen]]
//! network = "unix"
//! sock = "/run/molt/app.sock"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use molt::Address;
use serde::Deserialize;

/// Environment variable naming the config file when `--config` is absent.
pub const ENV_CONFIG: &str = "MOLT_SERVER_CONFIG";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerFile {
    pub listen: Vec<Address>,
}

impl ServerFile {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        let file: ServerFile = toml::from_str(raw)?;
        for address in &file.listen {
            address.check()?;
        }
        Ok(file)
    }

    /// Config path from `MOLT_SERVER_CONFIG`, if set and non-empty.
    pub fn path_from_env() -> Option<PathBuf> {
        std::env::var_os(ENV_CONFIG)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }
}
