use crate::debugger::error::Error;
use crate::muted_error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

/// Debugger configuration, shared by workers and proxies of one server group.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of the global breakpoint tables, fixed when the shared
    /// region is created.
    pub global_breakpoint_count: usize,
    /// File backing the shared region.
    pub region_path: PathBuf,
    pub attach: AttachConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global_breakpoint_count: 20,
            region_path: std::env::temp_dir().join("pldbg-breakpoints"),
            attach: AttachConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Host a worker binds when it waits for a proxy.
    pub listen_host: String,
    /// Host a worker dials when a global breakpoint names a proxy port.
    pub proxy_host: String,
    /// Abort the handshake when a proxy refuses the worker's credentials.
    /// When unset the refusal is logged and the handshake goes on.
    pub strict_proxy_auth: bool,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            proxy_host: "127.0.0.1".to_string(),
            strict_proxy_auth: false,
        }
    }
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/pldbg/config.toml";

    /// Load configuration from file.
    ///
    /// Without explicit path `~/.config/pldbg/config.toml` is used, a missing
    /// default file gives the default configuration.
    pub fn from_file(path: Option<&Path>) -> Result<Self, Error> {
        let (path, data) = match path {
            None => {
                let Some(path) = home::home_dir().map(|home| home.join(Self::DEFAULT_PATH))
                else {
                    return Ok(Self::default());
                };
                let Some(data) = muted_error!(read_to_string(&path)) else {
                    return Ok(Self::default());
                };
                (path, data)
            }
            Some(path) => {
                let data = read_to_string(path)
                    .map_err(|e| Error::ConfigRead(path.display().to_string(), e))?;
                (path.to_path_buf(), data)
            }
        };

        Self::parse(&data).map_err(|e| match e {
            Error::ConfigParse(_, e) => Error::ConfigParse(path.display().to_string(), e),
            e => e,
        })
    }

    /// Parse configuration from a TOML document.
    pub fn parse(data: &str) -> Result<Self, Error> {
        toml::de::from_str(data).map_err(|e| Error::ConfigParse(String::new(), e))
    }
}
