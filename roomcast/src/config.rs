use std::{
    fs::File,
    path::{Path, PathBuf},
};

use serde::Deserialize;

/// Server configuration, loaded from a YAML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub log_file: String,
    #[serde(default)]
    pub login_key: String,
}

/// One listener plus the filter chain applied to its connections,
/// outermost filter first.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub tls_key: String,
    #[serde(default)]
    pub tls_pem: String,
    #[serde(default)]
    pub tls_insecure: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("open config file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("locate directory of the current executable")]
    ExecutableDir(#[source] std::io::Error),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Open {
            path: path.to_owned(),
            source,
        })?;
        serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// `config.yaml` beside the running executable.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let exe = std::env::current_exe().map_err(ConfigError::ExecutableDir)?;
        let dir = exe
            .parent()
            .ok_or_else(|| ConfigError::ExecutableDir(std::io::ErrorKind::NotFound.into()))?;
        Ok(dir.join("config.yaml"))
    }
}
