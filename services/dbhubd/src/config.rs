//! Static startup configuration loading.
//!
//! TOML is the sole static config source; no environment variable overrides.
//! Default config path: `/etc/dbhubd/dbhubd.toml`. This is distinct from the
//! persisted runtime state file (see [`crate::control`]), which is
//! machine-written JSON and survives reconfiguration, not human-authored.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct DbhubdConfig {
    pub server: ServerConfig,
    pub control: ControlConfig,
    pub databases: Vec<DatabaseConfig>,
    pub remotes: Vec<RemoteConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_sessions: u32,
    pub status_db: String,
    pub status_table: String,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub socket_path: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    control: Option<RawControlConfig>,
    databases: Option<Vec<RawDatabaseConfig>>,
    remotes: Option<Vec<RawRemoteConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    max_sessions: Option<u32>,
    status_db: Option<String>,
    status_table: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawControlConfig {
    socket_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDatabaseConfig {
    name: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRemoteConfig {
    name: Option<String>,
}

pub fn load_config_from_path(path: &Path) -> Result<DbhubdConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<DbhubdConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/dbhubd/dbhubd.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<DbhubdConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let server = match raw.server {
        Some(s) => ServerConfig {
            max_sessions: s.max_sessions.unwrap_or(64),
            status_db: s.status_db.unwrap_or_else(|| "_dbhubd".to_owned()),
            status_table: s.status_table.unwrap_or_else(|| "remote_status".to_owned()),
        },
        None => ServerConfig { max_sessions: 64, status_db: "_dbhubd".to_owned(), status_table: "remote_status".to_owned() },
    };

    let control = match raw.control {
        Some(c) => ControlConfig { socket_path: c.socket_path.unwrap_or_else(|| "/run/dbhubd/ctl".to_owned()) },
        None => ControlConfig { socket_path: "/run/dbhubd/ctl".to_owned() },
    };

    let mut databases = Vec::new();
    for (i, d) in raw.databases.unwrap_or_default().into_iter().enumerate() {
        let name = d.name.ok_or_else(|| ConfigError::MissingField(format!("databases[{}].name", i)))?;
        let path = d.path.ok_or_else(|| ConfigError::MissingField(format!("databases[{}].path", i)))?;
        databases.push(DatabaseConfig { name, path });
    }

    let mut remotes = Vec::new();
    for (i, r) in raw.remotes.unwrap_or_default().into_iter().enumerate() {
        let name = r.name.ok_or_else(|| ConfigError::MissingField(format!("remotes[{}].name", i)))?;
        remotes.push(RemoteConfig { name });
    }

    Ok(DbhubdConfig { server, control, databases, remotes })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
}
