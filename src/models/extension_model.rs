use serde::{Deserialize, Serialize};
use tracing::Level;

use physio_store::StoreConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub connection: Connection,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub ip: String,
    pub port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Falls back to INFO on an unknown level name.
    pub fn level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }
}
