use anyhow::Context;
use tokio::fs;
use tokio::net::TcpListener;
use tracing::info;

use crate::models::extension_model::ServerConfig;

pub const DEFAULT_CONFIG_PATH: &str = "physio.json";

pub async fn load_config(path: &str) -> anyhow::Result<ServerConfig> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("File read error: {path}"))?;

    let config: ServerConfig =
        serde_json::from_str(&data).with_context(|| format!("JSON parse error: {path}"))?;
    config.store.validate()?;
    Ok(config)
}

/// Binds the listener and writes the actual port back into the config, so a
/// configured port of 0 reports the one the OS picked.
pub async fn bind(config: &mut ServerConfig) -> anyhow::Result<TcpListener> {
    let bind_addr = format!("{}:{}", config.connection.ip, config.connection.port);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Bind failed: {bind_addr}"))?;

    let actual_port = listener.local_addr().context("Addr error")?.port();
    config.connection.port = actual_port;

    info!("Listening on {}:{}", config.connection.ip, actual_port);
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_config_and_bind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("physio.json");
        std::fs::write(
            &path,
            r#"{
                "name": "physio-store",
                "version": "0.1.0",
                "connection": {"ip": "127.0.0.1", "port": 0},
                "store": {"chunk_span_secs": 600}
            }"#,
        )
        .unwrap();

        let mut config = load_config(path.to_str().unwrap()).await.unwrap();
        assert_eq!(config.store.chunk_span_secs, 600);
        assert_eq!(config.store.default_max_points, 2000);
        assert_eq!(config.level(), tracing::Level::INFO);

        let _listener = bind(&mut config).await.unwrap();
        assert_ne!(config.connection.port, 0);
    }

    #[tokio::test]
    async fn test_invalid_store_config_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("physio.json");
        std::fs::write(
            &path,
            r#"{"name": "x", "version": "0", "connection": {"ip": "127.0.0.1", "port": 0},
                "store": {"workers": 0}}"#,
        )
        .unwrap();
        assert!(load_config(path.to_str().unwrap()).await.is_err());
        assert!(load_config("does-not-exist.json").await.is_err());
    }
}
