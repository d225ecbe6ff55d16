//! HTTP server commands: `code-agent serve` and `code-agent init`.

use std::path::PathBuf;

use anyhow::Result;
use code_agent::config::AppConfig;
use code_agent::factory::server::{ServerConfig, open_database, start_server};

pub async fn cmd_serve(
    config: AppConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let server = ServerConfig {
        port: port.unwrap_or(config.server.port),
        db_path: db_path.unwrap_or_else(|| config.server.db_path.clone()),
        dev_mode: dev,
    };
    start_server(server, config).await
}

pub fn cmd_init(config: &AppConfig, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
    open_database(&db_path)?;
    println!("Database initialized at {}", db_path.display());
    Ok(())
}
