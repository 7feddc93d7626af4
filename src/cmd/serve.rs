use anyhow::Result;
use commsync::config::ServerConfig;
use commsync::server;

pub async fn cmd_serve(config: ServerConfig) -> Result<()> {
    server::start_server(config).await
}

pub fn cmd_init(config: &ServerConfig) -> Result<()> {
    server::open_database(config)?;
    println!("Room database initialized at {}", config.db_path.display());
    Ok(())
}
