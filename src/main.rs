use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commsync::config::{ServerConfig, env_flag};
use commsync::telemetry;

mod cmd;

#[derive(Parser)]
#[command(name = "commsync")]
#[command(version, about = "Real-time project rooms with persisted history and an @ai assistant")]
pub struct Cli {
    /// Database path (overrides DB_PATH)
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the room server
    Serve {
        /// Address to listen on (overrides HTTP_ADDR)
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Permissive CORS for local front-end development
        #[arg(long)]
        dev: bool,
    },
    /// Create the room database and exit
    Init,
    /// Mint a development bearer credential
    Token {
        /// Participant id to put in the credential
        #[arg(long)]
        user: String,

        /// Display label (defaults to the user id)
        #[arg(long)]
        email: Option<String>,

        /// Lifetime in hours
        #[arg(long, default_value = "24")]
        ttl_hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    telemetry::init_tracing(env_flag("LOG_JSON"));

    let mut config = ServerConfig::from_env();
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }

    match cli.command {
        Commands::Serve { addr, dev } => {
            if let Some(addr) = addr {
                config.http_addr = addr;
            }
            config.dev_mode |= dev;
            cmd::cmd_serve(config).await?;
        }
        Commands::Init => {
            cmd::cmd_init(&config)?;
        }
        Commands::Token {
            user,
            email,
            ttl_hours,
        } => {
            cmd::cmd_token(&config, &user, email.as_deref(), ttl_hours)?;
        }
    }

    Ok(())
}
