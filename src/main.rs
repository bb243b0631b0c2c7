use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use camrelay::{logging, Config, ConfigOverrides, RelayServer};
use clap::{Parser, Subcommand};
use tokio::sync::Notify;

#[derive(Parser, Debug)]
#[command(name = "camrelay", version)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the signaling relay
    Serve {
        /// Address to listen on (numeric ip:port)
        #[arg(long = "listen")]
        listen: Option<String>,

        /// Producer host:port; overrides PRODUCER_URL
        #[arg(long = "producer-url")]
        producer_url: Option<String>,

        /// Also write logs to this file
        #[arg(long = "log-file")]
        log_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            producer_url,
            log_file,
        } => {
            let overrides = ConfigOverrides {
                listen_addr: listen,
                producer_url,
                log_file,
            };
            let cfg = Config::load_with_overrides(cli.config.as_deref(), overrides)?;
            run_server(cfg).await?;
        }
    }

    Ok(())
}

async fn run_server(cfg: Config) -> Result<()> {
    logging::init(cfg.log_file.as_deref())?;
    logging::info(format!(
        "camrelay start version={} config={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    ));

    let shutdown = Arc::new(Notify::new());
    let server = RelayServer::start(&cfg, Some(shutdown.clone()))
        .await
        .context("start relay server")?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    logging::info("shutdown requested");
    shutdown.notify_one();
    server.wait().await;
    Ok(())
}
