use anyhow::{Result, anyhow};
use redmux::{RelayServer, cli, config::Config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args()?;
    if args.config_test {
        Config::load(&args.config_file)
            .await
            .map_err(|e| anyhow!("load {}: {}", args.config_file, e))?;
        info!("config file {} is valid", args.config_file);
        return Ok(());
    }
    let server = RelayServer::from_config_file(&args.config_file).await?;
    server.run().await
}
