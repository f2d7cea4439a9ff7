use anyhow::Result;
use log::info;

use modbus_tcp_engine::cli::{build_cli, handle_subcommands, run_server};
use modbus_tcp_engine::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = build_cli().get_matches();
    let config = Config::from_matches(&matches).map_err(|e| anyhow::anyhow!("{}", e))?;

    info!("🖥️ Modbus TCP engine v{}", modbus_tcp_engine::VERSION);

    if handle_subcommands(&matches, &config)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?
    {
        return Ok(());
    }

    // No subcommand given: run the server
    run_server(&config)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(())
}
