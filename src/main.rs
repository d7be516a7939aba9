use std::path::{Path, PathBuf};

use anyhow::Context;
use bmspoll::{BluestScanner, Config, HttpTransport, Poller};

const DEFAULT_CONFIG_PATH: &str = "bmspoll.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config = load_config(std::env::args_os().nth(1).map(PathBuf::from))?;
    log::info!(
        "Polling {} every {:?}, reporting to {} endpoint(s)",
        config.ble.identity().name.as_deref().unwrap_or("<any name>"),
        config.bms.polling_interval(),
        config.endpoints.len()
    );
    if let Some(network) = &config.network {
        log::info!("Reports go out over network {}", network.ssid);
    }
    log::info!(
        "Timestamps use UTC{} (clock synced against {})",
        config.time.utc_offset(),
        config.time.ntp_server
    );

    let scanner = BluestScanner::new(config.ble.callback_debug)
        .await
        .context("failed to open the BLE adapter")?;
    let transport = HttpTransport::new(config.http.timeout()).context("failed to build the HTTP client")?;

    let mut poller = Poller::new(&config, scanner, transport);
    poller.run().await;
    Ok(())
}

/// Load the file named on the command line, else `bmspoll.toml` if present, else defaults.
fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(&path).with_context(|| format!("loading {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load(Path::new(DEFAULT_CONFIG_PATH)).context("loading bmspoll.toml")
        }
        None => {
            log::warn!("No config file given, using built-in defaults");
            Ok(Config::default())
        }
    }
}
