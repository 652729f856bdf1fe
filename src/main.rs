use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wheelbridge::config::BridgeConfig;
use wheelbridge::device::{self, DeviceHandle};
use wheelbridge::server::BridgeServer;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    // Konfiguration laden (Datei + Umgebungsvariablen)
    let config = BridgeConfig::load().await?;
    setup_logging_env(config.log_level()?);
    info!(
        "Starting wheelbridge: {} mode, {} backend",
        config.mapping.mode, config.device.backend
    );

    // Gerät öffnen und belegen, ohne Gerät wird nicht gestartet
    let profile = config.profile();
    let backend = device::open_backend(
        config.device.backend,
        profile,
        profile.capabilities(config.axis_range()),
    )?;
    let device = DeviceHandle::acquire(backend, config.device.device_id).map_err(|e| {
        error!("Device {} unavailable: {}", config.device.device_id, e);
        eyre!("Failed to acquire device {}: {}", config.device.device_id, e)
    })?;

    let server = BridgeServer::bind(
        &config.server.host,
        config.server.port,
        device.clone(),
        config.mapping_config()?,
        config.server_options()?,
    )
    .await?;

    // Ctrl-C beendet die Annahme neuer Verbindungen und schließt alle Sessions
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received");
                shutdown.cancel();
            }
            Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
        }
    });

    let result = server.run().await;
    device.release();
    result?;

    info!("wheelbridge stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
