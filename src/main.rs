use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sense_dongle_gateway::event::SensorEvent;
use sense_dongle_gateway::transport::HidapiTransport;
use sense_dongle_gateway::{Config, DongleSession};
use tracing::{info, warn};

/// Wyze Sense Bridge's USB identifiers, used when `Config::hid_device_path`
/// is unset.
const DEFAULT_VENDOR_ID: u16 = 0x1A86;
const DEFAULT_PRODUCT_ID: u16 = 0xE024;

fn open_transport(config: &Config) -> anyhow::Result<HidapiTransport> {
    match &config.hid_device_path {
        Some(path) => {
            let path = std::ffi::CString::new(path.to_string_lossy().as_bytes())
                .context("device path contains an interior NUL byte")?;
            HidapiTransport::open_path(&path).context("failed to open dongle at configured path")
        }
        None => HidapiTransport::open(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID)
            .context("failed to open dongle by vendor/product id"),
    }
}

fn log_event(event: &SensorEvent) {
    info!(
        mac = %event.mac,
        kind = %event.kind.tag(),
        sensor_type = %event.sensor_type.tag(),
        battery = event.battery,
        signal_dbm = event.signal_dbm,
        "sensor event"
    );
}

/// Blocking drain loop: runs on a dedicated thread via `spawn_blocking`
/// since `DongleSession`'s calls are synchronous.
fn run_event_loop(session: Arc<DongleSession>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        if let Some(event) = session.recv_event(Duration::from_millis(500)) {
            log_event(&event);
        }
        if let Some(err) = session.check_error() {
            warn!(error = %err, "dongle reader thread reported a fault");
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let config = Config::default();
    let transport = open_transport(&config)?;
    let session = tokio::task::spawn_blocking(move || DongleSession::new(Box::new(transport), config))
        .await
        .context("handshake task panicked")??;
    let session = Arc::new(session);

    info!(mac = %session.mac, version = %session.version, "dongle session established");

    let shutdown = Arc::new(AtomicBool::new(false));
    let loop_handle = {
        let session = session.clone();
        let shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || run_event_loop(session, shutdown))
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    shutdown.store(true, Ordering::SeqCst);
    session.stop();
    loop_handle.await.context("event loop task panicked")?;

    Ok(())
}
