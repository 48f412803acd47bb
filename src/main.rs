use color_eyre::{eyre::eyre, Result};
use esplink::ble::{BtleplugRadio, DirectLinkTransport, Radio};
use esplink::config::AppConfig;
use esplink::mqtt::{BrokerConfig, BrokerTransport, RumqttConnector};
use esplink::persistence::{DeviceStore, TomlDeviceStore};
use esplink::{ConnectionCapability, Device, DeviceSession, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// How long direct-link devices are scanned for before connecting
const SCAN_WINDOW: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AppConfig::load_default().await?;
    let store = TomlDeviceStore::new(config.data_dir()).with_broker_defaults(config.broker.clone());
    info!("Using data directory {}", store.dir().display());

    let mut devices = store.load_devices().await?;
    if devices.is_empty() {
        info!("No devices configured, add them to {}", store.dir().join("devices.toml").display());
        return Ok(());
    }
    let broker_config = store.load_broker_config().await;

    let radio = if devices.iter().any(|d| d.capability.uses_direct_link()) {
        match BtleplugRadio::first_adapter().await {
            Ok(radio) => Some(radio),
            Err(e) => {
                warn!("Direct link unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let mut sessions = Vec::new();
    for device in &devices {
        match spawn_session(device.clone(), &broker_config, radio.clone(), &config).await {
            Ok(session) => sessions.push(session),
            Err(e) => error!("Skipping device {}: {}", device.id, e),
        }
    }
    info!("Started {} of {} sessions", sessions.len(), devices.len());

    let scan_filter = vec![config.gatt_profile().service];
    for session in &sessions {
        tokio::spawn(log_events(session.clone()));
        tokio::spawn(connect_session(session.clone(), scan_filter.clone()));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutting down");

    for session in &sessions {
        session.disconnect().await;
        let updated = session.device().await;
        if let Some(stored) = devices.iter_mut().find(|d| d.id == updated.id) {
            *stored = updated;
        }
        session.close();
    }
    if let Some(radio) = &radio {
        radio.shutdown();
    }

    store.save_devices(&devices).await?;
    Ok(())
}

async fn spawn_session(
    device: Device,
    broker_config: &BrokerConfig,
    radio: Option<Arc<BtleplugRadio>>,
    config: &AppConfig,
) -> Result<Arc<DeviceSession>> {
    let broker = device.capability.uses_broker().then(|| {
        let connector = RumqttConnector::new(config.timing.reconnect_interval())
            .with_network_timeout(config.timing.connect_timeout() * 3);
        let connector = Arc::new(connector);
        Arc::new(BrokerTransport::new(connector).with_connect_timeout(config.timing.connect_timeout()))
    });

    let direct_link = match radio {
        Some(radio) if device.capability.uses_direct_link() => {
            let radio: Arc<dyn Radio> = radio;
            Some(DirectLinkTransport::spawn_with_timeout(radio, config.timing.connect_timeout()).await)
        }
        _ => None,
    };

    // Every session owns its broker client, so client ids must differ
    let mut broker_config = broker_config.clone();
    broker_config.client_id = format!("{}_{}", broker_config.client_id, device.id);

    DeviceSession::spawn(
        device,
        broker_config,
        broker,
        direct_link,
        config.session_settings(),
    )
    .map_err(|e| eyre!("Failed to start session: {}", e))
}

async fn connect_session(session: Arc<DeviceSession>, scan_filter: Vec<Uuid>) {
    let mut peer = None;
    if let Some(direct_link) = session.direct_link() {
        match direct_link.start_scanning(Some(scan_filter)).await {
            Ok(()) => {
                tokio::time::sleep(SCAN_WINDOW).await;
                direct_link.stop_scanning().await;
            }
            Err(e) => warn!("Could not scan for {}: {}", session.id(), e),
        }
        match session.resolve_peer_from_discovery().await {
            Ok(key) => peer = Some(key),
            Err(e) => warn!("{}", e),
        }
    }

    if let Err(e) = session.connect().await {
        error!("Failed to connect {}: {}", session.id(), e);
    }

    if session.capability() == ConnectionCapability::Both {
        if let (Some(direct_link), Some(peer)) = (session.direct_link(), peer) {
            if let Err(e) = direct_link.connect(peer).await {
                warn!("Direct link to {} failed: {}", session.id(), e);
            }
        }
    }
}

async fn log_events(session: Arc<DeviceSession>) {
    let mut events = session.subscribe();
    loop {
        match events.recv().await {
            Ok(SessionEvent::StateChanged { transport, state }) => {
                info!("{} {}: {}", session.id(), transport, state)
            }
            Ok(SessionEvent::MessageReceived(message)) => {
                info!("{} <- {}: {}", session.id(), message.topic, message.payload)
            }
            Ok(SessionEvent::CommandResponse(command)) => {
                debug!("{} answered command {}", session.id(), command.id())
            }
            Ok(SessionEvent::TransportError { transport, error }) => {
                warn!("{} {} error: {}", session.id(), transport, error)
            }
            Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
