//! [`Radio`] backed by the first btleplug adapter

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::radio::{
    ConnectionHandle, GattCharacteristic, GattService, Radio, RadioError, RadioEvent, RadioPower,
};

const EVENT_BUFFER: usize = 256;

fn backend(e: btleplug::Error) -> RadioError {
    RadioError::Backend(e.to_string())
}

fn handle_of(id: &PeripheralId) -> ConnectionHandle {
    ConnectionHandle::new(format!("{id:?}"))
}

fn power_of(state: CentralState) -> RadioPower {
    match state {
        CentralState::PoweredOn => RadioPower::PoweredOn,
        CentralState::PoweredOff => RadioPower::PoweredOff,
        _ => RadioPower::Unknown,
    }
}

pub struct BtleplugRadio {
    adapter: Adapter,
    events: broadcast::Sender<RadioEvent>,
    /// Notification pumps of connected peripherals
    pumps: Mutex<HashMap<ConnectionHandle, CancellationToken>>,
    shutdown: CancellationToken,
}

impl BtleplugRadio {
    pub async fn first_adapter() -> Result<Arc<Self>, RadioError> {
        let manager = Manager::new().await.map_err(backend)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(backend)?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Backend("no bluetooth adapter found".to_string()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using bluetooth adapter {}", info),
            Err(e) => warn!("Could not read adapter info: {}", e),
        }

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let radio = Arc::new(Self {
            adapter,
            events,
            pumps: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        let central_events = radio.adapter.events().await.map_err(backend)?;
        tokio::spawn(pump_central_events(
            radio.adapter.clone(),
            central_events,
            radio.events.clone(),
            radio.shutdown.clone(),
        ));

        Ok(radio)
    }

    /// Stops the event and notification pumps
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn peripheral(&self, handle: &ConnectionHandle) -> Result<Peripheral, RadioError> {
        self.adapter
            .peripherals()
            .await
            .map_err(backend)?
            .into_iter()
            .find(|peripheral| handle_of(&peripheral.id()) == *handle)
            .ok_or_else(|| RadioError::UnknownPeer(handle.clone()))
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, RadioError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(RadioError::MissingCharacteristic(uuid))
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn power(&self) -> RadioPower {
        match self.adapter.adapter_state().await {
            Ok(state) => power_of(state),
            Err(e) => {
                warn!("Could not query adapter state: {}", e);
                RadioPower::Unknown
            }
        }
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), RadioError> {
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.adapter.start_scan(filter).await.map_err(backend)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await.map_err(backend)
    }

    async fn connect(&self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle).await?;
        peripheral.connect().await.map_err(backend)?;

        let notifications = peripheral.notifications().await.map_err(backend)?;
        let token = self.shutdown.child_token();
        if let Some(previous) = self.pumps.lock().await.insert(handle.clone(), token.clone()) {
            previous.cancel();
        }

        let events = self.events.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut notifications = notifications;
            loop {
                let notification = tokio::select! {
                    _ = token.cancelled() => break,
                    next = notifications.next() => match next {
                        Some(notification) => notification,
                        None => break,
                    },
                };
                let event = RadioEvent::Notification {
                    handle: handle.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if events.send(event).is_err() {
                    debug!("No listeners for notifications from {}", handle);
                }
            }
            debug!("Notification pump for {} stopped", handle);
        });

        Ok(())
    }

    async fn discover_services(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Vec<GattService>, RadioError> {
        let peripheral = self.peripheral(handle).await?;
        peripheral.discover_services().await.map_err(backend)?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        notify: c.properties.contains(CharPropFlags::NOTIFY),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle).await?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&characteristic).await.map_err(backend)
    }

    async fn write(
        &self,
        handle: &ConnectionHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle).await?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(backend)
    }

    async fn read(
        &self,
        handle: &ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        let peripheral = self.peripheral(handle).await?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        peripheral.read(&characteristic).await.map_err(backend)
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        if let Some(token) = self.pumps.lock().await.remove(handle) {
            token.cancel();
        }
        let peripheral = self.peripheral(handle).await?;
        peripheral.disconnect().await.map_err(backend)
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}

async fn pump_central_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: broadcast::Sender<RadioEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = central_events.next() => match next {
                Some(event) => event,
                None => {
                    error!("Bluetooth adapter event stream ended");
                    break;
                }
            },
        };

        let translated = match event {
            CentralEvent::StateUpdate(state) => Some(RadioEvent::PowerChanged(power_of(state))),
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                advertisement(&adapter, &id).await
            }
            CentralEvent::DeviceDisconnected(id) => Some(RadioEvent::PeerDisconnected {
                handle: handle_of(&id),
                error: None,
            }),
            _ => None,
        };

        if let Some(event) = translated {
            if events.send(event).is_err() {
                debug!("No listeners for radio events");
            }
        }
    }
    debug!("Central event pump stopped");
}

async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<RadioEvent> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(e) => {
            debug!("Advertiser {:?} vanished: {}", id, e);
            return None;
        }
    };
    let properties = peripheral.properties().await.ok().flatten();

    Some(RadioEvent::Advertisement {
        handle: handle_of(id),
        name: properties.as_ref().and_then(|p| p.local_name.clone()),
        address: properties.as_ref().map(|p| p.address.to_string()),
        rssi: properties.and_then(|p| p.rssi),
    })
}
