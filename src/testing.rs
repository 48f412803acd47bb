//! Test doubles for the broker connector and the radio

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ble::{
    ConnectionHandle, GattCharacteristic, GattService, Radio, RadioError, RadioEvent, RadioPower,
};
use crate::error::TransportError;
use crate::model::{DEFAULT_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID};
use crate::mqtt::{BrokerClient, BrokerConfig, BrokerConnector, DriverError, DriverEvent, Qos};

#[derive(Default)]
pub struct BrokerCalls {
    pub opens: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub reject_requests: AtomicBool,
    pub published: Mutex<Vec<(String, String, Qos)>>,
    pub subscribed: Mutex<Vec<(String, Qos)>>,
    pub unsubscribed: Mutex<Vec<String>>,
}

impl BrokerCalls {
    /// Publish, subscribe and unsubscribe calls that reached the client
    pub fn request_count(&self) -> usize {
        self.published.lock().unwrap().len()
            + self.subscribed.lock().unwrap().len()
            + self.unsubscribed.lock().unwrap().len()
    }

    pub fn published(&self) -> Vec<(String, String, Qos)> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscribed(&self) -> Vec<(String, Qos)> {
        self.subscribed.lock().unwrap().clone()
    }
}

enum Greeting {
    Accept,
    Refuse(String),
    Silent,
}

/// Connector whose driver only emits what the test injects
pub struct MockConnector {
    pub calls: Arc<BrokerCalls>,
    greeting: Greeting,
    driver: Mutex<Option<mpsc::Sender<DriverEvent>>>,
}

impl MockConnector {
    fn with_greeting(greeting: Greeting) -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(BrokerCalls::default()),
            greeting,
            driver: Mutex::new(None),
        })
    }

    /// Every attempt is acknowledged immediately
    pub fn accepting() -> Arc<Self> {
        Self::with_greeting(Greeting::Accept)
    }

    /// Attempts never hear back unless the test injects an event
    pub fn silent() -> Arc<Self> {
        Self::with_greeting(Greeting::Silent)
    }

    pub fn refusing(reason: &str) -> Arc<Self> {
        Self::with_greeting(Greeting::Refuse(reason.to_string()))
    }

    /// Event sender of the most recent attempt
    pub fn driver(&self) -> mpsc::Sender<DriverEvent> {
        self.driver
            .lock()
            .unwrap()
            .clone()
            .expect("no broker connection was opened")
    }

    pub async fn inject(&self, event: DriverEvent) {
        self.driver()
            .send(event)
            .await
            .expect("driver router has stopped");
    }
}

impl BrokerConnector for MockConnector {
    fn open(
        &self,
        _config: &BrokerConfig,
        _shutdown: CancellationToken,
    ) -> Result<(Box<dyn BrokerClient>, mpsc::Receiver<DriverEvent>), TransportError> {
        self.calls.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(32);
        match &self.greeting {
            Greeting::Accept => tx.try_send(DriverEvent::Connected).unwrap(),
            Greeting::Refuse(reason) => tx.try_send(DriverEvent::Refused(reason.clone())).unwrap(),
            Greeting::Silent => {}
        }
        *self.driver.lock().unwrap() = Some(tx);

        Ok((
            Box::new(MockClient {
                calls: self.calls.clone(),
            }),
            rx,
        ))
    }
}

struct MockClient {
    calls: Arc<BrokerCalls>,
}

impl MockClient {
    fn check(&self) -> Result<(), DriverError> {
        if self.calls.reject_requests.load(Ordering::SeqCst) {
            Err(DriverError("request queue full".to_string()))
        } else {
            Ok(())
        }
    }
}

impl BrokerClient for MockClient {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), DriverError> {
        self.check()?;
        self.calls.published.lock().unwrap().push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
            qos,
        ));
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), DriverError> {
        self.check()?;
        self.calls
            .subscribed
            .lock()
            .unwrap()
            .push((topic.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), DriverError> {
        self.check()?;
        self.calls
            .unsubscribed
            .lock()
            .unwrap()
            .push(topic.to_string());
        Ok(())
    }

    fn disconnect(&self) -> Result<(), DriverError> {
        self.calls.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Failures {
    connect: Option<String>,
    subscribe: Option<String>,
    write: Option<String>,
    read: Option<String>,
}

/// In-memory radio with scripted GATT layout and failures
pub struct FakeRadio {
    power: Mutex<RadioPower>,
    services: Vec<GattService>,
    events: broadcast::Sender<RadioEvent>,
    connect_gate: watch::Sender<bool>,
    failures: Mutex<Failures>,
    read_value: Mutex<Vec<u8>>,
    scan_starts: AtomicUsize,
    scan_stops: AtomicUsize,
    discover_calls: AtomicUsize,
    read_calls: AtomicUsize,
    subscriptions: Mutex<Vec<(ConnectionHandle, Uuid)>>,
    writes: Mutex<Vec<(ConnectionHandle, Uuid, Vec<u8>)>>,
    disconnects: Mutex<Vec<ConnectionHandle>>,
}

impl FakeRadio {
    pub const NOTIFY_UUID: Uuid = DEFAULT_CHARACTERISTIC_UUID;
    pub const PLAIN_UUID: Uuid = Uuid::from_u128(0x0000ffe2_0000_1000_8000_00805f9b34fb);

    pub fn with_services(services: Vec<GattService>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (connect_gate, _) = watch::channel(true);
        Arc::new(Self {
            power: Mutex::new(RadioPower::PoweredOn),
            services,
            events,
            connect_gate,
            failures: Mutex::new(Failures::default()),
            read_value: Mutex::new(Vec::new()),
            scan_starts: AtomicUsize::new(0),
            scan_stops: AtomicUsize::new(0),
            discover_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        })
    }

    /// Reference firmware layout: one service, one notifying characteristic
    /// and one plain characteristic
    pub fn esp32() -> Arc<Self> {
        Self::with_services(vec![GattService {
            uuid: DEFAULT_SERVICE_UUID,
            characteristics: vec![
                GattCharacteristic {
                    uuid: Self::NOTIFY_UUID,
                    notify: true,
                },
                GattCharacteristic {
                    uuid: Self::PLAIN_UUID,
                    notify: false,
                },
            ],
        }])
    }

    /// Power reported before any transport is built
    pub fn set_initial_power(&self, power: RadioPower) {
        *self.power.lock().unwrap() = power;
    }

    pub fn set_power(&self, power: RadioPower) {
        *self.power.lock().unwrap() = power;
        self.emit(RadioEvent::PowerChanged(power));
    }

    pub fn advertise(&self, handle: &str, name: Option<&str>, address: Option<&str>, rssi: Option<i16>) {
        self.emit(RadioEvent::Advertisement {
            handle: ConnectionHandle::new(handle),
            name: name.map(str::to_string),
            address: address.map(str::to_string),
            rssi,
        });
    }

    pub fn notify(&self, handle: &str, characteristic: Uuid, value: &[u8]) {
        self.emit(RadioEvent::Notification {
            handle: ConnectionHandle::new(handle),
            characteristic,
            value: value.to_vec(),
        });
    }

    pub fn drop_peer(&self, handle: &str, error: Option<&str>) {
        self.emit(RadioEvent::PeerDisconnected {
            handle: ConnectionHandle::new(handle),
            error: error.map(str::to_string),
        });
    }

    /// Makes `connect` wait until [`FakeRadio::release_connects`]
    pub fn hold_connects(&self) {
        self.connect_gate.send_replace(false);
    }

    pub fn release_connects(&self) {
        self.connect_gate.send_replace(true);
    }

    pub fn fail_connect(&self, reason: &str) {
        self.failures.lock().unwrap().connect = Some(reason.to_string());
    }

    pub fn fail_subscribe(&self, reason: &str) {
        self.failures.lock().unwrap().subscribe = Some(reason.to_string());
    }

    pub fn fail_write(&self, reason: &str) {
        self.failures.lock().unwrap().write = Some(reason.to_string());
    }

    pub fn fail_read(&self, reason: &str) {
        self.failures.lock().unwrap().read = Some(reason.to_string());
    }

    pub fn clear_failures(&self) {
        *self.failures.lock().unwrap() = Failures::default();
    }

    pub fn set_read_value(&self, value: &[u8]) {
        *self.read_value.lock().unwrap() = value.to_vec();
    }

    pub fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    pub fn scan_stops(&self) -> usize {
        self.scan_stops.load(Ordering::SeqCst)
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn subscriptions(&self) -> Vec<(ConnectionHandle, Uuid)> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(ConnectionHandle, Uuid, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<ConnectionHandle> {
        self.disconnects.lock().unwrap().clone()
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    fn failure(&self, pick: impl FnOnce(&Failures) -> &Option<String>) -> Result<(), RadioError> {
        match pick(&self.failures.lock().unwrap()) {
            Some(reason) => Err(RadioError::Backend(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn power(&self) -> RadioPower {
        *self.power.lock().unwrap()
    }

    async fn start_scan(&self, _services: &[Uuid]) -> Result<(), RadioError> {
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.scan_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, _handle: &ConnectionHandle) -> Result<(), RadioError> {
        let mut gate = self.connect_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.failure(|f| &f.connect)
    }

    async fn discover_services(
        &self,
        _handle: &ConnectionHandle,
    ) -> Result<Vec<GattService>, RadioError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.services.clone())
    }

    async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        self.failure(|f| &f.subscribe)?;
        self.subscriptions
            .lock()
            .unwrap()
            .push((handle.clone(), characteristic));
        Ok(())
    }

    async fn write(
        &self,
        handle: &ConnectionHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), RadioError> {
        self.failure(|f| &f.write)?;
        self.writes
            .lock()
            .unwrap()
            .push((handle.clone(), characteristic, data.to_vec()));
        Ok(())
    }

    async fn read(
        &self,
        _handle: &ConnectionHandle,
        _characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.failure(|f| &f.read)?;
        Ok(self.read_value.lock().unwrap().clone())
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), RadioError> {
        self.disconnects.lock().unwrap().push(handle.clone());
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}
