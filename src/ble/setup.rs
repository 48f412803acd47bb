use statum::{machine, state};
use std::sync::Arc;
use tracing::{debug, info};

use super::radio::{ConnectionHandle, GattService, Radio, RadioError};

/// Steps a fresh peripheral link goes through before it is usable
#[state]
#[derive(Debug, Clone)]
pub enum SetupStage {
    Linking,
    Discovering,
    Subscribing,
    Ready,
}

/// Link setup chain with the order of steps enforced at compile time
#[machine]
pub struct LinkSetup<S: SetupStage> {
    radio: Arc<dyn Radio>,
    handle: ConnectionHandle,
    services: Vec<GattService>,
}

impl<S: SetupStage> LinkSetup<S> {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl LinkSetup<Linking> {
    pub fn create(radio: Arc<dyn Radio>, handle: ConnectionHandle) -> Self {
        Self::new(radio, handle, Vec::new())
    }

    pub async fn establish(self) -> Result<LinkSetup<Discovering>, RadioError> {
        debug!("Linking to {}", self.handle);
        self.radio.connect(&self.handle).await?;
        Ok(self.transition())
    }
}

impl LinkSetup<Discovering> {
    pub async fn discover(mut self) -> Result<LinkSetup<Subscribing>, RadioError> {
        self.services = self.radio.discover_services(&self.handle).await?;
        debug!(
            "Discovered {} services on {}",
            self.services.len(),
            self.handle
        );
        Ok(self.transition())
    }
}

impl LinkSetup<Subscribing> {
    /// Subscribes to every characteristic that supports notifications
    pub async fn enable_notifications(self) -> Result<LinkSetup<Ready>, RadioError> {
        let notifying: Vec<_> = self
            .services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .filter(|c| c.notify)
            .map(|c| c.uuid)
            .collect();

        for characteristic in notifying {
            self.radio.subscribe(&self.handle, characteristic).await?;
            debug!("Notifications enabled for {}", characteristic);
        }
        Ok(self.transition())
    }
}

impl LinkSetup<Ready> {
    pub fn into_services(self) -> Vec<GattService> {
        info!("Link to {} ready", self.handle);
        self.services
    }
}

/// Runs the full chain: link, discover, subscribe
pub async fn establish_link(
    radio: Arc<dyn Radio>,
    handle: ConnectionHandle,
) -> Result<Vec<GattService>, RadioError> {
    let ready = LinkSetup::create(radio, handle)
        .establish()
        .await?
        .discover()
        .await?
        .enable_notifications()
        .await?;
    Ok(ready.into_services())
}
