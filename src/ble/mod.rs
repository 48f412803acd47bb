//! # Direct-Link Transport
//!
//! Talks to a device over Bluetooth Low Energy in the central role.
//!
//! ```text
//! ble/
//! ├── radio.rs      - Radio seam: operations, events, GATT descriptions
//! ├── btle.rs       - Radio implementation on top of btleplug
//! ├── registry.rs   - Arena of discovered peers keyed by PeerKey
//! ├── setup.rs      - Typestate link setup chain (link, discover, subscribe)
//! └── transport.rs  - DirectLinkTransport, the session-facing API
//! ```
//!
//! The registry owns every peer record. The transport's current connection is
//! a `PeerKey` into it, so clearing the registry when the radio powers off
//! also drops the current connection in the same critical section.

pub mod btle;
pub mod radio;
pub mod registry;
pub mod setup;
pub mod transport;

pub use btle::BtleplugRadio;
pub use radio::{
    ConnectionHandle, GattCharacteristic, GattService, Radio, RadioError, RadioEvent, RadioPower,
};
pub use registry::{DiscoveredPeer, PeerKey, PeerRegistry, UNKNOWN_PEER_NAME};
pub use transport::{DirectLinkEvent, DirectLinkTransport, POWERED_OFF_REASON};
