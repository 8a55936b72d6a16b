//! # BLE Transport Capability
//!
//! The small abstract surface the session controller consumes. Scanning,
//! GATT access and notification delivery live behind `BleTransport`; the
//! controller only ever sees descriptors, opaque handles and `LinkEvent`s.
//!
//! ## Event Handoff
//! Transports deliver heart rate notifications and unsolicited disconnects from
//! their own tasks or threads. They never touch controller state: every event
//! is pushed through a `LinkEvents` sender into a crossbeam channel that the
//! controller drains once per tick.
//!
//! Each connection gets a fresh link id so events from a link that has already
//! been replaced can be told apart and ignored.

use async_trait::async_trait;
use chrono::Local;
use crossbeam_channel::Sender;
use std::time::Duration;
use uuid::Uuid;

use crate::error::TransportError;
use crate::sampling::Sample;

/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Battery Level characteristic (0x2A19)
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// A device seen during a scan. `address` is the identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub address: String,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Case-insensitive address comparison
    pub fn has_address(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

/// Raw link activity reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Sample { link: u64, sample: Sample },
    Disconnected { link: u64 },
    ReconnectAttempt { link: u64, attempt: u32 },
}

/// Thread-safe sender handed to transports for one link
#[derive(Debug, Clone)]
pub struct LinkEvents {
    link: u64,
    sender: Sender<LinkEvent>,
}

impl LinkEvents {
    pub fn new(link: u64, sender: Sender<LinkEvent>) -> Self {
        Self { link, sender }
    }

    /// Report a heart rate value stamped with the arrival time
    pub fn heart_rate(&self, bpm: u16) {
        self.sample(Sample::new(Local::now(), bpm));
    }

    pub fn sample(&self, sample: Sample) {
        self.send(LinkEvent::Sample {
            link: self.link,
            sample,
        });
    }

    pub fn disconnected(&self) {
        self.send(LinkEvent::Disconnected { link: self.link });
    }

    pub fn reconnect_attempt(&self, attempt: u32) {
        self.send(LinkEvent::ReconnectAttempt {
            link: self.link,
            attempt,
        });
    }

    fn send(&self, event: LinkEvent) {
        if let Err(why) = self.sender.send(event) {
            log::debug!("Link {} event dropped, controller gone: {:?}", self.link, why.0);
        }
    }
}

/// Capability interface over a BLE stack.
///
/// After `subscribe_heart_rate` the transport may call `events.heart_rate`
/// zero or more times until `unsubscribe_heart_rate` or a disconnect.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Time-bounded scan returning every visible named device
    async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Targeted lookup of one address. Transports without a cheaper path
    /// than a full scan keep the default.
    async fn find_by_address(
        &self,
        _address: &str,
        _timeout: Duration,
    ) -> Result<Option<DeviceDescriptor>, TransportError> {
        Err(TransportError::Unsupported)
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<Self::Handle, TransportError>;

    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), TransportError>;

    async fn is_connected(&self, handle: &Self::Handle) -> bool;

    async fn subscribe_heart_rate(
        &self,
        handle: &Self::Handle,
        events: LinkEvents,
    ) -> Result<(), TransportError>;

    async fn unsubscribe_heart_rate(&self, handle: &Self::Handle) -> Result<(), TransportError>;

    async fn read_characteristic(
        &self,
        handle: &Self::Handle,
        uuid: Uuid,
    ) -> Result<Vec<u8>, TransportError>;

    /// Register for disconnects the transport notices on its own
    async fn on_unsolicited_disconnect(
        &self,
        handle: &Self::Handle,
        events: LinkEvents,
    ) -> Result<(), TransportError>;
}
