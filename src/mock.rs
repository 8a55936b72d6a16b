//! Scripted in-memory transport for controller and directory tests.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::TransportError;
use crate::sampling::Sample;
use crate::transport::{BleTransport, DeviceDescriptor, LinkEvents, BATTERY_LEVEL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockHandle {
    pub address: String,
}

#[derive(Debug, Default)]
struct MockState {
    connect_failures: u32,
    connect_calls: u32,
    disconnect_calls: u32,
    discover_calls: u32,
    unsubscribe_calls: u32,
    battery_reads: u32,
    connected: HashSet<String>,
    sample_events: Option<LinkEvents>,
    disconnect_events: Option<LinkEvents>,
    fail_subscribe: bool,
    fail_unsubscribe: bool,
    battery: Option<u8>,
}

pub struct MockTransport {
    devices: Vec<DeviceDescriptor>,
    targeted_lookup: bool,
    lookup_delay: Option<Duration>,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices,
            targeted_lookup: false,
            lookup_delay: None,
            state: Mutex::new(MockState {
                battery: Some(80),
                ..MockState::default()
            }),
        }
    }

    pub fn with_targeted_lookup(mut self) -> Self {
        self.targeted_lookup = true;
        self
    }

    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state().connect_failures = count;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state().fail_subscribe = fail;
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.state().fail_unsubscribe = fail;
    }

    pub fn set_battery(&self, level: Option<u8>) {
        self.state().battery = level;
    }

    /// Deliver a notification on the current subscription
    pub fn emit(&self, timestamp: DateTime<Local>, bpm: u16) {
        if let Some(events) = &self.state().sample_events {
            events.sample(Sample::new(timestamp, bpm));
        }
    }

    /// Drop the radio link and report it like the stack would
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected.clear();
        state.sample_events = None;
        if let Some(events) = state.disconnect_events.take() {
            events.disconnected();
        }
    }

    /// Drop the radio link without any notification
    pub fn drop_link_silently(&self) {
        let mut state = self.state();
        state.connected.clear();
        state.sample_events = None;
    }

    pub fn connect_calls(&self) -> u32 {
        self.state().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state().disconnect_calls
    }

    pub fn discover_calls(&self) -> u32 {
        self.state().discover_calls
    }

    pub fn unsubscribe_calls(&self) -> u32 {
        self.state().unsubscribe_calls
    }

    pub fn battery_reads(&self) -> u32 {
        self.state().battery_reads
    }

    pub fn is_streaming(&self) -> bool {
        self.state().sample_events.is_some()
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    type Handle = MockHandle;

    async fn discover(&self, _timeout: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.state().discover_calls += 1;
        Ok(self.devices.clone())
    }

    async fn find_by_address(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<Option<DeviceDescriptor>, TransportError> {
        if !self.targeted_lookup {
            return Err(TransportError::Unsupported);
        }
        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.devices.iter().find(|d| d.has_address(address)).cloned())
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<Self::Handle, TransportError> {
        let mut state = self.state();
        state.connect_calls += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::Ble("scripted connect failure".to_string()));
        }
        if !self.devices.iter().any(|d| d.has_address(&device.address)) {
            return Err(TransportError::NotFound(device.address.clone()));
        }
        state.connected.insert(device.address.clone());
        Ok(MockHandle {
            address: device.address.clone(),
        })
    }

    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), TransportError> {
        let mut state = self.state();
        state.disconnect_calls += 1;
        state.connected.remove(&handle.address);
        state.sample_events = None;
        state.disconnect_events = None;
        Ok(())
    }

    async fn is_connected(&self, handle: &Self::Handle) -> bool {
        self.state().connected.contains(&handle.address)
    }

    async fn subscribe_heart_rate(
        &self,
        handle: &Self::Handle,
        events: LinkEvents,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_subscribe || !state.connected.contains(&handle.address) {
            return Err(TransportError::Ble("subscribe refused".to_string()));
        }
        state.sample_events = Some(events);
        Ok(())
    }

    async fn unsubscribe_heart_rate(&self, _handle: &Self::Handle) -> Result<(), TransportError> {
        let mut state = self.state();
        state.unsubscribe_calls += 1;
        state.sample_events = None;
        if state.fail_unsubscribe {
            return Err(TransportError::Ble("unsubscribe refused".to_string()));
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        _handle: &Self::Handle,
        uuid: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        state.battery_reads += 1;
        if uuid != BATTERY_LEVEL {
            return Err(TransportError::CharacteristicMissing(uuid));
        }
        state
            .battery
            .map(|level| vec![level])
            .ok_or(TransportError::Timeout)
    }

    async fn on_unsolicited_disconnect(
        &self,
        _handle: &Self::Handle,
        events: LinkEvents,
    ) -> Result<(), TransportError> {
        self.state().disconnect_events = Some(events);
        Ok(())
    }
}
