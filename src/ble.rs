//! # btleplug Transport
//!
//! `BleTransport` implementation over the platform BLE stack via btleplug.
//! Talks to the standard Heart Rate service, so any strap or watch that
//! advertises 0x180D works, not only Polar devices.
//!
//! ## Background Tasks
//! - Notification forwarder: decodes 0x2A37 notifications into `LinkEvents`
//! - Disconnect watcher: listens on the adapter event stream for the
//!   peripheral's `DeviceDisconnected`
//!
//! Both are keyed by device address and aborted on unsubscribe/disconnect so a
//! deliberately closed link never reports itself as dropped.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::heart_rate::HeartRateMeasurement;
use crate::transport::{BleTransport, DeviceDescriptor, LinkEvents, HEART_RATE_MEASUREMENT};

// BlueZ can block forever inside Connect when the device is out of range
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVER_SERVICES_TIMEOUT: Duration = Duration::from_secs(15);
const LOOKUP_POLL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct BtleHandle {
    peripheral: Peripheral,
    address: String,
}

pub struct BtleplugTransport {
    adapter: Adapter,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// CoreBluetooth hides MAC addresses, so macOS identifies peripherals by UUID
fn peripheral_address(peripheral: &Peripheral) -> String {
    if cfg!(target_os = "macos") {
        peripheral.id().to_string()
    } else {
        peripheral.address().to_string()
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(TransportError::CharacteristicMissing(uuid))
}

fn replace_task(tasks: &Mutex<HashMap<String, JoinHandle<()>>>, key: &str, task: JoinHandle<()>) {
    match tasks.lock() {
        Ok(mut tasks) => {
            if let Some(previous) = tasks.insert(key.to_string(), task) {
                previous.abort();
            }
        }
        Err(_) => {
            log::error!("Task registry poisoned, background task for {} left detached", key);
        }
    }
}

fn abort_task(tasks: &Mutex<HashMap<String, JoinHandle<()>>>, key: &str) {
    if let Some(task) = tasks.lock().ok().and_then(|mut tasks| tasks.remove(key)) {
        task.abort();
    }
}

impl BtleplugTransport {
    /// Binds to the first Bluetooth adapter
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        Ok(Self {
            adapter,
            forwarders: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
        let peripherals = self.adapter.peripherals().await?;
        Ok(peripherals
            .into_iter()
            .find(|p| peripheral_address(p).eq_ignore_ascii_case(address)))
    }

    async fn descriptor_for(peripheral: &Peripheral) -> Option<DeviceDescriptor> {
        let props = peripheral.properties().await.ok()??;
        let name = props.local_name?;
        Some(DeviceDescriptor::new(name, peripheral_address(peripheral)))
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    type Handle = BtleHandle;

    async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(timeout).await;
        if let Err(e) = self.adapter.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(device) = Self::descriptor_for(&peripheral).await {
                devices.push(device);
            }
        }

        log::info!("Scan finished: {} named device(s) visible", devices.len());
        Ok(devices)
    }

    async fn find_by_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<DeviceDescriptor>, TransportError> {
        // Already known to the adapter, no scan needed
        if let Some(peripheral) = self.find_peripheral(address).await? {
            if let Some(device) = Self::descriptor_for(&peripheral).await {
                return Ok(Some(device));
            }
        }

        self.adapter.start_scan(ScanFilter::default()).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut found = None;
        while tokio::time::Instant::now() < deadline {
            if let Some(peripheral) = self.find_peripheral(address).await? {
                if let Some(device) = Self::descriptor_for(&peripheral).await {
                    found = Some(device);
                    break;
                }
            }
            tokio::time::sleep(LOOKUP_POLL).await;
        }
        if let Err(e) = self.adapter.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }

        Ok(found)
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<Self::Handle, TransportError> {
        let peripheral = self
            .find_peripheral(&device.address)
            .await?
            .ok_or_else(|| TransportError::NotFound(device.address.clone()))?;

        tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout)??;

        // BlueZ reports the connection before the GATT cache is populated
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVER_SERVICES_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout)??;

        log::info!("Connected and services discovered: {} ({})", device.name, device.address);
        Ok(BtleHandle {
            peripheral,
            address: device.address.clone(),
        })
    }

    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), TransportError> {
        abort_task(&self.watchers, &handle.address);
        abort_task(&self.forwarders, &handle.address);
        handle.peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self, handle: &Self::Handle) -> bool {
        handle.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn subscribe_heart_rate(
        &self,
        handle: &Self::Handle,
        events: LinkEvents,
    ) -> Result<(), TransportError> {
        let characteristic = find_characteristic(&handle.peripheral, HEART_RATE_MEASUREMENT)?;
        let mut notifications = handle.peripheral.notifications().await?;
        handle.peripheral.subscribe(&characteristic).await?;

        let address = handle.address.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != HEART_RATE_MEASUREMENT {
                    continue;
                }
                match HeartRateMeasurement::parse(&notification.value) {
                    Ok(measurement) => {
                        log::debug!("Heart rate: {:?}", measurement);
                        events.heart_rate(measurement.bpm);
                    }
                    Err(e) => log::warn!("Discarding heart rate notification from {}: {}", address, e),
                }
            }
            log::info!("Heart rate notification stream for {} ended", address);
        });
        replace_task(&self.forwarders, &handle.address, forwarder);

        Ok(())
    }

    async fn unsubscribe_heart_rate(&self, handle: &Self::Handle) -> Result<(), TransportError> {
        abort_task(&self.forwarders, &handle.address);
        let characteristic = find_characteristic(&handle.peripheral, HEART_RATE_MEASUREMENT)?;
        handle.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn read_characteristic(
        &self,
        handle: &Self::Handle,
        uuid: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let characteristic = find_characteristic(&handle.peripheral, uuid)?;
        Ok(handle.peripheral.read(&characteristic).await?)
    }

    async fn on_unsolicited_disconnect(
        &self,
        handle: &Self::Handle,
        events: LinkEvents,
    ) -> Result<(), TransportError> {
        let mut adapter_events = self.adapter.events().await?;
        let peripheral_id = handle.peripheral.id();

        let watcher = tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        log::info!("Disconnect watcher: device {:?} disconnected", id);
                        events.disconnected();
                        break;
                    }
                }
            }
        });
        replace_task(&self.watchers, &handle.address, watcher);

        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        for tasks in [&self.forwarders, &self.watchers] {
            if let Ok(mut tasks) = tasks.lock() {
                for (_, task) in tasks.drain() {
                    task.abort();
                }
            }
        }
    }
}
