//! # Device Directory
//!
//! Discovery results and the process-local Busy Set.
//!
//! Scans are rebuilt from scratch every time; duplicate addresses collapse to
//! one entry (first-seen position, last-seen name). The device-type filter is
//! a plain case-insensitive substring test so the presentation layer can apply
//! it without touching the transport.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::TransportError;
use crate::transport::{BleTransport, DeviceDescriptor};

/// A discovered device as offered to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListing {
    pub device: DeviceDescriptor,
    pub busy: bool,
}

impl DeviceListing {
    pub fn label(&self) -> String {
        let mut label = format!("{} ({})", self.device.name, self.device.address);
        if self.busy {
            label.push_str(" [busy]");
        }
        label
    }
}

/// True when `name` contains `device_type`, ignoring case
pub fn matches_device_type(name: &str, device_type: &str) -> bool {
    name.to_lowercase().contains(&device_type.to_lowercase())
}

pub fn filter_by_type<'a>(
    devices: &'a [DeviceDescriptor],
    device_type: &str,
) -> Vec<&'a DeviceDescriptor> {
    devices
        .iter()
        .filter(|d| matches_device_type(&d.name, device_type))
        .collect()
}

/// Collapse repeated addresses, keeping the first position and the last name
pub fn collapse_duplicates(raw: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    let mut devices: Vec<DeviceDescriptor> = Vec::with_capacity(raw.len());
    for device in raw {
        match devices.iter_mut().find(|d| d.has_address(&device.address)) {
            Some(existing) => existing.name = device.name,
            None => devices.push(device),
        }
    }
    devices
}

#[derive(Debug, Default)]
pub struct DeviceDirectory {
    devices: Vec<DeviceDescriptor>,
    busy: HashSet<String>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time-bounded scan replacing the previous result set
    pub async fn discover<T: BleTransport + ?Sized>(
        &mut self,
        transport: &T,
        timeout: Duration,
    ) -> Result<&[DeviceDescriptor], TransportError> {
        let raw = transport.discover(timeout).await?;
        self.devices = collapse_duplicates(raw);
        Ok(&self.devices)
    }

    /// Targeted lookup first, full scan as the fallback
    pub async fn resolve_by_address<T: BleTransport + ?Sized>(
        &mut self,
        transport: &T,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<DeviceDescriptor>, TransportError> {
        match tokio::time::timeout(timeout, transport.find_by_address(address, timeout)).await {
            Ok(Ok(Some(device))) => {
                log::debug!("Targeted lookup resolved {}", address);
                return Ok(Some(device));
            }
            Ok(Ok(None)) => log::debug!("Targeted lookup for {} found nothing, scanning", address),
            Ok(Err(TransportError::Unsupported)) => {
                log::debug!("Targeted lookup unsupported, scanning for {}", address)
            }
            Ok(Err(e)) => log::warn!("Targeted lookup for {} failed ({}), scanning", address, e),
            Err(_) => log::debug!("Targeted lookup for {} timed out, scanning", address),
        }

        self.discover(transport, timeout).await?;
        Ok(self.get(address).cloned())
    }

    pub fn get(&self, address: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.has_address(address))
    }

    /// Filtered view with busy flags, in discovery order
    pub fn listings(&self, device_type: &str) -> Vec<DeviceListing> {
        filter_by_type(&self.devices, device_type)
            .into_iter()
            .map(|device| DeviceListing {
                busy: self.is_busy(&device.address),
                device: device.clone(),
            })
            .collect()
    }

    pub fn claim(&mut self, address: &str) {
        self.busy.insert(address.to_uppercase());
    }

    pub fn release(&mut self, address: &str) {
        self.busy.remove(&address.to_uppercase());
    }

    pub fn is_busy(&self, address: &str) -> bool {
        self.busy.contains(&address.to_uppercase())
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }
}
