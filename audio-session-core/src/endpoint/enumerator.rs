//! Endpoint discovery over an [`AudioBackend`].
//!
//! Every listing is a fresh query: connection state is volatile, so nothing is
//! cached between calls and no device or property-store handle outlives the
//! call that produced the snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::endpoint::properties::DevicePropertyStore;
use crate::models::device::{DataFlow, DeviceDescriptor, StateFilter, TransportType};
use crate::models::error::AudioError;
use crate::traits::backend::AudioBackend;

/// An endpoint together with its resolved display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub descriptor: DeviceDescriptor,
    pub name: String,
    pub transport: TransportType,
    pub is_default: bool,
}

/// Result of one `list_endpoints` call.
///
/// Iteration can be restarted any number of times; it always walks the same
/// snapshot. Call [`DeviceEnumerator::list_endpoints`] again for fresh state.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    flow: DataFlow,
    filter: StateFilter,
    taken_at: DateTime<Utc>,
    devices: Vec<DeviceDescriptor>,
}

impl EndpointSnapshot {
    pub fn flow(&self) -> DataFlow {
        self.flow
    }

    pub fn filter(&self) -> StateFilter {
        self.filter
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DeviceDescriptor> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl<'a> IntoIterator for &'a EndpointSnapshot {
    type Item = &'a DeviceDescriptor;
    type IntoIter = std::slice::Iter<'a, DeviceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

impl IntoIterator for EndpointSnapshot {
    type Item = DeviceDescriptor;
    type IntoIter = std::vec::IntoIter<DeviceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.into_iter()
    }
}

/// Lists and resolves endpoints. Safe to share across threads.
#[derive(Clone)]
pub struct DeviceEnumerator {
    backend: Arc<dyn AudioBackend>,
}

impl DeviceEnumerator {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    pub fn properties(&self) -> DevicePropertyStore<'_> {
        DevicePropertyStore::new(self.backend.as_ref())
    }

    /// Snapshot the endpoints for `flow` passing `filter`.
    pub fn list_endpoints(&self, flow: DataFlow, filter: StateFilter) -> Result<EndpointSnapshot, AudioError> {
        let devices: Vec<DeviceDescriptor> = self
            .backend
            .enumerate(flow, filter)?
            .into_iter()
            .filter(|d| d.flow == flow && filter.admits(d.state))
            .collect();

        log::debug!(
            "{}: {} {:?} endpoints ({:?})",
            self.backend.name(),
            devices.len(),
            flow,
            filter
        );

        Ok(EndpointSnapshot {
            flow,
            filter,
            taken_at: Utc::now(),
            devices,
        })
    }

    /// Descriptor for `id`, in whatever state it is currently in.
    pub fn resolve(&self, id: &str) -> Result<DeviceDescriptor, AudioError> {
        self.backend.device(id)
    }

    pub fn default_endpoint(&self, flow: DataFlow) -> Result<DeviceDescriptor, AudioError> {
        self.backend.default_endpoint(flow)
    }

    /// List endpoints with friendly names, transports and the default marker.
    ///
    /// Devices whose name cannot be read get a positional placeholder.
    pub fn describe_endpoints(&self, flow: DataFlow, filter: StateFilter) -> Result<Vec<EndpointInfo>, AudioError> {
        let snapshot = self.list_endpoints(flow, filter)?;
        let default_id = self.backend.default_endpoint(flow).ok().map(|d| d.id);
        let properties = self.properties();

        Ok(snapshot
            .into_iter()
            .enumerate()
            .map(|(i, descriptor)| {
                let name = properties
                    .friendly_name(&descriptor)
                    .unwrap_or_else(|_| format!("Device {}", i));
                let transport = properties.transport_type(&descriptor);
                let is_default = default_id.as_deref() == Some(descriptor.id.as_str());
                EndpointInfo {
                    descriptor,
                    name,
                    transport,
                    is_default,
                }
            })
            .collect())
    }

    /// Choose an active endpoint from an ordered list of preferred names.
    ///
    /// With an empty list the first non-Bluetooth device is picked. Otherwise
    /// the first USB device missing from the list wins, unless USB
    /// auto-selection is disabled, and then the list is searched in order.
    pub fn select_preferred(
        &self,
        flow: DataFlow,
        preferences: &[String],
        disable_usb_auto_selection: bool,
    ) -> Result<Option<EndpointInfo>, AudioError> {
        let candidates = self.describe_endpoints(flow, StateFilter::Active)?;

        if preferences.is_empty() {
            return Ok(candidates
                .into_iter()
                .find(|c| !matches!(c.transport, TransportType::Bluetooth | TransportType::BluetoothLE)));
        }

        if !disable_usb_auto_selection {
            let new_usb = candidates
                .iter()
                .find(|c| c.transport == TransportType::Usb && !preferences.contains(&c.name));
            if let Some(found) = new_usb {
                log::debug!("selecting newly attached USB endpoint {}", found.name);
                return Ok(Some(found.clone()));
            }
        }

        for preference in preferences {
            if let Some(found) = candidates.iter().find(|c| &c.name == preference) {
                return Ok(Some(found.clone()));
            }
        }

        Ok(None)
    }
}
