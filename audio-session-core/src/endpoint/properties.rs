use crate::models::device::{DeviceDescriptor, TransportType};
use crate::models::error::AudioError;
use crate::models::property::{PropertyKey, PKEY_DEVICE_ENUMERATOR_NAME, PKEY_DEVICE_FRIENDLY_NAME};
use crate::traits::backend::AudioBackend;

/// Read-only property lookups against enumerated devices.
///
/// Each call opens the device's store, reads, and drops it again; stores are
/// cheap to reopen and nothing is cached between calls.
pub struct DevicePropertyStore<'a> {
    backend: &'a dyn AudioBackend,
}

impl<'a> DevicePropertyStore<'a> {
    pub fn new(backend: &'a dyn AudioBackend) -> Self {
        Self { backend }
    }

    pub fn get_string(&self, device: &DeviceDescriptor, key: &PropertyKey) -> Result<String, AudioError> {
        let store = self.backend.open_property_store(&device.id)?;
        store.get_string(key)
    }

    /// Friendly name with any USB port prefix removed.
    pub fn friendly_name(&self, device: &DeviceDescriptor) -> Result<String, AudioError> {
        self.get_string(device, &PKEY_DEVICE_FRIENDLY_NAME)
            .map(|name| normalize_friendly_name(&name))
    }

    /// Transport detected from the enumerator name, `Unknown` if unreadable.
    pub fn transport_type(&self, device: &DeviceDescriptor) -> TransportType {
        self.get_string(device, &PKEY_DEVICE_ENUMERATOR_NAME)
            .map(|name| TransportType::from_enumerator_name(&name))
            .unwrap_or(TransportType::Unknown)
    }
}

/// Strip the port number some drivers put in front of USB device names,
/// so `"Microphone (2- USB Audio)"` becomes `"Microphone (USB Audio)"`.
pub fn normalize_friendly_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;

    while let Some(open) = rest.find('(') {
        out.push_str(&rest[..=open]);
        rest = &rest[open + 1..];

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 && rest[digits..].starts_with("- ") {
            rest = &rest[digits + 2..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_usb_port_prefix() {
        assert_eq!(normalize_friendly_name("Microphone (2- USB Audio)"), "Microphone (USB Audio)");
        assert_eq!(normalize_friendly_name("Mic (12- Rode) (3- Hub)"), "Mic (Rode) (Hub)");
    }

    #[test]
    fn leaves_other_names_alone() {
        for name in ["Speakers (Realtek(R) Audio)", "Line In (2)", "Headset (2-channel)", "Plain"] {
            assert_eq!(normalize_friendly_name(name), name);
        }
    }
}
