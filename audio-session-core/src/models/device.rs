use serde::{Deserialize, Serialize};

use super::error::AudioError;

/// Direction audio flows through an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFlow {
    Capture,
    Render,
}

/// Connection state of an endpoint at the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceState {
    Active,
    Disabled,
    NotPresent,
    Unplugged,
}

impl DeviceState {
    /// Bit used for this state in an endpoint state mask.
    pub fn mask_bit(self) -> u32 {
        match self {
            Self::Active => 0x1,
            Self::Disabled => 0x2,
            Self::NotPresent => 0x4,
            Self::Unplugged => 0x8,
        }
    }

    pub fn from_mask_bit(bit: u32) -> Option<Self> {
        match bit {
            0x1 => Some(Self::Active),
            0x2 => Some(Self::Disabled),
            0x4 => Some(Self::NotPresent),
            0x8 => Some(Self::Unplugged),
            _ => None,
        }
    }
}

/// Which endpoints an enumeration returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateFilter {
    #[default]
    Active,
    All,
}

impl StateFilter {
    pub fn mask(self) -> u32 {
        match self {
            Self::Active => DeviceState::Active.mask_bit(),
            Self::All => 0xF,
        }
    }

    pub fn admits(self, state: DeviceState) -> bool {
        self.mask() & state.mask_bit() != 0
    }
}

/// Physical transport behind an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    BuiltIn,
    Bluetooth,
    BluetoothLE,
    Usb,
    Unknown,
}

impl TransportType {
    /// Classify from a device's enumerator name (`BTHENUM`, `USB`, ...).
    pub fn from_enumerator_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.contains("BTHLEENUM") {
            Self::BluetoothLE
        } else if upper.contains("BTHENUM") {
            Self::Bluetooth
        } else if upper.contains("USB") {
            Self::Usb
        } else if upper.is_empty() {
            Self::Unknown
        } else {
            Self::BuiltIn
        }
    }
}

/// An endpoint as seen in one enumeration snapshot.
///
/// Descriptors are never updated in place; a device that changes state simply
/// shows up differently in the next snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub flow: DataFlow,
    pub state: DeviceState,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, flow: DataFlow, state: DeviceState) -> Self {
        Self {
            id: id.into(),
            flow,
            state,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == DeviceState::Active
    }

    /// Fail with `DeviceLost` unless `current` (a fresh state read) is active.
    pub fn ensure_active(&self, current: DeviceState) -> Result<(), AudioError> {
        if current == DeviceState::Active {
            Ok(())
        } else {
            Err(AudioError::DeviceLost(format!("{} is {:?}", self.id, current)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_filter_admits_only_active() {
        assert!(StateFilter::Active.admits(DeviceState::Active));
        assert!(!StateFilter::Active.admits(DeviceState::Unplugged));
        assert!(StateFilter::All.admits(DeviceState::NotPresent));
    }

    #[test]
    fn mask_bits_round_trip() {
        for state in [
            DeviceState::Active,
            DeviceState::Disabled,
            DeviceState::NotPresent,
            DeviceState::Unplugged,
        ] {
            assert_eq!(DeviceState::from_mask_bit(state.mask_bit()), Some(state));
        }
        assert_eq!(DeviceState::from_mask_bit(0x10), None);
    }

    #[test]
    fn transport_from_enumerator_name() {
        assert_eq!(TransportType::from_enumerator_name("BTHENUM"), TransportType::Bluetooth);
        assert_eq!(TransportType::from_enumerator_name("BTHLEENUM"), TransportType::BluetoothLE);
        assert_eq!(TransportType::from_enumerator_name("USB"), TransportType::Usb);
        assert_eq!(TransportType::from_enumerator_name("HDAUDIO"), TransportType::BuiltIn);
        assert_eq!(TransportType::from_enumerator_name(""), TransportType::Unknown);
    }

    #[test]
    fn ensure_active_reports_lost_device() {
        let d = DeviceDescriptor::new("mic-1", DataFlow::Capture, DeviceState::Active);
        assert!(d.ensure_active(DeviceState::Active).is_ok());
        assert!(matches!(
            d.ensure_active(DeviceState::NotPresent),
            Err(AudioError::DeviceLost(_))
        ));
    }
}
