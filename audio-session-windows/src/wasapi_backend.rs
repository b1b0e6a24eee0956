//! Endpoint enumeration and property lookup via the MMDevice API.

use windows::core::{Interface, GUID, HSTRING};
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::StructuredStorage::PropVariantClear;
use windows::Win32::System::Com::*;
use windows::Win32::System::Variant::VT_LPWSTR;
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};

use audio_session_core::models::device::{DataFlow, DeviceDescriptor, DeviceState, StateFilter};
use audio_session_core::models::error::AudioError;
use audio_session_core::models::property::PropertyKey;
use audio_session_core::traits::backend::{AudioBackend, DeviceHandle, PropertyStore};

use crate::com::{ensure_com, map_error, take_pwstr};
use crate::wasapi_client::WasapiDevice;

pub(crate) fn to_edataflow(flow: DataFlow) -> EDataFlow {
    match flow {
        DataFlow::Capture => eCapture,
        DataFlow::Render => eRender,
    }
}

fn from_edataflow(flow: EDataFlow) -> Result<DataFlow, AudioError> {
    if flow == eCapture {
        Ok(DataFlow::Capture)
    } else if flow == eRender {
        Ok(DataFlow::Render)
    } else {
        Err(AudioError::Initialization(format!("unexpected data flow {}", flow.0)))
    }
}

fn to_propertykey(key: &PropertyKey) -> PROPERTYKEY {
    PROPERTYKEY {
        fmtid: GUID::from_u128(key.fmtid.as_u128()),
        pid: key.pid,
    }
}

/// Read the id, direction and state of an endpoint.
pub(crate) fn describe(device: &IMMDevice) -> Result<DeviceDescriptor, AudioError> {
    unsafe {
        let id = device
            .GetId()
            .map_err(|e| map_error("IMMDevice::GetId", e))
            .map(|id| take_pwstr(id).unwrap_or_default())?;
        let state = device.GetState().map_err(|e| map_error("IMMDevice::GetState", e))?;
        let flow = device
            .cast::<IMMEndpoint>()
            .and_then(|endpoint| endpoint.GetDataFlow())
            .map_err(|e| map_error("IMMEndpoint::GetDataFlow", e))?;

        Ok(DeviceDescriptor::new(
            id,
            from_edataflow(flow)?,
            DeviceState::from_mask_bit(state.0).unwrap_or(DeviceState::NotPresent),
        ))
    }
}

/// [`AudioBackend`] over WASAPI.
///
/// Every call joins the multithreaded COM apartment on the calling thread if
/// it has not already, so the backend can be used from any thread.
pub struct WasapiBackend {
    enumerator: IMMDeviceEnumerator,
}

// SAFETY: The enumerator is created in the multithreaded apartment and MMDevice
// API objects are free-threaded there.
unsafe impl Send for WasapiBackend {}
unsafe impl Sync for WasapiBackend {}

impl WasapiBackend {
    pub fn new() -> Result<Self, AudioError> {
        ensure_com()?;
        let enumerator: IMMDeviceEnumerator = unsafe {
            CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                .map_err(|e| map_error("failed to create enumerator", e))?
        };
        Ok(Self { enumerator })
    }

    fn get_device(&self, id: &str) -> Result<IMMDevice, AudioError> {
        ensure_com()?;
        unsafe {
            self.enumerator
                .GetDevice(&HSTRING::from(id))
                .map_err(|e| match map_error("IMMDeviceEnumerator::GetDevice", e) {
                    AudioError::Initialization(_) => AudioError::DeviceNotFound(id.to_string()),
                    other => other,
                })
        }
    }
}

impl AudioBackend for WasapiBackend {
    fn name(&self) -> &str {
        "wasapi"
    }

    fn enumerate(&self, flow: DataFlow, filter: StateFilter) -> Result<Vec<DeviceDescriptor>, AudioError> {
        ensure_com()?;
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(to_edataflow(flow), DEVICE_STATE(filter.mask()))
                .map_err(|e| map_error("EnumAudioEndpoints", e))?;
            let count = collection.GetCount().map_err(|e| map_error("GetCount", e))?;

            let mut devices = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = match collection.Item(i) {
                    Ok(d) => d,
                    Err(e) => {
                        // Endpoints can disappear between GetCount and Item.
                        log::debug!("skipping endpoint {}: {}", i, e);
                        continue;
                    }
                };
                match describe(&device) {
                    Ok(descriptor) => devices.push(descriptor),
                    Err(e) => log::debug!("skipping endpoint {}: {}", i, e),
                }
            }
            Ok(devices)
        }
    }

    fn device(&self, id: &str) -> Result<DeviceDescriptor, AudioError> {
        describe(&self.get_device(id)?)
    }

    fn default_endpoint(&self, flow: DataFlow) -> Result<DeviceDescriptor, AudioError> {
        ensure_com()?;
        let device = unsafe {
            self.enumerator
                .GetDefaultAudioEndpoint(to_edataflow(flow), eConsole)
                .map_err(|_| AudioError::DeviceNotFound(format!("no default {:?} endpoint", flow)))?
        };
        describe(&device)
    }

    fn open_property_store(&self, id: &str) -> Result<Box<dyn PropertyStore>, AudioError> {
        let device = self.get_device(id)?;
        let store = unsafe {
            device
                .OpenPropertyStore(STGM_READ)
                .map_err(|e| map_error("OpenPropertyStore", e))?
        };
        Ok(Box::new(WasapiPropertyStore { store }))
    }

    fn open_device(&self, id: &str) -> Result<Box<dyn DeviceHandle>, AudioError> {
        let device = self.get_device(id)?;
        let descriptor = describe(&device)?;
        Ok(Box::new(WasapiDevice::new(device, descriptor)))
    }
}

struct WasapiPropertyStore {
    store: IPropertyStore,
}

impl PropertyStore for WasapiPropertyStore {
    fn get_string(&self, key: &PropertyKey) -> Result<String, AudioError> {
        ensure_com()?;
        let unavailable = || AudioError::PropertyUnavailable(key.to_string());
        unsafe {
            let mut prop = self
                .store
                .GetValue(&to_propertykey(key))
                .map_err(|_| unavailable())?;

            let value = if prop.Anonymous.Anonymous.vt == VT_LPWSTR {
                let pwsz = prop.Anonymous.Anonymous.Anonymous.pwszVal;
                if pwsz.is_null() {
                    None
                } else {
                    pwsz.to_string().ok()
                }
            } else {
                None
            };

            PropVariantClear(&mut prop).ok();
            value.ok_or_else(unavailable)
        }
    }
}
