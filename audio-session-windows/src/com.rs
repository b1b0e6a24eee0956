//! COM apartment management and HRESULT mapping shared by the WASAPI types.

use std::cell::RefCell;
use std::time::Duration;

use windows::core::{Error, PWSTR};
use windows::Win32::Foundation::{E_ACCESSDENIED, E_NOTFOUND, RPC_E_CHANGED_MODE};
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::{CoInitializeEx, CoTaskMemFree, CoUninitialize, COINIT_MULTITHREADED};

use audio_session_core::models::error::AudioError;

thread_local! {
    static APARTMENT: RefCell<Option<CoUninitializeGuard>> = const { RefCell::new(None) };
}

/// Join the multithreaded apartment on the calling thread, once per thread.
///
/// The apartment is left when the thread exits. A thread that is already in a
/// single-threaded apartment keeps it.
pub(crate) fn ensure_com() -> Result<(), AudioError> {
    APARTMENT.with(|cell| {
        if cell.borrow().is_some() {
            return Ok(());
        }
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            *cell.borrow_mut() = Some(CoUninitializeGuard { owned: false });
            return Ok(());
        }
        hr.ok()
            .map_err(|e| AudioError::Initialization(format!("CoInitializeEx failed: {}", e)))?;
        *cell.borrow_mut() = Some(CoUninitializeGuard { owned: true });
        Ok(())
    })
}

/// RAII guard to call CoUninitialize when dropped.
struct CoUninitializeGuard {
    owned: bool,
}

impl Drop for CoUninitializeGuard {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                CoUninitialize();
            }
        }
    }
}

/// Translate a platform failure into the engine's error taxonomy.
pub(crate) fn map_error(context: &str, e: Error) -> AudioError {
    let code = e.code();
    let detail = format!("{}: {}", context, e);
    if code == AUDCLNT_E_UNSUPPORTED_FORMAT {
        AudioError::FormatUnsupported(detail)
    } else if code == AUDCLNT_E_DEVICE_IN_USE || code == AUDCLNT_E_EXCLUSIVE_MODE_NOT_ALLOWED {
        AudioError::DeviceBusy(detail)
    } else if code == AUDCLNT_E_DEVICE_INVALIDATED || code == AUDCLNT_E_SERVICE_NOT_RUNNING {
        AudioError::DeviceLost(detail)
    } else if code == E_NOTFOUND {
        AudioError::DeviceNotFound(detail)
    } else if code == E_ACCESSDENIED {
        AudioError::DeviceBusy(format!("{} (microphone access disabled in privacy settings?)", detail))
    } else {
        AudioError::Initialization(detail)
    }
}

/// Copy a COM-allocated wide string and free it.
///
/// # Safety
/// `s` must be null or a string allocated with `CoTaskMemAlloc`.
pub(crate) unsafe fn take_pwstr(s: PWSTR) -> Option<String> {
    if s.is_null() {
        return None;
    }
    let value = s.to_string().ok();
    CoTaskMemFree(Some(s.0 as *const _));
    value
}

/// `REFERENCE_TIME` (100 ns units) for a duration.
pub(crate) fn to_hns(d: Duration) -> i64 {
    (d.as_nanos() / 100) as i64
}

pub(crate) fn from_hns(hns: i64) -> Duration {
    Duration::from_nanos(hns.max(0) as u64 * 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_time_conversions() {
        assert_eq!(to_hns(Duration::from_millis(10)), 100_000);
        assert_eq!(from_hns(30_000), Duration::from_millis(3));
        assert_eq!(from_hns(-5), Duration::ZERO);
    }

    #[test]
    fn audio_client_errors_map_to_taxonomy() {
        let lost = map_error("GetCurrentPadding", Error::from(AUDCLNT_E_DEVICE_INVALIDATED));
        assert!(matches!(lost, AudioError::DeviceLost(_)));

        let busy = map_error("Initialize", Error::from(AUDCLNT_E_DEVICE_IN_USE));
        assert!(matches!(busy, AudioError::DeviceBusy(_)));

        let format = map_error("Initialize", Error::from(AUDCLNT_E_UNSUPPORTED_FORMAT));
        assert!(matches!(format, AudioError::FormatUnsupported(_)));

        let missing = map_error("GetDevice", Error::from(E_NOTFOUND));
        assert!(matches!(missing, AudioError::DeviceNotFound(_)));
    }

    #[test]
    fn com_initializes_once_per_thread() {
        ensure_com().unwrap();
        ensure_com().unwrap();
    }
}
