use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use super::error::AudioError;

/// A property-store key: format id plus property id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyKey {
    pub fmtid: Uuid,
    pub pid: u32,
}

/// `PKEY_Device_FriendlyName`
pub const PKEY_DEVICE_FRIENDLY_NAME: PropertyKey = PropertyKey {
    fmtid: Uuid::from_u128(0xa45c254e_df1c_4efd_8020_67d146a850e0),
    pid: 14,
};

/// `PKEY_Device_DeviceDesc`
pub const PKEY_DEVICE_DESCRIPTION: PropertyKey = PropertyKey {
    fmtid: Uuid::from_u128(0xa45c254e_df1c_4efd_8020_67d146a850e0),
    pid: 2,
};

/// `PKEY_Device_EnumeratorName`
pub const PKEY_DEVICE_ENUMERATOR_NAME: PropertyKey = PropertyKey {
    fmtid: Uuid::from_u128(0xa45c254e_df1c_4efd_8020_67d146a850e0),
    pid: 24,
};

impl PropertyKey {
    pub const fn new(fmtid: Uuid, pid: u32) -> Self {
        Self { fmtid, pid }
    }
}

/// Parses the canonical `"{fmtid} pid"` form, e.g.
/// `"{a45c254e-df1c-4efd-8020-67d146a850e0} 14"`.
impl FromStr for PropertyKey {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AudioError::PropertyUnavailable(format!("malformed property key: {:?}", s));

        let (guid, pid) = s.trim().split_once(char::is_whitespace).ok_or_else(invalid)?;
        let guid = guid
            .strip_prefix('{')
            .and_then(|g| g.strip_suffix('}'))
            .ok_or_else(invalid)?;
        let fmtid = Uuid::parse_str(guid).map_err(|_| invalid())?;
        let pid = pid.trim().parse::<u32>().map_err(|_| invalid())?;

        Ok(Self { fmtid, pid })
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}} {}", self.fmtid, self.pid)
    }
}
