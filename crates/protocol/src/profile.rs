use serde::{Deserialize, Serialize};

/// Hardware class of a peer, as reported in its `join` message.
///
/// Wire values are fixed integers; changing them breaks interop with
/// deployed peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DeviceClass {
    #[default]
    Unknown = 0,
    Pc = 1,
    Pad = 2,
    Tv = 3,
    Mobile = 4,
}

/// Network link type of a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LinkType {
    #[default]
    Unknown = 0,
    Ethernet = 1,
    Wifi = 2,
    Cellular = 3,
}

/// Power state of a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PowerSource {
    #[default]
    Unknown = 0,
    Plugged = 1,
    Battery = 2,
    LowBattery = 3,
}

impl From<DeviceClass> for u8 {
    fn from(v: DeviceClass) -> u8 {
        v as u8
    }
}

impl TryFrom<u8> for DeviceClass {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Pc),
            2 => Ok(Self::Pad),
            3 => Ok(Self::Tv),
            4 => Ok(Self::Mobile),
            other => Err(format!("invalid device class: {other}")),
        }
    }
}

impl From<LinkType> for u8 {
    fn from(v: LinkType) -> u8 {
        v as u8
    }
}

impl TryFrom<u8> for LinkType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Ethernet),
            2 => Ok(Self::Wifi),
            3 => Ok(Self::Cellular),
            other => Err(format!("invalid link type: {other}")),
        }
    }
}

impl From<PowerSource> for u8 {
    fn from(v: PowerSource) -> u8 {
        v as u8
    }
}

impl TryFrom<u8> for PowerSource {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Plugged),
            2 => Ok(Self::Battery),
            3 => Ok(Self::LowBattery),
            other => Err(format!("invalid power source: {other}")),
        }
    }
}

/// Device profile carried by a `join` message and fed to the election scorer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device: DeviceClass,
    pub link: LinkType,
    pub power: PowerSource,
}

impl DeviceProfile {
    pub fn new(device: DeviceClass, link: LinkType, power: PowerSource) -> Self {
        Self {
            device,
            link,
            power,
        }
    }
}

/// Optional network measurements a peer may report alongside its profile.
///
/// `loss` is a fraction in [0, 1]; `bandwidth_bps` is bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetMetrics {
    pub bandwidth_bps: f64,
    pub latency_ms: f64,
    pub loss: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_class_wire_values() {
        assert_eq!(u8::from(DeviceClass::Unknown), 0);
        assert_eq!(u8::from(DeviceClass::Pc), 1);
        assert_eq!(u8::from(DeviceClass::Pad), 2);
        assert_eq!(u8::from(DeviceClass::Tv), 3);
        assert_eq!(u8::from(DeviceClass::Mobile), 4);
    }

    #[test]
    fn link_and_power_wire_values() {
        assert_eq!(u8::from(LinkType::Ethernet), 1);
        assert_eq!(u8::from(LinkType::Wifi), 2);
        assert_eq!(u8::from(LinkType::Cellular), 3);
        assert_eq!(u8::from(PowerSource::Plugged), 1);
        assert_eq!(u8::from(PowerSource::Battery), 2);
        assert_eq!(u8::from(PowerSource::LowBattery), 3);
    }

    #[test]
    fn profile_serializes_as_integers() {
        let profile = DeviceProfile::new(DeviceClass::Pc, LinkType::Ethernet, PowerSource::Plugged);
        let json = serde_json::to_string(&profile).unwrap();
        assert_eq!(json, r#"{"device":1,"link":1,"power":1}"#);
    }

    #[test]
    fn profile_from_wire_integers() {
        let profile: DeviceProfile =
            serde_json::from_str(r#"{"device":4,"link":2,"power":2}"#).unwrap();
        assert_eq!(profile.device, DeviceClass::Mobile);
        assert_eq!(profile.link, LinkType::Wifi);
        assert_eq!(profile.power, PowerSource::Battery);
    }

    #[test]
    fn out_of_range_device_rejected() {
        let err = serde_json::from_str::<DeviceProfile>(r#"{"device":9,"link":0,"power":0}"#);
        assert!(err.is_err());
    }

    #[test]
    fn defaults_are_unknown() {
        let profile = DeviceProfile::default();
        assert_eq!(profile.device, DeviceClass::Unknown);
        assert_eq!(profile.link, LinkType::Unknown);
        assert_eq!(profile.power, PowerSource::Unknown);
    }
}
