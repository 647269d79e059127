use crate::error::DeviceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Firmware version, serialized as `[major, minor, patch]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version(pub u8, pub u8, pub u8);

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self(major, minor, patch)
    }

    pub fn major(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

impl FromStr for Version {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(DeviceError::InvalidData(format!("invalid version: {}", s)));
        }
        let mut numbers = [0u8; 3];
        for (slot, part) in numbers.iter_mut().zip(parts) {
            *slot = part
                .parse()
                .map_err(|_| DeviceError::InvalidData(format!("invalid version: {}", s)))?;
        }
        Ok(Version(numbers[0], numbers[1], numbers[2]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Usb,
    Nfc,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Usb => write!(f, "usb"),
            Transport::Nfc => write!(f, "nfc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    SmartCard,
    Otp,
    Fido,
}

impl ConnectionKind {
    /// Order in which connections are tried when any kind will do.
    pub const CONNECT_ORDER: [ConnectionKind; 3] = [
        ConnectionKind::SmartCard,
        ConnectionKind::Otp,
        ConnectionKind::Fido,
    ];
}

/// USB interfaces exposed by a key (OTP = 1, FIDO = 2, CCID = 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsbInterfaces(pub u8);

impl UsbInterfaces {
    pub const OTP: UsbInterfaces = UsbInterfaces(0x01);
    pub const FIDO: UsbInterfaces = UsbInterfaces(0x02);
    pub const CCID: UsbInterfaces = UsbInterfaces(0x04);
    pub const ALL: UsbInterfaces = UsbInterfaces(0x07);

    pub fn contains(&self, other: UsbInterfaces) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn union(self, other: UsbInterfaces) -> UsbInterfaces {
        UsbInterfaces(self.0 | other.0)
    }

    pub fn supports_connection(&self, kind: ConnectionKind) -> bool {
        match kind {
            ConnectionKind::SmartCard => self.contains(Self::CCID),
            ConnectionKind::Otp => self.contains(Self::OTP),
            ConnectionKind::Fido => self.contains(Self::FIDO),
        }
    }
}

impl fmt::Display for UsbInterfaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [(Self::OTP, "OTP"), (Self::FIDO, "FIDO"), (Self::CCID, "CCID")]
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("+"))
    }
}

impl FromStr for UsbInterfaces {
    type Err = DeviceError;

    /// Parses `"OTP+FIDO+CCID"` style strings (`U2F` is accepted for FIDO).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut interfaces = UsbInterfaces::default();
        for part in s.split('+') {
            let flag = match part.trim().to_ascii_uppercase().as_str() {
                "OTP" => Self::OTP,
                "FIDO" | "U2F" => Self::FIDO,
                "CCID" => Self::CCID,
                other => {
                    return Err(DeviceError::InvalidData(format!("unknown interface: {}", other)))
                }
            };
            interfaces = interfaces.union(flag);
        }
        Ok(interfaces)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Yks,
    Neo,
    Sky,
    Ykp,
    Yk4,
}

/// A USB product id, decomposed into key family and exposed interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub struct UsbPid {
    pub key_type: KeyType,
    pub interfaces: UsbInterfaces,
}

const NEO_PIDS: [(u8, u16); 7] = [
    (0x01, 0x0110),
    (0x05, 0x0111),
    (0x04, 0x0112),
    (0x02, 0x0113),
    (0x03, 0x0114),
    (0x06, 0x0115),
    (0x07, 0x0116),
];

impl UsbPid {
    pub fn new(key_type: KeyType, interfaces: UsbInterfaces) -> Self {
        Self {
            key_type,
            interfaces,
        }
    }

    pub fn value(&self) -> u16 {
        match self.key_type {
            KeyType::Yks => 0x0010,
            KeyType::Sky => 0x0120,
            KeyType::Ykp => 0x0410,
            KeyType::Yk4 => 0x0400 | self.interfaces.0 as u16,
            KeyType::Neo => NEO_PIDS
                .iter()
                .find(|(bits, _)| *bits == self.interfaces.0)
                .map(|(_, pid)| *pid)
                .unwrap_or(0x0110),
        }
    }

    pub fn from_value(value: u16) -> Option<Self> {
        let pid = match value {
            0x0010 => UsbPid::new(KeyType::Yks, UsbInterfaces::OTP),
            0x0120 => UsbPid::new(KeyType::Sky, UsbInterfaces::FIDO),
            0x0410 => UsbPid::new(KeyType::Ykp, UsbInterfaces::OTP.union(UsbInterfaces::FIDO)),
            0x0401..=0x0407 => UsbPid::new(KeyType::Yk4, UsbInterfaces((value & 0x07) as u8)),
            _ => {
                let (bits, _) = NEO_PIDS.iter().find(|(_, pid)| *pid == value)?;
                UsbPid::new(KeyType::Neo, UsbInterfaces(*bits))
            }
        };
        Some(pid)
    }
}

impl From<UsbPid> for u16 {
    fn from(pid: UsbPid) -> Self {
        pid.value()
    }
}

impl TryFrom<u16> for UsbPid {
    type Error = DeviceError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        UsbPid::from_value(value)
            .ok_or_else(|| DeviceError::InvalidData(format!("unknown USB product id: {:#06x}", value)))
    }
}

/// Application capabilities, as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub u16);

impl Capabilities {
    pub const OTP: Capabilities = Capabilities(0x0001);
    pub const U2F: Capabilities = Capabilities(0x0002);
    pub const OPENPGP: Capabilities = Capabilities(0x0008);
    pub const PIV: Capabilities = Capabilities(0x0010);
    pub const OATH: Capabilities = Capabilities(0x0020);
    pub const HSMAUTH: Capabilities = Capabilities(0x0100);
    pub const FIDO2: Capabilities = Capabilities(0x0200);
    pub const ALL: Capabilities = Capabilities(0x033b);

    pub fn contains(&self, other: Capabilities) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FormFactor {
    #[default]
    Unknown,
    UsbAKeychain,
    UsbANano,
    UsbCKeychain,
    UsbCNano,
    UsbCLightning,
    UsbABio,
    UsbCBio,
}

impl FormFactor {
    pub fn is_bio(&self) -> bool {
        matches!(self, FormFactor::UsbABio | FormFactor::UsbCBio)
    }

    pub fn is_usb_c(&self) -> bool {
        matches!(
            self,
            FormFactor::UsbCKeychain | FormFactor::UsbCNano | FormFactor::UsbCLightning | FormFactor::UsbCBio
        )
    }
}

impl From<FormFactor> for u8 {
    fn from(value: FormFactor) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for FormFactor {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => FormFactor::Unknown,
            1 => FormFactor::UsbAKeychain,
            2 => FormFactor::UsbANano,
            3 => FormFactor::UsbCKeychain,
            4 => FormFactor::UsbCNano,
            5 => FormFactor::UsbCLightning,
            6 => FormFactor::UsbABio,
            7 => FormFactor::UsbCBio,
            other => {
                return Err(DeviceError::InvalidData(format!("unknown form factor: {}", other)))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub enabled_capabilities: BTreeMap<Transport, Capabilities>,
    pub auto_eject_timeout: Option<u16>,
    pub challenge_response_timeout: Option<u8>,
    pub device_flags: Option<u8>,
}

impl DeviceConfig {
    pub fn enabled(&self, transport: Transport) -> Capabilities {
        self.enabled_capabilities
            .get(&transport)
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub config: DeviceConfig,
    pub serial: Option<u32>,
    pub version: Version,
    pub form_factor: FormFactor,
    pub supported_capabilities: BTreeMap<Transport, Capabilities>,
    pub is_locked: bool,
    pub is_fips: bool,
    pub is_sky: bool,
}

impl DeviceInfo {
    pub fn supports(&self, transport: Transport) -> Capabilities {
        self.supported_capabilities
            .get(&transport)
            .copied()
            .unwrap_or_default()
    }

    pub fn has_transport(&self, transport: Transport) -> bool {
        !self.supports(transport).is_empty()
    }
}
