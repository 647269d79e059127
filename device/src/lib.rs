//! Device side of keyrpc: the domain types of a YubiKey, the traits a
//! backend implements to expose one, and an in-memory backend.

pub mod backend;
pub mod error;
pub mod fido;
pub mod memory;
pub mod naming;
pub mod oath;
pub mod otp;
mod serde_hex;
pub mod types;

pub use backend::{
    BioEnrollment, Connection, CredentialManagement, Ctap2Session, DeviceBackend, Enroller,
    ManagementSession, OathSession, UsbScan, YubiKeyDevice, YubiOtpSession,
};
pub use error::{DeviceError, DeviceResult};
pub use memory::{MemoryBackend, SimulatedDevice, SimulatedFidoCredential, SimulatedKey};
pub use naming::product_name;
pub use types::{
    Capabilities, ConnectionKind, DeviceConfig, DeviceInfo, FormFactor, KeyType, Transport,
    UsbInterfaces, UsbPid, Version,
};

pub mod prelude {
    pub use crate::backend::*;
    pub use crate::error::*;
    pub use crate::types::*;
}
