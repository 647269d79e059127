//! In-memory backend that simulates YubiKeys on USB ports and NFC readers.

mod fido;
mod key;
mod management;
mod oath;
mod otp;

pub use key::SimulatedKey;

use crate::backend::{
    Connection, Ctap2Session, DeviceBackend, ManagementSession, OathSession, UsbScan, YubiKeyDevice,
    YubiOtpSession,
};
use crate::error::{DeviceError, DeviceResult};
use crate::fido::{FidoCredential, RelyingParty};
use crate::types::{Capabilities, ConnectionKind, DeviceInfo, FormFactor, KeyType, Transport, UsbPid};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// A simulated key as described in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedDevice {
    pub serial: Option<u32>,
    /// Firmware version as `"major.minor.patch"`.
    pub version: String,
    pub key_type: KeyType,
    /// USB interfaces, e.g. `"OTP+FIDO+CCID"`.
    pub interfaces: String,
    pub form_factor: FormFactor,
    pub nfc: bool,
    pub fips: bool,
    /// Put the key on this NFC reader instead of a USB port.
    pub reader: Option<String>,
    pub pin: Option<String>,
    pub oath_password: Option<String>,
    /// `otpauth://` URIs preloaded into the OATH application.
    pub oath_accounts: Vec<String>,
    pub fido_credentials: Vec<SimulatedFidoCredential>,
    /// Names of enrolled fingerprints. Only bio keys use these.
    pub fingerprints: Vec<String>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            serial: Some(12345678),
            version: "5.4.3".to_string(),
            key_type: KeyType::Yk4,
            interfaces: "OTP+FIDO+CCID".to_string(),
            form_factor: FormFactor::UsbAKeychain,
            nfc: true,
            fips: false,
            reader: None,
            pin: None,
            oath_password: None,
            oath_accounts: Vec::new(),
            fido_credentials: Vec::new(),
            fingerprints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedFidoCredential {
    pub rp_id: String,
    pub user_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl SimulatedFidoCredential {
    pub(crate) fn to_entry(&self) -> (RelyingParty, FidoCredential) {
        let mut hasher = Sha256::new();
        hasher.update(self.rp_id.as_bytes());
        hasher.update(self.user_name.as_bytes());
        let credential_id = hasher.finalize()[..16].to_vec();

        (
            RelyingParty {
                rp_id: self.rp_id.clone(),
                rp_id_hash: key::rp_id_hash(&self.rp_id),
            },
            FidoCredential {
                credential_id,
                user_id: self.user_name.as_bytes().to_vec(),
                user_name: self.user_name.clone(),
                display_name: self.display_name.clone(),
            },
        )
    }
}

#[derive(Debug, Default)]
struct Attached {
    keys: Vec<Arc<SimulatedKey>>,
    readers: Vec<String>,
    changes: u64,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    attached: Mutex<Attached>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices(devices: &[SimulatedDevice]) -> DeviceResult<Self> {
        let mut attached = Attached::default();
        for spec in devices {
            let key = SimulatedKey::new(spec)?;
            if let Some(reader) = key.reader() {
                if !attached.readers.iter().any(|r| r == reader) {
                    attached.readers.push(reader.to_string());
                }
            }
            attached.keys.push(Arc::new(key));
        }
        Ok(Self {
            attached: Mutex::new(attached),
        })
    }

    pub async fn attach(&self, spec: &SimulatedDevice) -> DeviceResult<Arc<SimulatedKey>> {
        let key = Arc::new(SimulatedKey::new(spec)?);
        let mut attached = self.attached.lock().await;
        if let Some(reader) = key.reader() {
            if !attached.readers.iter().any(|r| r == reader) {
                attached.readers.push(reader.to_string());
            }
        }
        info!(serial = ?key.serial(), transport = %key.transport(), "simulated key attached");
        attached.keys.push(key.clone());
        attached.changes += 1;
        Ok(key)
    }

    /// Removes a key. Open connections to it start failing.
    pub async fn detach(&self, serial: u32) -> bool {
        let mut attached = self.attached.lock().await;
        let before = attached.keys.len();
        attached.keys.retain(|key| {
            let matches = key.serial() == Some(serial);
            if matches {
                key.remove();
            }
            !matches
        });
        let removed = attached.keys.len() != before;
        if removed {
            info!(serial, "simulated key detached");
            attached.changes += 1;
        }
        removed
    }

    /// Adds an empty NFC reader.
    pub async fn add_reader(&self, name: &str) {
        let mut attached = self.attached.lock().await;
        if !attached.readers.iter().any(|r| r == name) {
            attached.readers.push(name.to_string());
        }
    }

    pub async fn key(&self, serial: u32) -> Option<Arc<SimulatedKey>> {
        self.attached
            .lock()
            .await
            .keys
            .iter()
            .find(|key| key.serial() == Some(serial))
            .cloned()
    }

    fn usb_keys(attached: &MutexGuard<'_, Attached>) -> Vec<Arc<SimulatedKey>> {
        attached
            .keys
            .iter()
            .filter(|key| key.transport() == Transport::Usb)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DeviceBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn scan_usb(&self) -> DeviceResult<UsbScan> {
        let attached = self.attached.lock().await;
        let mut scan = UsbScan::default();
        let mut hasher = DefaultHasher::new();
        attached.changes.hash(&mut hasher);
        for key in Self::usb_keys(&attached) {
            *scan.pids.entry(key.pid()).or_insert(0) += 1;
            (key.serial(), key.generation()).hash(&mut hasher);
        }
        scan.state = hasher.finish().max(1);
        Ok(scan)
    }

    async fn list_usb(&self) -> DeviceResult<Vec<(Arc<dyn YubiKeyDevice>, DeviceInfo)>> {
        let attached = self.attached.lock().await;
        let mut devices: Vec<(Arc<dyn YubiKeyDevice>, DeviceInfo)> = Vec::new();
        for key in Self::usb_keys(&attached) {
            let info = key.device_info(&*key.state.lock().await);
            let Some(handle) = ConnectionKind::CONNECT_ORDER
                .into_iter()
                .find(|kind| key.pid().interfaces.supports_connection(*kind))
            else {
                continue;
            };
            devices.push((Arc::new(MemoryUsbDevice { key, handle }), info));
        }
        Ok(devices)
    }

    async fn list_readers(&self) -> DeviceResult<Vec<Arc<dyn YubiKeyDevice>>> {
        let attached = self.attached.lock().await;
        let mut readers: Vec<Arc<dyn YubiKeyDevice>> = Vec::new();

        // USB keys with a CCID interface show up as readers too.
        for (index, key) in Self::usb_keys(&attached).into_iter().enumerate() {
            if key.pid().interfaces.supports_connection(ConnectionKind::SmartCard) {
                readers.push(Arc::new(MemoryReader {
                    name: format!("Yubico YubiKey {} {:02} 00", key.pid().interfaces, index),
                    transport: Transport::Usb,
                    key: Some(key),
                }));
            }
        }
        for name in &attached.readers {
            let key = attached
                .keys
                .iter()
                .find(|key| key.reader() == Some(name.as_str()))
                .cloned();
            readers.push(Arc::new(MemoryReader {
                name: name.clone(),
                transport: Transport::Nfc,
                key,
            }));
        }
        Ok(readers)
    }

    async fn connect(&self, serial: Option<u32>, kind: ConnectionKind) -> DeviceResult<Arc<dyn Connection>> {
        let attached = self.attached.lock().await;
        let candidates: Vec<Arc<SimulatedKey>> = Self::usb_keys(&attached)
            .into_iter()
            .filter(|key| key.pid().interfaces.supports_connection(kind))
            .collect();

        let key = match serial {
            Some(serial) => candidates
                .into_iter()
                .find(|key| key.serial() == Some(serial))
                .ok_or_else(|| DeviceError::NotFound(format!("no YubiKey with serial {}", serial)))?,
            None => {
                if candidates.len() != 1 {
                    return Err(DeviceError::Command("Unable to uniquely identify device".to_string()));
                }
                candidates
                    .into_iter()
                    .next()
                    .ok_or_else(|| DeviceError::NotFound("no YubiKey attached".to_string()))?
            }
        };
        debug!(serial = ?key.serial(), ?kind, "reconnected");
        Ok(MemoryConnection::open(key, kind, Transport::Usb))
    }
}

/// One enumerated USB interface of a key.
struct MemoryUsbDevice {
    key: Arc<SimulatedKey>,
    handle: ConnectionKind,
}

#[async_trait]
impl YubiKeyDevice for MemoryUsbDevice {
    fn transport(&self) -> Transport {
        Transport::Usb
    }

    fn pid(&self) -> Option<UsbPid> {
        Some(self.key.pid())
    }

    fn supports_connection(&self, kind: ConnectionKind) -> bool {
        kind == self.handle
    }

    async fn open_connection(&self, kind: ConnectionKind) -> DeviceResult<Arc<dyn Connection>> {
        if !self.supports_connection(kind) {
            return Err(DeviceError::NotSupported(format!("{:?} over this handle", kind)));
        }
        self.key.check(self.key.generation())?;
        Ok(MemoryConnection::open(self.key.clone(), kind, Transport::Usb))
    }
}

struct MemoryReader {
    name: String,
    transport: Transport,
    key: Option<Arc<SimulatedKey>>,
}

#[async_trait]
impl YubiKeyDevice for MemoryReader {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn pid(&self) -> Option<UsbPid> {
        None
    }

    fn reader_name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn supports_connection(&self, kind: ConnectionKind) -> bool {
        matches!(kind, ConnectionKind::SmartCard | ConnectionKind::Fido)
    }

    async fn open_connection(&self, kind: ConnectionKind) -> DeviceResult<Arc<dyn Connection>> {
        let key = self
            .key
            .as_ref()
            .filter(|key| key.is_present())
            .ok_or_else(|| DeviceError::ConnectionLost(format!("no card in {}", self.name)))?;
        if !self.supports_connection(kind) {
            return Err(DeviceError::NotSupported(format!("{:?} over NFC", kind)));
        }
        Ok(MemoryConnection::open(key.clone(), kind, self.transport))
    }
}

/// The part of a connection its sessions share.
#[derive(Debug)]
pub(crate) struct Link {
    pub key: Arc<SimulatedKey>,
    generation: u64,
    closed: AtomicBool,
}

impl Link {
    pub fn ensure(&self) -> DeviceResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::ConnectionLost("connection closed".to_string()));
        }
        self.key.check(self.generation)
    }

    pub async fn lock(&self) -> DeviceResult<MutexGuard<'_, key::KeyState>> {
        self.ensure()?;
        self.key.lock(self.generation).await
    }
}

struct MemoryConnection {
    link: Arc<Link>,
    kind: ConnectionKind,
    transport: Transport,
}

static CONNECTIONS: AtomicU64 = AtomicU64::new(0);

impl MemoryConnection {
    fn open(key: Arc<SimulatedKey>, kind: ConnectionKind, transport: Transport) -> Arc<dyn Connection> {
        let id = CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        debug!(id, ?kind, %transport, "open simulated connection");
        let generation = key.generation();
        Arc::new(MemoryConnection {
            link: Arc::new(Link {
                key,
                generation,
                closed: AtomicBool::new(false),
            }),
            kind,
            transport,
        })
    }

    async fn enabled(&self, capability: Capabilities) -> DeviceResult<bool> {
        let state = self.link.lock().await?;
        Ok(state.config.enabled(self.transport).contains(capability))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    fn transport(&self) -> Transport {
        self.transport
    }

    async fn read_info(&self, _pid: Option<UsbPid>) -> DeviceResult<DeviceInfo> {
        let state = self.link.lock().await?;
        Ok(self.link.key.device_info(&state))
    }

    async fn management(&self) -> DeviceResult<Arc<dyn ManagementSession>> {
        self.link.ensure()?;
        Ok(Arc::new(management::MemoryManagement::new(self.link.clone(), self.kind)))
    }

    async fn oath(&self) -> DeviceResult<Arc<dyn OathSession>> {
        if self.kind != ConnectionKind::SmartCard || !self.enabled(Capabilities::OATH).await? {
            return Err(DeviceError::NotSupported("OATH application".to_string()));
        }
        Ok(Arc::new(oath::MemoryOath::open(self.link.clone()).await?))
    }

    async fn yubiotp(&self) -> DeviceResult<Arc<dyn YubiOtpSession>> {
        if self.kind == ConnectionKind::Fido || !self.enabled(Capabilities::OTP).await? {
            return Err(DeviceError::NotSupported("OTP application".to_string()));
        }
        Ok(Arc::new(otp::MemoryOtp::new(self.link.clone())))
    }

    async fn ctap2(&self) -> DeviceResult<Arc<dyn Ctap2Session>> {
        if self.kind != ConnectionKind::Fido || !self.enabled(Capabilities::FIDO2).await? {
            return Err(DeviceError::NotSupported("CTAP2".to_string()));
        }
        Ok(Arc::new(fido::MemoryCtap2::new(self.link.clone())))
    }

    async fn close(&self) -> DeviceResult<()> {
        debug!(kind = ?self.kind, "close simulated connection");
        self.link.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
