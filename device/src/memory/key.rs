use super::SimulatedDevice;
use crate::error::{DeviceError, DeviceResult};
use crate::fido::{FidoCredential, RelyingParty};
use crate::oath::CredentialData;
use crate::types::{
    Capabilities, DeviceConfig, DeviceInfo, FormFactor, KeyType, Transport, UsbInterfaces, UsbPid, Version,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) const DEFAULT_PIN_RETRIES: u8 = 8;
pub(crate) const MAX_FINGERPRINTS: usize = 5;
pub(crate) const SAMPLES_PER_ENROLLMENT: u32 = 4;

#[derive(Debug, Clone)]
pub(crate) struct StoredCredential {
    pub data: CredentialData,
    pub touch: bool,
}

#[derive(Debug, Default)]
pub(crate) struct OathState {
    pub salt: Vec<u8>,
    pub access_key: Option<Vec<u8>>,
    pub credentials: BTreeMap<Vec<u8>, StoredCredential>,
}

#[derive(Debug, Clone)]
pub(crate) struct SlotConfig {
    pub key: Vec<u8>,
    pub touch: bool,
    pub acc_code: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub(crate) struct OtpState {
    pub slots: [Option<SlotConfig>; 2],
    pub led_inverted: bool,
}

#[derive(Debug)]
pub(crate) struct FidoState {
    pub pin: Option<String>,
    pub pin_retries: u8,
    pub credentials: Vec<(RelyingParty, FidoCredential)>,
    pub templates: BTreeMap<Vec<u8>, Option<String>>,
    pub next_template: u16,
    /// Error codes returned by the next captures, before good samples.
    pub capture_errors: VecDeque<u8>,
}

impl Default for FidoState {
    fn default() -> Self {
        Self {
            pin: None,
            pin_retries: DEFAULT_PIN_RETRIES,
            credentials: Vec::new(),
            templates: BTreeMap::new(),
            next_template: 1,
            capture_errors: VecDeque::new(),
        }
    }
}

impl FidoState {
    pub fn add_template(&mut self, name: Option<String>) -> Vec<u8> {
        let template_id = self.next_template.to_be_bytes().to_vec();
        self.next_template = self.next_template.wrapping_add(1);
        self.templates.insert(template_id.clone(), name);
        template_id
    }
}

#[derive(Debug)]
pub(crate) struct KeyState {
    pub config: DeviceConfig,
    pub lock_code: Option<Vec<u8>>,
    pub oath: OathState,
    pub otp: OtpState,
    pub fido: FidoState,
}

/// A key that lives in memory.
///
/// It can sit on a USB port or on an NFC reader. Removing it, or rebooting
/// it through a config change, makes every open connection fail with
/// [`DeviceError::ConnectionLost`].
#[derive(Debug)]
pub struct SimulatedKey {
    serial: Option<u32>,
    pid: UsbPid,
    version: Version,
    form_factor: FormFactor,
    supported: BTreeMap<Transport, Capabilities>,
    is_fips: bool,
    is_sky: bool,
    reader: Option<String>,
    present: AtomicBool,
    touch_blocked: AtomicBool,
    generation: AtomicU64,
    pub(crate) state: Mutex<KeyState>,
}

impl SimulatedKey {
    pub fn new(spec: &SimulatedDevice) -> DeviceResult<Self> {
        let version: Version = spec.version.parse()?;
        let interfaces: UsbInterfaces = spec.interfaces.parse()?;
        let is_sky = spec.key_type == KeyType::Sky;

        let usb_capabilities = if is_sky {
            Capabilities(Capabilities::U2F.0 | Capabilities::FIDO2.0)
        } else {
            Capabilities::ALL
        };
        let mut supported = BTreeMap::new();
        supported.insert(Transport::Usb, usb_capabilities);
        if spec.nfc {
            supported.insert(Transport::Nfc, usb_capabilities);
        }

        let mut state = KeyState {
            config: DeviceConfig {
                enabled_capabilities: supported.clone(),
                ..DeviceConfig::default()
            },
            lock_code: None,
            oath: OathState {
                salt: rand::random::<[u8; 8]>().to_vec(),
                ..OathState::default()
            },
            otp: OtpState::default(),
            fido: FidoState {
                pin: spec.pin.clone(),
                ..FidoState::default()
            },
        };

        if let Some(password) = &spec.oath_password {
            state.oath.access_key = Some(crate::oath::derive_key(&state.oath.salt, password));
        }
        for uri in &spec.oath_accounts {
            let data = CredentialData::parse_uri(uri)?;
            state.oath.credentials.insert(
                data.id(),
                StoredCredential {
                    data,
                    touch: false,
                },
            );
        }
        for cred in &spec.fido_credentials {
            state.fido.credentials.push(cred.to_entry());
        }
        for name in &spec.fingerprints {
            state.fido.add_template(Some(name.clone()));
        }

        Ok(Self {
            serial: spec.serial,
            pid: UsbPid::new(spec.key_type, interfaces),
            version,
            form_factor: spec.form_factor,
            supported,
            is_fips: spec.fips,
            is_sky,
            reader: spec.reader.clone(),
            present: AtomicBool::new(true),
            touch_blocked: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            state: Mutex::new(state),
        })
    }

    pub fn serial(&self) -> Option<u32> {
        self.serial
    }

    pub fn pid(&self) -> UsbPid {
        self.pid
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn form_factor(&self) -> FormFactor {
        self.form_factor
    }

    /// Name of the NFC reader the key sits on, if it is not on USB.
    pub fn reader(&self) -> Option<&str> {
        self.reader.as_deref()
    }

    pub fn transport(&self) -> Transport {
        if self.reader.is_some() {
            Transport::Nfc
        } else {
            Transport::Usb
        }
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    pub(crate) fn remove(&self) {
        self.present.store(false, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn reboot(&self) {
        debug!(serial = ?self.serial, "simulated key rebooting");
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// While set, anything waiting for touch blocks until cancelled.
    pub fn set_touch_blocked(&self, blocked: bool) {
        self.touch_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Makes the next fingerprint captures fail with the given codes.
    pub async fn queue_capture_errors(&self, codes: impl IntoIterator<Item = u8>) {
        self.state.lock().await.fido.capture_errors.extend(codes);
    }

    pub(crate) fn check(&self, generation: u64) -> DeviceResult<()> {
        if !self.is_present() {
            return Err(DeviceError::ConnectionLost("device removed".to_string()));
        }
        if self.generation() != generation {
            return Err(DeviceError::ConnectionLost("device rebooted".to_string()));
        }
        Ok(())
    }

    pub(crate) async fn lock(&self, generation: u64) -> DeviceResult<MutexGuard<'_, KeyState>> {
        self.check(generation)?;
        Ok(self.state.lock().await)
    }

    pub(crate) fn device_info(&self, state: &KeyState) -> DeviceInfo {
        DeviceInfo {
            config: state.config.clone(),
            serial: self.serial,
            version: self.version,
            form_factor: self.form_factor,
            supported_capabilities: self.supported.clone(),
            is_locked: state.lock_code.is_some(),
            is_fips: self.is_fips,
            is_sky: self.is_sky,
        }
    }

    pub(crate) async fn wait_for_touch(&self, cancel: &CancellationToken) -> DeviceResult<()> {
        if cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        if self.touch_blocked.load(Ordering::SeqCst) {
            debug!("waiting for touch");
            cancel.cancelled().await;
            return Err(DeviceError::Cancelled);
        }
        Ok(())
    }
}

pub(crate) fn rp_id_hash(rp_id: &str) -> Vec<u8> {
    Sha256::digest(rp_id.as_bytes()).to_vec()
}
