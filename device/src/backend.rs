//! Seams between the RPC tree and whatever talks to real keys.
//!
//! Every handle is shared behind an `Arc` and takes `&self`, so a session
//! opened by one node can be handed to the nodes below it.

use crate::error::DeviceResult;
use crate::fido::{
    AuthenticatorInfo, CredentialMetadata, FidoCredential, PinPermissions, PinToken, RelyingParty,
};
use crate::oath::{self, Code, Credential, CredentialData};
use crate::otp::{ConfigState, Slot};
use crate::types::{ConnectionKind, DeviceConfig, DeviceInfo, Transport, UsbInterfaces, UsbPid, Version};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of enumerating attached USB keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbScan {
    /// Number of attached keys per product id.
    pub pids: BTreeMap<UsbPid, usize>,
    /// Changes whenever the set of attached keys changes.
    pub state: u64,
}

impl UsbScan {
    /// Number of attached keys exposing an interface for `kind`.
    pub fn count_supporting(&self, kind: ConnectionKind) -> usize {
        self.pids
            .iter()
            .filter(|(pid, _)| pid.interfaces.supports_connection(kind))
            .map(|(_, n)| n)
            .sum()
    }
}

#[async_trait]
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn scan_usb(&self) -> DeviceResult<UsbScan>;

    async fn list_usb(&self) -> DeviceResult<Vec<(Arc<dyn YubiKeyDevice>, DeviceInfo)>>;

    /// Every PC/SC reader, with or without a key present.
    async fn list_readers(&self) -> DeviceResult<Vec<Arc<dyn YubiKeyDevice>>>;

    /// Opens a connection to a USB key by serial, or to the only key exposing
    /// `kind` when no serial is given.
    async fn connect(&self, serial: Option<u32>, kind: ConnectionKind) -> DeviceResult<Arc<dyn Connection>>;
}

#[async_trait]
pub trait YubiKeyDevice: Send + Sync {
    fn transport(&self) -> Transport;

    fn pid(&self) -> Option<UsbPid>;

    fn reader_name(&self) -> Option<String> {
        None
    }

    fn supports_connection(&self, kind: ConnectionKind) -> bool;

    async fn open_connection(&self, kind: ConnectionKind) -> DeviceResult<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn kind(&self) -> ConnectionKind;

    fn transport(&self) -> Transport;

    async fn read_info(&self, pid: Option<UsbPid>) -> DeviceResult<DeviceInfo>;

    async fn management(&self) -> DeviceResult<Arc<dyn ManagementSession>>;

    async fn oath(&self) -> DeviceResult<Arc<dyn OathSession>>;

    async fn yubiotp(&self) -> DeviceResult<Arc<dyn YubiOtpSession>>;

    async fn ctap2(&self) -> DeviceResult<Arc<dyn Ctap2Session>>;

    async fn close(&self) -> DeviceResult<()>;
}

#[async_trait]
pub trait ManagementSession: Send + Sync {
    fn version(&self) -> Version;

    async fn read_device_info(&self) -> DeviceResult<DeviceInfo>;

    async fn write_device_config(
        &self,
        config: DeviceConfig,
        reboot: bool,
        cur_lock_code: Option<Vec<u8>>,
        new_lock_code: Option<Vec<u8>>,
    ) -> DeviceResult<()>;

    /// Legacy mode switch for firmware older than 5.
    async fn set_mode(
        &self,
        mode: UsbInterfaces,
        challenge_response_timeout: u8,
        auto_eject_timeout: u16,
    ) -> DeviceResult<()>;
}

#[async_trait]
pub trait OathSession: Send + Sync {
    fn version(&self) -> Version;

    fn salt(&self) -> Vec<u8>;

    fn device_id(&self) -> String {
        oath::device_id_from_salt(&self.salt())
    }

    fn derive_key(&self, password: &str) -> Vec<u8> {
        oath::derive_key(&self.salt(), password)
    }

    async fn has_key(&self) -> DeviceResult<bool>;

    /// True while an access key is set and has not been validated.
    async fn locked(&self) -> DeviceResult<bool>;

    async fn validate(&self, key: &[u8]) -> DeviceResult<()>;

    async fn set_key(&self, key: &[u8]) -> DeviceResult<()>;

    async fn unset_key(&self) -> DeviceResult<()>;

    /// Wipes all credentials and the access key.
    async fn reset(&self) -> DeviceResult<()>;

    async fn list_credentials(&self) -> DeviceResult<Vec<Credential>>;

    async fn put_credential(&self, data: &CredentialData, require_touch: bool) -> DeviceResult<Credential>;

    async fn rename_credential(
        &self,
        credential_id: &[u8],
        name: &str,
        issuer: Option<&str>,
    ) -> DeviceResult<Vec<u8>>;

    async fn delete_credential(&self, credential_id: &[u8]) -> DeviceResult<()>;

    /// Raw HMAC response for `challenge`.
    async fn calculate(&self, credential_id: &[u8], challenge: &[u8]) -> DeviceResult<Vec<u8>>;

    /// `timestamp` defaults to the current time.
    async fn calculate_code(&self, credential: &Credential, timestamp: Option<u64>) -> DeviceResult<Code>;

    /// Codes for every TOTP credential. HOTP and touch credentials get `None`.
    async fn calculate_all(&self, timestamp: Option<u64>) -> DeviceResult<Vec<(Credential, Option<Code>)>>;
}

#[async_trait]
pub trait YubiOtpSession: Send + Sync {
    fn version(&self) -> Version;

    async fn get_config_state(&self) -> DeviceResult<ConfigState>;

    async fn swap_slots(&self) -> DeviceResult<()>;

    async fn delete_slot(&self, slot: Slot, acc_code: Option<Vec<u8>>) -> DeviceResult<()>;

    async fn put_hmac_sha1(&self, slot: Slot, key: &[u8], require_touch: bool) -> DeviceResult<()>;

    /// Waits for touch on touch-triggered slots, aborting when `cancel` fires.
    async fn calculate_hmac_sha1(
        &self,
        slot: Slot,
        challenge: &[u8],
        cancel: &CancellationToken,
    ) -> DeviceResult<Vec<u8>>;
}

#[async_trait]
pub trait Ctap2Session: Send + Sync {
    async fn get_info(&self) -> DeviceResult<AuthenticatorInfo>;

    async fn get_pin_token(
        &self,
        pin: &str,
        permissions: PinPermissions,
        rp_id: Option<&str>,
    ) -> DeviceResult<PinToken>;

    async fn set_pin(&self, new_pin: &str) -> DeviceResult<()>;

    async fn change_pin(&self, pin: &str, new_pin: &str) -> DeviceResult<()>;

    /// Factory reset. Requires touch, so it honours `cancel`.
    async fn reset(&self, cancel: &CancellationToken) -> DeviceResult<()>;

    async fn credential_management(&self, token: PinToken) -> DeviceResult<Arc<dyn CredentialManagement>>;

    async fn bio_enrollment(&self, token: PinToken) -> DeviceResult<Arc<dyn BioEnrollment>>;
}

#[async_trait]
pub trait CredentialManagement: Send + Sync {
    async fn get_metadata(&self) -> DeviceResult<CredentialMetadata>;

    async fn enumerate_rps(&self) -> DeviceResult<Vec<RelyingParty>>;

    async fn enumerate_creds(&self, rp_id_hash: &[u8]) -> DeviceResult<Vec<FidoCredential>>;

    async fn delete_cred(&self, credential_id: &[u8]) -> DeviceResult<()>;
}

#[async_trait]
pub trait BioEnrollment: Send + Sync {
    /// Template id to friendly name.
    async fn enumerate_enrollments(&self) -> DeviceResult<BTreeMap<Vec<u8>, Option<String>>>;

    async fn enroll(&self) -> DeviceResult<Box<dyn Enroller>>;

    async fn set_name(&self, template_id: &[u8], name: &str) -> DeviceResult<()>;

    async fn remove_enrollment(&self, template_id: &[u8]) -> DeviceResult<()>;
}

/// An ongoing fingerprint enrollment.
#[async_trait]
pub trait Enroller: Send {
    /// Good samples still needed, if the authenticator reports it.
    fn remaining(&self) -> Option<u32>;

    /// Takes one sample. Returns the template id once enrollment completes.
    /// A bad sample fails with [`crate::DeviceError::Capture`].
    async fn capture(&mut self, cancel: &CancellationToken) -> DeviceResult<Option<Vec<u8>>>;
}
