use super::key::{FidoState, DEFAULT_PIN_RETRIES, MAX_FINGERPRINTS, SAMPLES_PER_ENROLLMENT};
use super::Link;
use crate::backend::{BioEnrollment, CredentialManagement, Ctap2Session, Enroller};
use crate::error::{DeviceError, DeviceResult};
use crate::fido::{
    AuthenticatorInfo, CredentialMetadata, FidoCredential, PinPermissions, PinToken, RelyingParty,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MIN_PIN_LENGTH: usize = 4;
const MAX_CREDENTIALS: u32 = 25;

pub(crate) struct MemoryCtap2 {
    link: Arc<Link>,
}

impl MemoryCtap2 {
    pub fn new(link: Arc<Link>) -> Self {
        Self { link }
    }
}

fn check_pin_length(pin: &str) -> DeviceResult<()> {
    if pin.chars().count() < MIN_PIN_LENGTH {
        return Err(DeviceError::InvalidData(format!(
            "PIN must be at least {} characters",
            MIN_PIN_LENGTH
        )));
    }
    Ok(())
}

fn verify_pin(fido: &mut FidoState, pin: &str) -> DeviceResult<()> {
    let expected = fido.pin.as_deref().ok_or(DeviceError::PinRequired)?;
    if fido.pin_retries == 0 {
        return Err(DeviceError::Command("PIN is blocked".to_string()));
    }
    if expected != pin {
        fido.pin_retries -= 1;
        return Err(DeviceError::PinInvalid {
            retries: fido.pin_retries,
        });
    }
    fido.pin_retries = DEFAULT_PIN_RETRIES;
    Ok(())
}

fn require_permission(token: &PinToken, permission: PinPermissions) -> DeviceResult<()> {
    if token.permissions.contains(permission) {
        Ok(())
    } else {
        Err(DeviceError::Command("PIN token lacks the required permission".to_string()))
    }
}

#[async_trait]
impl Ctap2Session for MemoryCtap2 {
    async fn get_info(&self) -> DeviceResult<AuthenticatorInfo> {
        let state = self.link.lock().await?;
        let bio = self.link.key.form_factor().is_bio();
        let mut options = json!({
            "rk": true,
            "up": true,
            "plat": false,
            "clientPin": state.fido.pin.is_some(),
            "credMgmt": true,
        });
        if bio {
            options["bioEnroll"] = json!(!state.fido.templates.is_empty());
        }
        let info = json!({
            "versions": ["U2F_V2", "FIDO_2_0", "FIDO_2_1"],
            "extensions": ["credProtect", "hmac-secret"],
            "aaguid": "ee882879721c491397753dfcce97072a",
            "options": options,
            "max_msg_size": 1200,
            "pin_uv_protocols": [2, 1],
            "firmware_version": self.link.key.version().to_string(),
        });
        match info {
            serde_json::Value::Object(map) => Ok(AuthenticatorInfo(map)),
            _ => Ok(AuthenticatorInfo::default()),
        }
    }

    async fn get_pin_token(
        &self,
        pin: &str,
        permissions: PinPermissions,
        _rp_id: Option<&str>,
    ) -> DeviceResult<PinToken> {
        let mut state = self.link.lock().await?;
        verify_pin(&mut state.fido, pin)?;
        Ok(PinToken {
            token: rand::random::<[u8; 32]>().to_vec(),
            permissions,
        })
    }

    async fn set_pin(&self, new_pin: &str) -> DeviceResult<()> {
        check_pin_length(new_pin)?;
        let mut state = self.link.lock().await?;
        if state.fido.pin.is_some() {
            return Err(DeviceError::Command("A PIN is already set".to_string()));
        }
        state.fido.pin = Some(new_pin.to_string());
        Ok(())
    }

    async fn change_pin(&self, pin: &str, new_pin: &str) -> DeviceResult<()> {
        check_pin_length(new_pin)?;
        let mut state = self.link.lock().await?;
        verify_pin(&mut state.fido, pin)?;
        state.fido.pin = Some(new_pin.to_string());
        Ok(())
    }

    async fn reset(&self, cancel: &CancellationToken) -> DeviceResult<()> {
        self.link.ensure()?;
        self.link.key.wait_for_touch(cancel).await?;
        let mut state = self.link.lock().await?;
        state.fido = FidoState::default();
        Ok(())
    }

    async fn credential_management(&self, token: PinToken) -> DeviceResult<Arc<dyn CredentialManagement>> {
        require_permission(&token, PinPermissions::CREDENTIAL_MGMT)?;
        self.link.ensure()?;
        Ok(Arc::new(MemoryCredentials {
            link: self.link.clone(),
        }))
    }

    async fn bio_enrollment(&self, token: PinToken) -> DeviceResult<Arc<dyn BioEnrollment>> {
        require_permission(&token, PinPermissions::BIO_ENROLL)?;
        if !self.link.key.form_factor().is_bio() {
            return Err(DeviceError::NotSupported("fingerprint enrollment".to_string()));
        }
        self.link.ensure()?;
        Ok(Arc::new(MemoryBio {
            link: self.link.clone(),
        }))
    }
}

struct MemoryCredentials {
    link: Arc<Link>,
}

#[async_trait]
impl CredentialManagement for MemoryCredentials {
    async fn get_metadata(&self) -> DeviceResult<CredentialMetadata> {
        let state = self.link.lock().await?;
        let existing = state.fido.credentials.len() as u32;
        Ok(CredentialMetadata {
            existing_cred_count: existing,
            max_remaining_count: MAX_CREDENTIALS.saturating_sub(existing),
        })
    }

    async fn enumerate_rps(&self) -> DeviceResult<Vec<RelyingParty>> {
        let state = self.link.lock().await?;
        let mut rps: Vec<RelyingParty> = Vec::new();
        for (rp, _) in &state.fido.credentials {
            if !rps.iter().any(|known| known.rp_id == rp.rp_id) {
                rps.push(rp.clone());
            }
        }
        Ok(rps)
    }

    async fn enumerate_creds(&self, rp_id_hash: &[u8]) -> DeviceResult<Vec<FidoCredential>> {
        let state = self.link.lock().await?;
        Ok(state
            .fido
            .credentials
            .iter()
            .filter(|(rp, _)| rp.rp_id_hash == rp_id_hash)
            .map(|(_, cred)| cred.clone())
            .collect())
    }

    async fn delete_cred(&self, credential_id: &[u8]) -> DeviceResult<()> {
        let mut state = self.link.lock().await?;
        let before = state.fido.credentials.len();
        state
            .fido
            .credentials
            .retain(|(_, cred)| cred.credential_id != credential_id);
        if state.fido.credentials.len() == before {
            return Err(DeviceError::NotFound(format!("credential {}", hex::encode(credential_id))));
        }
        Ok(())
    }
}

struct MemoryBio {
    link: Arc<Link>,
}

#[async_trait]
impl BioEnrollment for MemoryBio {
    async fn enumerate_enrollments(&self) -> DeviceResult<BTreeMap<Vec<u8>, Option<String>>> {
        Ok(self.link.lock().await?.fido.templates.clone())
    }

    async fn enroll(&self) -> DeviceResult<Box<dyn Enroller>> {
        let state = self.link.lock().await?;
        if state.fido.templates.len() >= MAX_FINGERPRINTS {
            return Err(DeviceError::Command("No space for more fingerprints".to_string()));
        }
        Ok(Box::new(MemoryEnroller {
            link: self.link.clone(),
            remaining: SAMPLES_PER_ENROLLMENT,
        }))
    }

    async fn set_name(&self, template_id: &[u8], name: &str) -> DeviceResult<()> {
        let mut state = self.link.lock().await?;
        let entry = state
            .fido
            .templates
            .get_mut(template_id)
            .ok_or_else(|| DeviceError::NotFound(format!("template {}", hex::encode(template_id))))?;
        *entry = Some(name.to_string());
        Ok(())
    }

    async fn remove_enrollment(&self, template_id: &[u8]) -> DeviceResult<()> {
        let mut state = self.link.lock().await?;
        state
            .fido
            .templates
            .remove(template_id)
            .map(|_| ())
            .ok_or_else(|| DeviceError::NotFound(format!("template {}", hex::encode(template_id))))
    }
}

struct MemoryEnroller {
    link: Arc<Link>,
    remaining: u32,
}

#[async_trait]
impl Enroller for MemoryEnroller {
    fn remaining(&self) -> Option<u32> {
        Some(self.remaining)
    }

    async fn capture(&mut self, cancel: &CancellationToken) -> DeviceResult<Option<Vec<u8>>> {
        self.link.ensure()?;
        self.link.key.wait_for_touch(cancel).await?;

        let mut state = self.link.lock().await?;
        if let Some(code) = state.fido.capture_errors.pop_front() {
            return Err(DeviceError::Capture(code));
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            return Ok(None);
        }
        Ok(Some(state.fido.add_template(None)))
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{Connection, Ctap2Session, DeviceBackend};
    use crate::fido::PinPermissions;
    use crate::memory::{MemoryBackend, SimulatedDevice, SimulatedFidoCredential};
    use crate::types::{ConnectionKind, FormFactor};
    use crate::DeviceError;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn session(spec: SimulatedDevice) -> (MemoryBackend, Arc<dyn Connection>, Arc<dyn Ctap2Session>) {
        let backend = MemoryBackend::from_devices(&[spec]).unwrap();
        let conn = backend.connect(None, ConnectionKind::Fido).await.unwrap();
        let ctap = conn.ctap2().await.unwrap();
        (backend, conn, ctap)
    }

    #[tokio::test]
    async fn test_pin_lifecycle() {
        let (_backend, _conn, ctap) = session(SimulatedDevice::default()).await;
        assert!(!ctap.get_info().await.unwrap().has_pin());
        assert!(ctap.set_pin("12").await.is_err());

        ctap.set_pin("123456").await.unwrap();
        assert!(ctap.get_info().await.unwrap().has_pin());

        let err = ctap
            .get_pin_token("000000", PinPermissions::GET_ASSERTION, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::PinInvalid { retries: 7 }));

        ctap.change_pin("123456", "654321").await.unwrap();
        ctap.get_pin_token("654321", PinPermissions::GET_ASSERTION, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_credential_management() {
        let (_backend, _conn, ctap) = session(SimulatedDevice {
            pin: Some("123456".to_string()),
            fido_credentials: vec![
                SimulatedFidoCredential {
                    rp_id: "example.com".to_string(),
                    user_name: "alice".to_string(),
                    display_name: None,
                },
                SimulatedFidoCredential {
                    rp_id: "example.com".to_string(),
                    user_name: "bob".to_string(),
                    display_name: None,
                },
            ],
            ..SimulatedDevice::default()
        })
        .await;

        let token = ctap
            .get_pin_token("123456", PinPermissions::GET_ASSERTION, None)
            .await
            .unwrap();
        assert!(ctap.credential_management(token).await.is_err());

        let token = ctap
            .get_pin_token("123456", PinPermissions::CREDENTIAL_MGMT, None)
            .await
            .unwrap();
        let credman = ctap.credential_management(token).await.unwrap();
        assert_eq!(credman.get_metadata().await.unwrap().existing_cred_count, 2);

        let rps = credman.enumerate_rps().await.unwrap();
        assert_eq!(rps.len(), 1);
        let creds = credman.enumerate_creds(&rps[0].rp_id_hash).await.unwrap();
        assert_eq!(creds.len(), 2);

        credman.delete_cred(&creds[0].credential_id).await.unwrap();
        assert_eq!(credman.get_metadata().await.unwrap().existing_cred_count, 1);
    }

    #[tokio::test]
    async fn test_enrollment_reports_capture_errors() {
        let (backend, _conn, ctap) = session(SimulatedDevice {
            form_factor: FormFactor::UsbABio,
            pin: Some("123456".to_string()),
            ..SimulatedDevice::default()
        })
        .await;
        backend.key(12345678).await.unwrap().queue_capture_errors([3]).await;

        let token = ctap
            .get_pin_token("123456", PinPermissions::BIO_ENROLL, None)
            .await
            .unwrap();
        let bio = ctap.bio_enrollment(token).await.unwrap();
        let mut enroller = bio.enroll().await.unwrap();
        let cancel = CancellationToken::new();

        assert!(matches!(
            enroller.capture(&cancel).await,
            Err(DeviceError::Capture(3))
        ));
        let mut template = None;
        while template.is_none() {
            template = enroller.capture(&cancel).await.unwrap();
        }
        let template = template.unwrap();
        assert_eq!(enroller.remaining(), Some(0));

        bio.set_name(&template, "thumb").await.unwrap();
        let enrollments = bio.enumerate_enrollments().await.unwrap();
        assert_eq!(enrollments.get(&template), Some(&Some("thumb".to_string())));
    }
}
