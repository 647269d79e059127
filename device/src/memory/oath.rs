use super::key::{KeyState, StoredCredential};
use super::Link;
use crate::backend::OathSession;
use crate::error::{DeviceError, DeviceResult};
use crate::oath::{
    format_credential_id, time_challenge, truncate, Code, Credential, CredentialData, OathType,
};
use crate::types::Version;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::MutexGuard;

const RENAME_VERSION: Version = Version(5, 3, 1);

pub(crate) struct MemoryOath {
    link: Arc<Link>,
    salt: RwLock<Vec<u8>>,
    unlocked: AtomicBool,
}

impl MemoryOath {
    pub async fn open(link: Arc<Link>) -> DeviceResult<Self> {
        let salt = link.lock().await?.oath.salt.clone();
        Ok(Self {
            link,
            salt: RwLock::new(salt),
            unlocked: AtomicBool::new(false),
        })
    }

    fn is_locked(&self, state: &KeyState) -> bool {
        state.oath.access_key.is_some() && !self.unlocked.load(Ordering::SeqCst)
    }

    /// Locks the key state, failing while the session needs a validated key.
    async fn unlocked_state(&self) -> DeviceResult<MutexGuard<'_, KeyState>> {
        let state = self.link.lock().await?;
        if self.is_locked(&state) {
            return Err(DeviceError::AuthRequired);
        }
        Ok(state)
    }

    fn credential(&self, id: &[u8], stored: &StoredCredential) -> Credential {
        Credential::from_id(
            &self.device_id(),
            id.to_vec(),
            stored.data.oath_type,
            Some(stored.touch),
        )
    }

    fn code_for(&self, credential: &Credential, stored: &mut StoredCredential, timestamp: u64) -> DeviceResult<Code> {
        let data = &mut stored.data;
        let challenge = match data.oath_type {
            OathType::Totp => time_challenge(timestamp, data.period),
            OathType::Hotp => {
                let counter = data.counter as u64;
                data.counter = data.counter.wrapping_add(1);
                counter.to_be_bytes()
            }
        };
        let response = data.hash_algorithm.hmac(&data.processed_secret(), &challenge)?;
        Ok(Code::new(credential, timestamp, truncate(&response)?, data.digits))
    }
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn not_found(id: &[u8]) -> DeviceError {
    DeviceError::NotFound(format!("credential {}", String::from_utf8_lossy(id)))
}

#[async_trait]
impl OathSession for MemoryOath {
    fn version(&self) -> Version {
        self.link.key.version()
    }

    fn salt(&self) -> Vec<u8> {
        self.salt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn has_key(&self) -> DeviceResult<bool> {
        Ok(self.link.lock().await?.oath.access_key.is_some())
    }

    async fn locked(&self) -> DeviceResult<bool> {
        let state = self.link.lock().await?;
        Ok(self.is_locked(&state))
    }

    async fn validate(&self, key: &[u8]) -> DeviceResult<()> {
        let state = self.link.lock().await?;
        match &state.oath.access_key {
            None => Err(DeviceError::Command("No access key is set".to_string())),
            Some(expected) if expected.as_slice() == key => {
                self.unlocked.store(true, Ordering::SeqCst);
                Ok(())
            }
            Some(_) => Err(DeviceError::WrongKey),
        }
    }

    async fn set_key(&self, key: &[u8]) -> DeviceResult<()> {
        if key.len() != 16 {
            return Err(DeviceError::InvalidData("access key must be 16 bytes".to_string()));
        }
        let mut state = self.unlocked_state().await?;
        state.oath.access_key = Some(key.to_vec());
        self.unlocked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unset_key(&self) -> DeviceResult<()> {
        let mut state = self.unlocked_state().await?;
        state.oath.access_key = None;
        Ok(())
    }

    async fn reset(&self) -> DeviceResult<()> {
        let mut state = self.link.lock().await?;
        let salt = rand::random::<[u8; 8]>().to_vec();
        state.oath.access_key = None;
        state.oath.credentials.clear();
        state.oath.salt = salt.clone();
        *self.salt.write().unwrap_or_else(PoisonError::into_inner) = salt;
        self.unlocked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_credentials(&self) -> DeviceResult<Vec<Credential>> {
        let state = self.unlocked_state().await?;
        Ok(state
            .oath
            .credentials
            .iter()
            .map(|(id, stored)| self.credential(id, stored))
            .collect())
    }

    async fn put_credential(&self, data: &CredentialData, require_touch: bool) -> DeviceResult<Credential> {
        data.validate()?;
        let mut state = self.unlocked_state().await?;
        let id = data.id();
        let stored = StoredCredential {
            data: data.clone(),
            touch: require_touch,
        };
        let credential = self.credential(&id, &stored);
        state.oath.credentials.insert(id, stored);
        Ok(credential)
    }

    async fn rename_credential(
        &self,
        credential_id: &[u8],
        name: &str,
        issuer: Option<&str>,
    ) -> DeviceResult<Vec<u8>> {
        if self.version() < RENAME_VERSION {
            return Err(DeviceError::NotSupported(format!(
                "renaming requires firmware {} or later",
                RENAME_VERSION
            )));
        }
        let mut state = self.unlocked_state().await?;
        let mut stored = state
            .oath
            .credentials
            .remove(credential_id)
            .ok_or_else(|| not_found(credential_id))?;

        let new_id = format_credential_id(issuer, name, stored.data.oath_type, stored.data.period);
        if state.oath.credentials.contains_key(&new_id) {
            state.oath.credentials.insert(credential_id.to_vec(), stored);
            return Err(DeviceError::InvalidData("Credential already exists".to_string()));
        }
        stored.data.name = name.to_string();
        stored.data.issuer = issuer.map(str::to_string);
        state.oath.credentials.insert(new_id.clone(), stored);
        Ok(new_id)
    }

    async fn delete_credential(&self, credential_id: &[u8]) -> DeviceResult<()> {
        let mut state = self.unlocked_state().await?;
        state
            .oath
            .credentials
            .remove(credential_id)
            .map(|_| ())
            .ok_or_else(|| not_found(credential_id))
    }

    async fn calculate(&self, credential_id: &[u8], challenge: &[u8]) -> DeviceResult<Vec<u8>> {
        let state = self.unlocked_state().await?;
        let stored = state
            .oath
            .credentials
            .get(credential_id)
            .ok_or_else(|| not_found(credential_id))?;
        stored
            .data
            .hash_algorithm
            .hmac(&stored.data.processed_secret(), challenge)
    }

    async fn calculate_code(&self, credential: &Credential, timestamp: Option<u64>) -> DeviceResult<Code> {
        let mut state = self.unlocked_state().await?;
        let stored = state
            .oath
            .credentials
            .get_mut(&credential.id)
            .ok_or_else(|| not_found(&credential.id))?;
        self.code_for(credential, stored, timestamp.unwrap_or_else(now))
    }

    async fn calculate_all(&self, timestamp: Option<u64>) -> DeviceResult<Vec<(Credential, Option<Code>)>> {
        let timestamp = timestamp.unwrap_or_else(now);
        let mut state = self.unlocked_state().await?;
        let mut entries = Vec::new();
        let ids: Vec<Vec<u8>> = state.oath.credentials.keys().cloned().collect();
        for id in ids {
            let Some(stored) = state.oath.credentials.get_mut(&id) else {
                continue;
            };
            let credential = self.credential(&id, stored);
            let code = if credential.oath_type == OathType::Totp && !stored.touch {
                Some(self.code_for(&credential, stored, timestamp)?)
            } else {
                None
            };
            entries.push((credential, code));
        }
        Ok(entries)
    }
}
