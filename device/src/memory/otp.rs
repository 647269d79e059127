use super::key::SlotConfig;
use super::Link;
use crate::backend::YubiOtpSession;
use crate::error::{DeviceError, DeviceResult};
use crate::oath::HashAlgorithm;
use crate::otp::{ConfigState, Slot};
use crate::types::Version;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MAX_HMAC_KEY_SIZE: usize = 20;
const MAX_CHALLENGE_SIZE: usize = 64;

pub(crate) struct MemoryOtp {
    link: Arc<Link>,
}

impl MemoryOtp {
    pub fn new(link: Arc<Link>) -> Self {
        Self { link }
    }
}

fn not_configured(slot: Slot) -> DeviceError {
    DeviceError::Command(format!("Slot {:?} is not configured", slot).to_lowercase())
}

#[async_trait]
impl YubiOtpSession for MemoryOtp {
    fn version(&self) -> Version {
        self.link.key.version()
    }

    async fn get_config_state(&self) -> DeviceResult<ConfigState> {
        let state = self.link.lock().await?;
        let slots = &state.otp.slots;
        Ok(ConfigState {
            configured: [slots[0].is_some(), slots[1].is_some()],
            touch_triggered: [
                slots[0].as_ref().is_some_and(|s| s.touch),
                slots[1].as_ref().is_some_and(|s| s.touch),
            ],
            led_inverted: state.otp.led_inverted,
        })
    }

    async fn swap_slots(&self) -> DeviceResult<()> {
        let mut state = self.link.lock().await?;
        if state.otp.slots.iter().flatten().any(|s| s.acc_code.is_some()) {
            return Err(DeviceError::Command("Slots are protected by an access code".to_string()));
        }
        state.otp.slots.swap(0, 1);
        Ok(())
    }

    async fn delete_slot(&self, slot: Slot, acc_code: Option<Vec<u8>>) -> DeviceResult<()> {
        let mut state = self.link.lock().await?;
        let entry = &mut state.otp.slots[slot.index()];
        let config = entry.as_ref().ok_or_else(|| not_configured(slot))?;
        if config.acc_code.is_some() && config.acc_code != acc_code {
            return Err(DeviceError::WrongKey);
        }
        *entry = None;
        Ok(())
    }

    async fn put_hmac_sha1(&self, slot: Slot, key: &[u8], require_touch: bool) -> DeviceResult<()> {
        if key.is_empty() || key.len() > MAX_HMAC_KEY_SIZE {
            return Err(DeviceError::InvalidData(format!(
                "HMAC-SHA1 key must be 1 to {} bytes",
                MAX_HMAC_KEY_SIZE
            )));
        }
        let mut state = self.link.lock().await?;
        let entry = &mut state.otp.slots[slot.index()];
        if entry.as_ref().is_some_and(|s| s.acc_code.is_some()) {
            return Err(DeviceError::WrongKey);
        }
        *entry = Some(SlotConfig {
            key: key.to_vec(),
            touch: require_touch,
            acc_code: None,
        });
        Ok(())
    }

    async fn calculate_hmac_sha1(
        &self,
        slot: Slot,
        challenge: &[u8],
        cancel: &CancellationToken,
    ) -> DeviceResult<Vec<u8>> {
        if challenge.len() > MAX_CHALLENGE_SIZE {
            return Err(DeviceError::InvalidData(format!(
                "challenge must be at most {} bytes",
                MAX_CHALLENGE_SIZE
            )));
        }
        let config = self.link.lock().await?.otp.slots[slot.index()]
            .clone()
            .ok_or_else(|| not_configured(slot))?;
        if config.touch {
            self.link.key.wait_for_touch(cancel).await?;
        }
        HashAlgorithm::Sha1.hmac(&config.key, challenge)
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{Connection, DeviceBackend, YubiOtpSession};
    use crate::memory::{MemoryBackend, SimulatedDevice};
    use crate::otp::Slot;
    use crate::types::ConnectionKind;
    use crate::DeviceError;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn session() -> (MemoryBackend, Arc<dyn Connection>, Arc<dyn YubiOtpSession>) {
        let backend = MemoryBackend::from_devices(&[SimulatedDevice::default()]).unwrap();
        let conn = backend.connect(None, ConnectionKind::Otp).await.unwrap();
        let otp = conn.yubiotp().await.unwrap();
        (backend, conn, otp)
    }

    #[tokio::test]
    async fn test_program_swap_and_delete() {
        let (_backend, _conn, otp) = session().await;
        otp.put_hmac_sha1(Slot::Two, b"secret", true).await.unwrap();

        let state = otp.get_config_state().await.unwrap();
        assert!(state.is_configured(Slot::Two));
        assert!(state.is_touch_triggered(Slot::Two));

        otp.swap_slots().await.unwrap();
        let state = otp.get_config_state().await.unwrap();
        assert!(state.is_configured(Slot::One));
        assert!(!state.is_configured(Slot::Two));

        otp.delete_slot(Slot::One, None).await.unwrap();
        assert!(otp.delete_slot(Slot::One, None).await.is_err());
    }

    #[tokio::test]
    async fn test_hmac_sha1_response() {
        let (_backend, _conn, otp) = session().await;
        // RFC 2202 test case 2.
        otp.put_hmac_sha1(Slot::One, b"Jefe", false).await.unwrap();
        let response = otp
            .calculate_hmac_sha1(Slot::One, b"what do ya want for nothing?", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hex::encode(response), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[tokio::test]
    async fn test_touch_waits_for_cancel() {
        let (backend, _conn, otp) = session().await;
        otp.put_hmac_sha1(Slot::One, b"key", true).await.unwrap();
        backend.key(12345678).await.unwrap().set_touch_blocked(true);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = otp.calculate_hmac_sha1(Slot::One, b"abc", &cancel).await.unwrap_err();
        assert!(matches!(err, DeviceError::Cancelled));
    }
}
