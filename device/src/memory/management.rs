use super::Link;
use crate::backend::ManagementSession;
use crate::error::{DeviceError, DeviceResult};
use crate::types::{ConnectionKind, DeviceConfig, DeviceInfo, UsbInterfaces, Version};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

const LOCK_CODE_LENGTH: usize = 16;

pub(crate) struct MemoryManagement {
    link: Arc<Link>,
    kind: ConnectionKind,
}

impl MemoryManagement {
    pub fn new(link: Arc<Link>, kind: ConnectionKind) -> Self {
        Self { link, kind }
    }
}

#[async_trait]
impl ManagementSession for MemoryManagement {
    fn version(&self) -> Version {
        self.link.key.version()
    }

    async fn read_device_info(&self) -> DeviceResult<DeviceInfo> {
        let state = self.link.lock().await?;
        Ok(self.link.key.device_info(&state))
    }

    async fn write_device_config(
        &self,
        config: DeviceConfig,
        reboot: bool,
        cur_lock_code: Option<Vec<u8>>,
        new_lock_code: Option<Vec<u8>>,
    ) -> DeviceResult<()> {
        if self.version() < Version(5, 0, 0) {
            return Err(DeviceError::NotSupported("requires firmware 5.0.0 or later".to_string()));
        }
        for code in [&cur_lock_code, &new_lock_code].into_iter().flatten() {
            if code.len() != LOCK_CODE_LENGTH {
                return Err(DeviceError::InvalidData(format!(
                    "lock code must be {} bytes",
                    LOCK_CODE_LENGTH
                )));
            }
        }

        {
            let mut state = self.link.lock().await?;
            if let Some(lock_code) = &state.lock_code {
                if cur_lock_code.as_ref() != Some(lock_code) {
                    return Err(DeviceError::Command("Configuration is locked".to_string()));
                }
            }

            for (transport, capabilities) in config.enabled_capabilities {
                state.config.enabled_capabilities.insert(transport, capabilities);
            }
            if config.auto_eject_timeout.is_some() {
                state.config.auto_eject_timeout = config.auto_eject_timeout;
            }
            if config.challenge_response_timeout.is_some() {
                state.config.challenge_response_timeout = config.challenge_response_timeout;
            }
            if config.device_flags.is_some() {
                state.config.device_flags = config.device_flags;
            }
            if let Some(code) = new_lock_code {
                // An all-zero code clears the lock.
                state.lock_code = code.iter().any(|b| *b != 0).then_some(code);
            }
        }

        if reboot {
            self.link.key.reboot();
        }
        Ok(())
    }

    async fn set_mode(
        &self,
        mode: UsbInterfaces,
        challenge_response_timeout: u8,
        auto_eject_timeout: u16,
    ) -> DeviceResult<()> {
        self.link.ensure()?;
        if mode.0 == 0 || !UsbInterfaces::ALL.contains(mode) {
            return Err(DeviceError::InvalidData(format!("invalid mode: {}", mode.0)));
        }
        if self.kind == ConnectionKind::Fido && self.version() < Version(4, 0, 0) {
            return Err(DeviceError::NotSupported("mode switch over FIDO".to_string()));
        }
        info!(
            %mode,
            challenge_response_timeout,
            auto_eject_timeout,
            "mode change takes effect after re-insertion"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::DeviceBackend;
    use crate::memory::{MemoryBackend, SimulatedDevice};
    use crate::types::{Capabilities, ConnectionKind, DeviceConfig, Transport, UsbInterfaces};
    use crate::DeviceError;

    #[tokio::test]
    async fn test_configure_updates_info_and_reboot_drops_connection() {
        let backend = MemoryBackend::from_devices(&[SimulatedDevice::default()]).unwrap();
        let conn = backend.connect(None, ConnectionKind::SmartCard).await.unwrap();
        let mgmt = conn.management().await.unwrap();

        let mut config = DeviceConfig::default();
        config
            .enabled_capabilities
            .insert(Transport::Nfc, Capabilities::OATH);
        config.auto_eject_timeout = Some(30);
        mgmt.write_device_config(config, false, None, None).await.unwrap();

        let info = mgmt.read_device_info().await.unwrap();
        assert_eq!(info.config.enabled(Transport::Nfc), Capabilities::OATH);
        assert_eq!(info.config.enabled(Transport::Usb), Capabilities::ALL);
        assert_eq!(info.config.auto_eject_timeout, Some(30));

        mgmt.write_device_config(DeviceConfig::default(), true, None, None)
            .await
            .unwrap();
        assert!(matches!(
            mgmt.read_device_info().await,
            Err(DeviceError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_code_guards_config() {
        let backend = MemoryBackend::from_devices(&[SimulatedDevice::default()]).unwrap();
        let conn = backend.connect(None, ConnectionKind::SmartCard).await.unwrap();
        let mgmt = conn.management().await.unwrap();
        let code = vec![0x11; 16];

        mgmt.write_device_config(DeviceConfig::default(), false, None, Some(code.clone()))
            .await
            .unwrap();
        assert!(mgmt.read_device_info().await.unwrap().is_locked);

        let err = mgmt
            .write_device_config(DeviceConfig::default(), false, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Command(_)));

        mgmt.write_device_config(DeviceConfig::default(), false, Some(code), Some(vec![0; 16]))
            .await
            .unwrap();
        assert!(!mgmt.read_device_info().await.unwrap().is_locked);
    }

    #[tokio::test]
    async fn test_set_mode_rejects_empty_mode() {
        let backend = MemoryBackend::from_devices(&[SimulatedDevice {
            version: "4.3.7".to_string(),
            ..SimulatedDevice::default()
        }])
        .unwrap();
        let conn = backend.connect(None, ConnectionKind::Otp).await.unwrap();
        let mgmt = conn.management().await.unwrap();

        assert!(mgmt.set_mode(UsbInterfaces(0), 0, 0).await.is_err());
        mgmt.set_mode(UsbInterfaces::ALL, 0, 0).await.unwrap();
        assert!(mgmt
            .write_device_config(DeviceConfig::default(), false, None, None)
            .await
            .is_err());
    }
}
