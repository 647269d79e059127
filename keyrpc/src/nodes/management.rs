use async_trait::async_trait;
use device::{Capabilities, DeviceConfig, ManagementSession, Transport, UsbInterfaces, Version};
use protocol::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const CONFIGURE_VERSION: Version = Version(5, 0, 0);

pub struct ManagementNode {
    session: Arc<dyn ManagementSession>,
}

impl ManagementNode {
    pub fn new(session: Arc<dyn ManagementSession>) -> Self {
        Self { session }
    }

    fn supports_configure(&self) -> bool {
        self.session.version() >= CONFIGURE_VERSION
    }

    async fn configure(&self, mut params: Params) -> RpcResult<Body> {
        let reboot = params.optional_bool("reboot")?.unwrap_or(false);
        let cur_lock_code = params.optional_hex("cur_lock_code")?;
        let new_lock_code = params.optional_hex("new_lock_code")?;
        let config = DeviceConfig {
            enabled_capabilities: params
                .optional_as::<BTreeMap<Transport, Capabilities>>("enabled_capabilities")?
                .unwrap_or_default(),
            auto_eject_timeout: params.optional_as("auto_eject_timeout")?,
            challenge_response_timeout: params.optional_as("challenge_response_timeout")?,
            device_flags: params.optional_as("device_flags")?,
        };

        self.session
            .write_device_config(config, reboot, cur_lock_code, new_lock_code)
            .await?;

        if reboot {
            info!("device configured, rebooting");
            return Err(RpcError::ChildReset("Device rebooted".to_string()));
        }
        Ok(Body::new())
    }

    async fn set_mode(&self, mut params: Params) -> RpcResult<Body> {
        let mode = match params.take_value("mode") {
            Some(Value::String(s)) => s
                .parse::<UsbInterfaces>()
                .map_err(|e| RpcError::invalid_params(e.to_string()))?,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .map(UsbInterfaces)
                .ok_or_else(|| RpcError::invalid_params("parameter 'mode' is out of range"))?,
            _ => return Err(RpcError::invalid_params("missing parameter 'mode'")),
        };
        let challenge_response_timeout = params
            .optional_as::<u8>("challenge_response_timeout")?
            .unwrap_or(0);
        let auto_eject_timeout = params.optional_as::<u16>("auto_eject_timeout")?.unwrap_or(0);

        self.session
            .set_mode(mode, challenge_response_timeout, auto_eject_timeout)
            .await?;
        Ok(Body::new())
    }
}

#[async_trait]
impl Node for ManagementNode {
    async fn data(&mut self) -> RpcResult<Body> {
        let info = self.session.read_device_info().await?;
        to_body(&info)
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        if self.supports_configure() {
            Ok(vec![ActionSpec::new("configure")])
        } else {
            Ok(vec![ActionSpec::new("set_mode")])
        }
    }

    async fn invoke(&mut self, action: &str, params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "configure" if self.supports_configure() => self.configure(params).await,
            "set_mode" if !self.supports_configure() => self.set_mode(params).await,
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }
}
