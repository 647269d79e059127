use super::object;
use async_trait::async_trait;
use device::otp::{ConfigState, Slot};
use device::{Version, YubiOtpSession};
use protocol::prelude::*;
use serde_json::json;
use std::sync::Arc;

const TOUCH_STATE_VERSION: Version = Version(3, 0, 0);

pub struct YubiOtpNode {
    session: Arc<dyn YubiOtpSession>,
}

impl YubiOtpNode {
    pub fn new(session: Arc<dyn YubiOtpSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Node for YubiOtpNode {
    async fn data(&mut self) -> RpcResult<Body> {
        let state = self.session.get_config_state().await?;
        let mut data = object(json!({
            "is_led_inverted": state.is_led_inverted(),
            "slot1_configured": state.is_configured(Slot::One),
            "slot2_configured": state.is_configured(Slot::Two),
        }));
        if self.session.version() >= TOUCH_STATE_VERSION {
            data.extend(object(json!({
                "slot1_touch_triggered": state.is_touch_triggered(Slot::One),
                "slot2_touch_triggered": state.is_touch_triggered(Slot::Two),
            })));
        }
        Ok(data)
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![ActionSpec::new("swap")])
    }

    async fn children(&mut self) -> RpcResult<Children> {
        Ok(object(json!({ "one": {}, "two": {} })))
    }

    async fn invoke(&mut self, action: &str, _params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "swap" => {
                self.session.swap_slots().await?;
                Ok(Body::new())
            }
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let slot = match name {
            "one" => Slot::One,
            "two" => Slot::Two,
            other => return Err(RpcError::NoSuchNode(other.to_string())),
        };
        Ok(Box::new(SlotNode::new(self.session.clone(), slot).await?))
    }
}

pub struct SlotNode {
    session: Arc<dyn YubiOtpSession>,
    slot: Slot,
    state: ConfigState,
}

impl SlotNode {
    pub async fn new(session: Arc<dyn YubiOtpSession>, slot: Slot) -> RpcResult<Self> {
        let state = session.get_config_state().await?;
        Ok(Self {
            session,
            slot,
            state,
        })
    }

    async fn refresh(&mut self) -> RpcResult<()> {
        self.state = self.session.get_config_state().await?;
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.state.is_configured(self.slot)
    }

    fn can_calculate(&self) -> bool {
        self.is_configured() && !self.state.is_touch_triggered(self.slot)
    }
}

#[async_trait]
impl Node for SlotNode {
    async fn data(&mut self) -> RpcResult<Body> {
        self.refresh().await?;
        let mut data = object(json!({ "is_configured": self.is_configured() }));
        if self.session.version() >= TOUCH_STATE_VERSION {
            data.insert(
                "is_touch_triggered".to_string(),
                self.state.is_touch_triggered(self.slot).into(),
            );
        }
        Ok(data)
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        let mut actions = vec![ActionSpec::new("put_hmac_sha1")];
        if self.is_configured() {
            actions.push(ActionSpec::new("delete"));
        }
        if self.can_calculate() {
            actions.push(ActionSpec::new("calculate"));
        }
        Ok(actions)
    }

    async fn invoke(&mut self, action: &str, mut params: Params, ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "delete" => {
                let acc_code = params.optional_hex("acc_code")?;
                self.session.delete_slot(self.slot, acc_code).await?;
                self.refresh().await?;
                Ok(Body::new())
            }
            "calculate" => {
                let challenge = params.required_hex("challenge")?;
                let response = self
                    .session
                    .calculate_hmac_sha1(self.slot, &challenge, &ctx.cancel)
                    .await?;
                Ok(object(json!({ "response": hex::encode(response) })))
            }
            "put_hmac_sha1" => {
                let key = params.required_hex("key")?;
                let require_touch = params.optional_bool("require_touch")?.unwrap_or(false);
                self.session.put_hmac_sha1(self.slot, &key, require_touch).await?;
                self.refresh().await?;
                Ok(Body::new())
            }
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::{ConnectionKind, DeviceBackend, MemoryBackend, SimulatedDevice};
    use serde_json::Value;

    async fn otp_node(version: &str) -> YubiOtpNode {
        let spec = SimulatedDevice {
            version: version.to_string(),
            ..SimulatedDevice::default()
        };
        let backend = MemoryBackend::from_devices(&[spec]).unwrap();
        let conn = backend.connect(None, ConnectionKind::Otp).await.unwrap();
        YubiOtpNode::new(conn.yubiotp().await.unwrap())
    }

    fn names(actions: Vec<ActionSpec>) -> Vec<&'static str> {
        actions.into_iter().map(|a| a.name).collect()
    }

    #[tokio::test]
    async fn test_slot_actions_follow_configuration() {
        let mut otp = otp_node("5.4.3").await;
        let ctx = CallContext::detached();
        let mut slot = otp.create_child("one").await.unwrap();
        assert_eq!(names(slot.actions().await.unwrap()), vec!["put_hmac_sha1"]);

        let mut params = Params::new();
        params.insert("key".to_string(), Value::from(hex::encode(b"Jefe")));
        slot.invoke("put_hmac_sha1", params, &ctx).await.unwrap();
        assert_eq!(
            names(slot.actions().await.unwrap()),
            vec!["put_hmac_sha1", "delete", "calculate"]
        );

        let mut params = Params::new();
        params.insert(
            "challenge".to_string(),
            Value::from(hex::encode(b"what do ya want for nothing?")),
        );
        let body = slot.invoke("calculate", params, &ctx).await.unwrap();
        assert_eq!(body["response"], "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");

        let data = otp.data().await.unwrap();
        assert_eq!(data["slot1_configured"], true);
        assert_eq!(data["slot1_touch_triggered"], false);

        slot.invoke("delete", Params::new(), &ctx).await.unwrap();
        assert_eq!(names(slot.actions().await.unwrap()), vec!["put_hmac_sha1"]);
    }

    #[tokio::test]
    async fn test_touch_slot_hides_calculate() {
        let otp = otp_node("5.4.3").await;
        let mut slot = SlotNode::new(otp.session.clone(), Slot::Two).await.unwrap();
        let mut params = Params::new();
        params.insert("key".to_string(), Value::from("00112233"));
        params.insert("require_touch".to_string(), Value::Bool(true));
        slot.invoke("put_hmac_sha1", params, &CallContext::detached())
            .await
            .unwrap();

        assert_eq!(
            names(slot.actions().await.unwrap()),
            vec!["put_hmac_sha1", "delete"]
        );
        assert_eq!(slot.data().await.unwrap()["is_touch_triggered"], true);
    }

    #[tokio::test]
    async fn test_old_firmware_omits_touch_state() {
        let mut otp = otp_node("2.2.0").await;
        let data = otp.data().await.unwrap();
        assert!(data.contains_key("slot1_configured"));
        assert!(!data.contains_key("slot1_touch_triggered"));
    }
}
