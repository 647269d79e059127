use super::{object, Ctap2Node, ManagementNode, OathNode, YubiOtpNode};
use async_trait::async_trait;
use device::{Capabilities, Connection, ConnectionKind, DeviceInfo, Transport, Version};
use protocol::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

const OTP_OVER_CCID: Version = Version(5, 3, 0);

/// An open connection to one interface of a key.
pub struct ConnectionNode {
    transport: Transport,
    connection: Arc<dyn Connection>,
    info: DeviceInfo,
}

impl ConnectionNode {
    pub async fn new(
        transport: Transport,
        connection: Arc<dyn Connection>,
        info: Option<DeviceInfo>,
    ) -> RpcResult<Self> {
        let info = match info {
            Some(info) => info,
            None => connection.read_info(None).await?,
        };
        Ok(Self {
            transport,
            connection,
            info,
        })
    }

    fn capabilities(&self) -> Capabilities {
        self.info.config.enabled(self.transport)
    }

    fn is_smart_card(&self) -> bool {
        self.connection.kind() == ConnectionKind::SmartCard
    }

    fn has_management(&self) -> bool {
        self.transport == Transport::Usb || self.is_smart_card()
    }

    fn has_oath(&self) -> bool {
        self.is_smart_card() && self.capabilities().contains(Capabilities::OATH)
    }

    fn has_ctap2(&self) -> bool {
        self.connection.kind() == ConnectionKind::Fido
            && self.capabilities().contains(Capabilities::FIDO2)
    }

    fn has_yubiotp(&self) -> bool {
        if !self.capabilities().contains(Capabilities::OTP) {
            return false;
        }
        match self.connection.kind() {
            ConnectionKind::Otp => true,
            ConnectionKind::SmartCard => {
                self.transport == Transport::Nfc || self.info.version >= OTP_OVER_CCID
            }
            ConnectionKind::Fido => false,
        }
    }
}

#[async_trait]
impl Node for ConnectionNode {
    async fn data(&mut self) -> RpcResult<Body> {
        if self.is_smart_card() || self.transport == Transport::Usb {
            self.info = self.connection.read_info(None).await?;
        }
        Ok(object(json!({
            "version": self.info.version,
            "serial": self.info.serial,
        })))
    }

    async fn children(&mut self) -> RpcResult<Children> {
        let mut children = Children::new();
        let available = [
            ("management", self.has_management()),
            ("oath", self.has_oath()),
            ("ctap2", self.has_ctap2()),
            ("yubiotp", self.has_yubiotp()),
        ];
        for (name, present) in available {
            if present {
                children.insert(name.to_string(), Value::Object(Body::new()));
            }
        }
        Ok(children)
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        match name {
            "management" if self.has_management() => {
                let session = self.connection.management().await?;
                Ok(Box::new(ManagementNode::new(session)))
            }
            "oath" if self.has_oath() => {
                let session = self.connection.oath().await?;
                Ok(Box::new(OathNode::new(session)))
            }
            "ctap2" if self.has_ctap2() => {
                let session = self.connection.ctap2().await?;
                Ok(Box::new(Ctap2Node::new(session)))
            }
            "yubiotp" if self.has_yubiotp() => {
                let session = self.connection.yubiotp().await?;
                Ok(Box::new(YubiOtpNode::new(session)))
            }
            other => Err(RpcError::NoSuchNode(other.to_string())),
        }
    }

    async fn close(&mut self) -> RpcResult<()> {
        debug!(kind = ?self.connection.kind(), "closing connection");
        self.connection.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::{DeviceBackend, MemoryBackend, SimulatedDevice};

    async fn open(version: &str, kind: ConnectionKind) -> ConnectionNode {
        let spec = SimulatedDevice {
            version: version.to_string(),
            ..SimulatedDevice::default()
        };
        let backend = MemoryBackend::from_devices(&[spec]).unwrap();
        let connection = backend.connect(None, kind).await.unwrap();
        ConnectionNode::new(Transport::Usb, connection, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_smart_card_children() {
        let mut node = open("5.4.3", ConnectionKind::SmartCard).await;
        let children = node.children().await.unwrap();
        assert!(children.contains_key("management"));
        assert!(children.contains_key("oath"));
        assert!(children.contains_key("yubiotp"));
        assert!(!children.contains_key("ctap2"));

        let data = node.data().await.unwrap();
        assert_eq!(data["serial"], 12345678);
        assert_eq!(data["version"], json!([5, 4, 3]));
    }

    #[tokio::test]
    async fn test_otp_over_ccid_needs_newer_firmware() {
        let mut ccid = open("5.2.7", ConnectionKind::SmartCard).await;
        assert!(!ccid.children().await.unwrap().contains_key("yubiotp"));

        let mut otp = open("5.2.7", ConnectionKind::Otp).await;
        let children = otp.children().await.unwrap();
        assert!(children.contains_key("yubiotp"));
        assert!(!children.contains_key("oath"));
    }

    #[tokio::test]
    async fn test_fido_children_and_close() {
        let mut node = open("5.4.3", ConnectionKind::Fido).await;
        let children = node.children().await.unwrap();
        assert!(children.contains_key("ctap2"));
        assert!(!children.contains_key("oath"));

        let mut ctap2 = node.create_child("ctap2").await.unwrap();
        assert!(ctap2.data().await.is_ok());
        assert!(node.create_child("oath").await.is_err());

        node.close().await.unwrap();
        assert!(ctap2.data().await.is_err());
    }
}
