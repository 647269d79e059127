//! The concrete node tree served over RPC.
//!
//! ```text
//! /
//!   usb/<id>/{ccid,otp,fido}/...
//!   nfc/<id>/{ccid,fido}/...
//! ```
//!
//! Below a connection sit the application nodes: `management`, `oath`,
//! `yubiotp` and `ctap2`.

mod connection;
mod devices;
mod fido;
mod management;
mod oath;
mod yubiotp;

pub use connection::ConnectionNode;
pub use devices::{DevicesNode, ReaderDeviceNode, ReadersNode, UsbDeviceNode};
pub use fido::Ctap2Node;
pub use management::ManagementNode;
pub use oath::OathNode;
pub use yubiotp::YubiOtpNode;

use crate::config::ServerConfig;
use crate::diagnostics;
use async_trait::async_trait;
use device::DeviceBackend;
use protocol::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Unwraps a JSON object literal into a response body.
pub(crate) fn object(value: Value) -> Body {
    match value {
        Value::Object(map) => map,
        _ => Body::new(),
    }
}

/// A random 8 hex digit id for nodes without a stable name.
pub(crate) fn random_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

pub struct RootNode {
    backend: Arc<dyn DeviceBackend>,
    devices: devices::UsbListing,
    readers: devices::ReaderListing,
    reader_exclude: String,
}

impl RootNode {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: &ServerConfig) -> Self {
        Self {
            backend,
            devices: devices::UsbListing::default(),
            readers: devices::ReaderListing::default(),
            reader_exclude: config.reader_exclude.to_lowercase(),
        }
    }
}

#[async_trait]
impl Node for RootNode {
    async fn data(&mut self) -> RpcResult<Body> {
        Ok(object(json!({ "version": VERSION })))
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![ActionSpec::new("diagnose")])
    }

    async fn children(&mut self) -> RpcResult<Children> {
        Ok(object(json!({ "usb": {}, "nfc": {} })))
    }

    async fn invoke(&mut self, action: &str, _params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "diagnose" => {
                let report = diagnostics::collect(self.backend.as_ref()).await;
                Ok(object(json!({ "diagnostics": report })))
            }
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        match name {
            "usb" => Ok(Box::new(DevicesNode::new(
                self.backend.clone(),
                self.devices.clone(),
            ))),
            "nfc" => Ok(Box::new(ReadersNode::new(
                self.backend.clone(),
                self.readers.clone(),
                self.reader_exclude.clone(),
            ))),
            other => Err(RpcError::NoSuchNode(other.to_string())),
        }
    }
}
