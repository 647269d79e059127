use super::{object, random_id, ConnectionNode};
use async_trait::async_trait;
use device::{
    product_name, ConnectionKind, DeviceBackend, DeviceInfo, Transport, UsbInterfaces, YubiKeyDevice,
};
use protocol::prelude::*;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const USB_CONNECTIONS: [(&str, ConnectionKind); 3] = [
    ("ccid", ConnectionKind::SmartCard),
    ("otp", ConnectionKind::Otp),
    ("fido", ConnectionKind::Fido),
];

#[derive(Default)]
struct UsbListingState {
    state: u64,
    devices: Children,
    mapping: HashMap<String, (Arc<dyn YubiKeyDevice>, DeviceInfo)>,
}

/// USB device ids, kept across reopening the `usb` node.
#[derive(Clone, Default)]
pub(crate) struct UsbListing(Arc<Mutex<UsbListingState>>);

#[derive(Default)]
struct ReaderListingState {
    names: BTreeSet<String>,
    readers: Children,
    mapping: HashMap<String, Arc<dyn YubiKeyDevice>>,
}

/// NFC reader ids, kept across reopening the `nfc` node.
#[derive(Clone, Default)]
pub(crate) struct ReaderListing(Arc<Mutex<ReaderListingState>>);

pub struct DevicesNode {
    backend: Arc<dyn DeviceBackend>,
    listing: UsbListing,
    /// Scan state cached for the duration of one call.
    cached_state: u64,
    caching: bool,
}

impl DevicesNode {
    pub(crate) fn new(backend: Arc<dyn DeviceBackend>, listing: UsbListing) -> Self {
        Self {
            backend,
            listing,
            cached_state: 0,
            caching: false,
        }
    }

    async fn scan_state(&mut self) -> RpcResult<u64> {
        if !self.caching || self.cached_state == 0 {
            self.cached_state = self.backend.scan_usb().await?.state;
        }
        Ok(self.cached_state)
    }

    async fn refresh(&mut self) -> RpcResult<Children> {
        let state = self.scan_state().await?;
        let mut listing = self.listing.0.lock().await;
        if state != listing.state {
            debug!(state, "USB devices changed");
            listing.devices.clear();
            listing.mapping.clear();
            for (device, info) in self.backend.list_usb().await? {
                let mut dev_id = match info.serial {
                    Some(serial) => serial.to_string(),
                    None => random_id(),
                };
                while listing.mapping.contains_key(&dev_id) {
                    dev_id = random_id();
                }
                let pid = device.pid();
                let name = product_name(&info, pid.map(|p| p.key_type));
                listing.devices.insert(
                    dev_id.clone(),
                    json!({ "pid": pid, "name": name, "serial": info.serial }),
                );
                listing.mapping.insert(dev_id, (device, info));
            }
            listing.state = state;
        }
        Ok(listing.devices.clone())
    }
}

#[async_trait]
impl Node for DevicesNode {
    async fn data(&mut self) -> RpcResult<Body> {
        Ok(object(json!({ "state": self.scan_state().await? })))
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![ActionSpec::keep_child("scan")])
    }

    async fn children(&mut self) -> RpcResult<Children> {
        self.refresh().await
    }

    async fn invoke(&mut self, action: &str, _params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "scan" => Ok(object(json!({ "state": self.scan_state().await? }))),
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        self.refresh().await?;
        let listing = self.listing.0.lock().await;
        let (device, info) = listing
            .mapping
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::NoSuchNode(name.to_string()))?;
        Ok(Box::new(UsbDeviceNode::new(self.backend.clone(), device, info)))
    }

    fn enter(&mut self) {
        self.caching = true;
        self.cached_state = 0;
    }

    fn exit(&mut self) {
        self.caching = false;
    }
}

pub struct ReadersNode {
    backend: Arc<dyn DeviceBackend>,
    listing: ReaderListing,
    exclude: String,
}

impl ReadersNode {
    pub(crate) fn new(backend: Arc<dyn DeviceBackend>, listing: ReaderListing, exclude: String) -> Self {
        Self {
            backend,
            listing,
            exclude,
        }
    }

    fn is_excluded(&self, name: &str) -> bool {
        !self.exclude.is_empty() && name.to_lowercase().contains(&self.exclude)
    }

    async fn refresh(&mut self) -> RpcResult<Children> {
        let devices: Vec<(String, Arc<dyn YubiKeyDevice>)> = self
            .backend
            .list_readers()
            .await?
            .into_iter()
            .filter_map(|device| device.reader_name().map(|name| (name, device)))
            .filter(|(name, _)| !self.is_excluded(name))
            .collect();
        let names: BTreeSet<String> = devices.iter().map(|(name, _)| name.clone()).collect();

        let mut listing = self.listing.0.lock().await;
        if listing.names != names {
            debug!(readers = names.len(), "NFC readers changed");
            listing.readers.clear();
            listing.mapping.clear();
            for (name, device) in devices {
                let mut dev_id = random_id();
                while listing.mapping.contains_key(&dev_id) {
                    dev_id = random_id();
                }
                listing.readers.insert(dev_id.clone(), json!({ "name": name }));
                listing.mapping.insert(dev_id, device);
            }
            listing.names = names;
        }
        Ok(listing.readers.clone())
    }
}

#[async_trait]
impl Node for ReadersNode {
    async fn children(&mut self) -> RpcResult<Children> {
        self.refresh().await
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let device = {
            let listing = self.listing.0.lock().await;
            listing.mapping.get(name).cloned()
        };
        let device = match device {
            Some(device) => device,
            None => {
                self.refresh().await?;
                self.listing
                    .0
                    .lock()
                    .await
                    .mapping
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RpcError::NoSuchNode(name.to_string()))?
            }
        };
        Ok(Box::new(ReaderDeviceNode::new(device)))
    }
}

/// Reads device info over the first connection kind the device supports.
async fn read_device_data(device: &dyn YubiKeyDevice) -> RpcResult<(Body, DeviceInfo)> {
    for kind in ConnectionKind::CONNECT_ORDER {
        if !device.supports_connection(kind) {
            continue;
        }
        let connection = device.open_connection(kind).await?;
        let pid = device.pid();
        let result = connection.read_info(pid).await;
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Error closing connection");
        }
        let info = result?;
        let name = product_name(&info, pid.map(|p| p.key_type));
        let body = object(json!({
            "pid": pid,
            "name": name,
            "transport": device.transport(),
            "info": info,
        }));
        return Ok((body, info));
    }
    Err(RpcError::Exception("No supported connections".to_string()))
}

pub struct UsbDeviceNode {
    backend: Arc<dyn DeviceBackend>,
    device: Arc<dyn YubiKeyDevice>,
    info: DeviceInfo,
    interfaces: UsbInterfaces,
}

impl UsbDeviceNode {
    pub fn new(backend: Arc<dyn DeviceBackend>, device: Arc<dyn YubiKeyDevice>, info: DeviceInfo) -> Self {
        let interfaces = device.pid().map(|pid| pid.interfaces).unwrap_or_default();
        Self {
            backend,
            device,
            info,
            interfaces,
        }
    }

    async fn create_connection(&mut self, kind: ConnectionKind) -> RpcResult<Box<dyn Node>> {
        let connection = if self.device.supports_connection(kind) {
            self.device.open_connection(kind).await?
        } else if let Some(serial) = self.info.serial {
            self.backend.connect(Some(serial), kind).await?
        } else {
            let scan = self.backend.scan_usb().await?;
            if scan.count_supporting(kind) != 1 {
                return Err(RpcError::Exception("Unable to uniquely identify device".to_string()));
            }
            self.backend.connect(None, kind).await?
        };
        let node = ConnectionNode::new(Transport::Usb, connection, Some(self.info.clone())).await?;
        Ok(Box::new(node))
    }
}

#[async_trait]
impl Node for UsbDeviceNode {
    async fn data(&mut self) -> RpcResult<Body> {
        let (body, info) = read_device_data(self.device.as_ref()).await?;
        self.info = info;
        Ok(body)
    }

    async fn children(&mut self) -> RpcResult<Children> {
        let mut children = Children::new();
        for (name, kind) in USB_CONNECTIONS {
            if self.interfaces.supports_connection(kind) {
                children.insert(name.to_string(), Value::Object(Body::new()));
            }
        }
        Ok(children)
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        match USB_CONNECTIONS.iter().find(|(n, _)| *n == name) {
            Some((_, kind)) if self.interfaces.supports_connection(*kind) => {
                self.create_connection(*kind).await
            }
            _ => Err(RpcError::NoSuchNode(name.to_string())),
        }
    }

    fn device_boundary(&self) -> bool {
        true
    }
}

pub struct ReaderDeviceNode {
    device: Arc<dyn YubiKeyDevice>,
}

impl ReaderDeviceNode {
    pub fn new(device: Arc<dyn YubiKeyDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl Node for ReaderDeviceNode {
    async fn data(&mut self) -> RpcResult<Body> {
        match read_device_data(self.device.as_ref()).await {
            Ok((mut body, _)) => {
                body.insert("present".to_string(), Value::Bool(true));
                Ok(body)
            }
            Err(e) => {
                debug!(error = %e, "no key on reader");
                Ok(object(json!({ "present": false })))
            }
        }
    }

    async fn children(&mut self) -> RpcResult<Children> {
        Ok(object(json!({ "ccid": {}, "fido": {} })))
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let transport = self.device.transport();
        match name {
            "ccid" => {
                let connection = self.device.open_connection(ConnectionKind::SmartCard).await?;
                let info = connection.read_info(None).await?;
                Ok(Box::new(ConnectionNode::new(transport, connection, Some(info)).await?))
            }
            "fido" => {
                let smart_card = self.device.open_connection(ConnectionKind::SmartCard).await?;
                let info = smart_card.read_info(None).await;
                smart_card.close().await?;
                let info = info?;
                let connection = self.device.open_connection(ConnectionKind::Fido).await?;
                Ok(Box::new(ConnectionNode::new(transport, connection, Some(info)).await?))
            }
            other => Err(RpcError::NoSuchNode(other.to_string())),
        }
    }

    fn device_boundary(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::{MemoryBackend, SimulatedDevice};

    fn usb_key(serial: Option<u32>, interfaces: &str) -> SimulatedDevice {
        SimulatedDevice {
            serial,
            interfaces: interfaces.to_string(),
            ..SimulatedDevice::default()
        }
    }

    fn nfc_key(reader: &str) -> SimulatedDevice {
        SimulatedDevice {
            serial: Some(99),
            reader: Some(reader.to_string()),
            ..SimulatedDevice::default()
        }
    }

    #[tokio::test]
    async fn test_usb_listing_follows_scan_state() {
        let backend = Arc::new(MemoryBackend::from_devices(&[usb_key(Some(1), "OTP+FIDO+CCID")]).unwrap());
        let mut node = DevicesNode::new(backend.clone(), UsbListing::default());

        let state = node.data().await.unwrap()["state"].clone();
        let scanned = node.invoke("scan", Params::new(), &CallContext::detached()).await.unwrap();
        assert_eq!(scanned["state"], state);

        let children = node.children().await.unwrap();
        assert_eq!(children["1"]["serial"], 1);
        assert_eq!(children["1"]["name"], "YubiKey 5 NFC");

        backend.attach(&usb_key(None, "FIDO")).await.unwrap();
        assert_ne!(node.data().await.unwrap()["state"], state);
        let children = node.children().await.unwrap();
        assert_eq!(children.len(), 2);
        let anonymous = children.keys().find(|id| id.as_str() != "1").unwrap();
        assert_eq!(anonymous.len(), 8);
        assert_eq!(children[anonymous]["serial"], Value::Null);
    }

    #[tokio::test]
    async fn test_listing_survives_reopening() {
        let backend = Arc::new(MemoryBackend::from_devices(&[usb_key(None, "OTP+FIDO+CCID")]).unwrap());
        let listing = UsbListing::default();

        let first = DevicesNode::new(backend.clone(), listing.clone())
            .children()
            .await
            .unwrap();
        let second = DevicesNode::new(backend, listing).children().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_usb_device_children_follow_interfaces() {
        let backend = Arc::new(MemoryBackend::from_devices(&[usb_key(Some(7), "OTP+CCID")]).unwrap());
        let mut devices = DevicesNode::new(backend, UsbListing::default());
        let mut device = devices.create_child("7").await.unwrap();

        let children = device.children().await.unwrap();
        assert_eq!(children.keys().collect::<Vec<_>>(), ["ccid", "otp"]);
        assert!(device.create_child("fido").await.is_err());

        let data = device.data().await.unwrap();
        assert_eq!(data["info"]["serial"], 7);
        assert!(devices.create_child("8").await.is_err());
    }

    #[tokio::test]
    async fn test_readers_hide_excluded_names() {
        let backend = Arc::new(
            MemoryBackend::from_devices(&[usb_key(Some(1), "OTP+FIDO+CCID"), nfc_key("ACS ACR122U")])
                .unwrap(),
        );
        backend.add_reader("Empty Reader").await;
        let mut node = ReadersNode::new(
            backend.clone(),
            ReaderListing::default(),
            "yubico yubikey".to_string(),
        );

        let children = node.children().await.unwrap();
        let mut names: Vec<&str> = children
            .values()
            .filter_map(|info| info["name"].as_str())
            .collect();
        names.sort();
        assert_eq!(names, ["ACS ACR122U", "Empty Reader"]);

        let mut unfiltered = ReadersNode::new(backend, ReaderListing::default(), String::new());
        assert_eq!(unfiltered.children().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reader_device_presence() {
        let backend = Arc::new(MemoryBackend::from_devices(&[nfc_key("ACS ACR122U")]).unwrap());
        backend.add_reader("Empty Reader").await;
        let mut node = ReadersNode::new(backend, ReaderListing::default(), String::new());

        let children = node.children().await.unwrap();
        for (id, info) in children {
            let mut reader = node.create_child(&id).await.unwrap();
            let data = reader.data().await.unwrap();
            if info["name"] == "ACS ACR122U" {
                assert_eq!(data["present"], true);
                assert_eq!(data["info"]["serial"], 99);
                assert!(reader.create_child("ccid").await.is_ok());
            } else {
                assert_eq!(data, object(json!({ "present": false })));
            }
        }
    }
}
