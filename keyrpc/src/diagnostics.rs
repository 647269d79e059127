//! Environment report for the `diagnose` action and subcommand.
//!
//! Collection never fails: every error is recorded in place of the value
//! it prevented.

use crate::nodes::VERSION;
use device::{product_name, ConnectionKind, DeviceBackend, YubiKeyDevice};
use serde_json::{json, Value};
use tracing::debug;

fn error_value(e: impl std::fmt::Display) -> Value {
    json!({ "error": e.to_string() })
}

async fn usb_section(backend: &dyn DeviceBackend) -> Value {
    match backend.scan_usb().await {
        Ok(scan) => {
            let pids: Vec<Value> = scan
                .pids
                .iter()
                .map(|(pid, count)| json!({ "pid": pid, "count": count }))
                .collect();
            json!({ "state": scan.state, "pids": pids })
        }
        Err(e) => error_value(e),
    }
}

async fn devices_section(backend: &dyn DeviceBackend) -> Value {
    match backend.list_usb().await {
        Ok(devices) => devices
            .iter()
            .map(|(device, info)| {
                let pid = device.pid();
                json!({
                    "name": product_name(info, pid.map(|p| p.key_type)),
                    "pid": pid,
                    "info": info,
                })
            })
            .collect(),
        Err(e) => error_value(e),
    }
}

/// Device info read over the reader's smart card interface.
async fn reader_info(reader: &dyn YubiKeyDevice) -> Value {
    let connection = match reader.open_connection(ConnectionKind::SmartCard).await {
        Ok(connection) => connection,
        Err(e) => return error_value(e),
    };
    let info = connection.read_info(None).await;
    if let Err(e) = connection.close().await {
        debug!(error = %e, "Error closing connection");
    }
    match info {
        Ok(info) => json!(info),
        Err(e) => error_value(e),
    }
}

async fn readers_section(backend: &dyn DeviceBackend) -> Value {
    let readers = match backend.list_readers().await {
        Ok(readers) => readers,
        Err(e) => return error_value(e),
    };

    let mut entries = Vec::with_capacity(readers.len());
    for reader in &readers {
        entries.push(json!({
            "name": reader.reader_name(),
            "transport": reader.transport(),
            "info": reader_info(reader.as_ref()).await,
        }));
    }
    Value::Array(entries)
}

pub async fn collect(backend: &dyn DeviceBackend) -> Value {
    debug!(backend = backend.name(), "collecting diagnostics");
    json!({
        "version": VERSION,
        "backend": backend.name(),
        "platform": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "usb": usb_section(backend).await,
        "devices": devices_section(backend).await,
        "readers": readers_section(backend).await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use device::{
        Connection, DeviceError, DeviceInfo, DeviceResult, MemoryBackend, SimulatedDevice, UsbScan,
    };
    use std::sync::Arc;

    const READER: &str = "ACS ACR122U";

    fn nfc_key() -> SimulatedDevice {
        SimulatedDevice {
            serial: Some(99),
            reader: Some(READER.to_string()),
            ..SimulatedDevice::default()
        }
    }

    /// Wraps a memory backend, optionally pulling a key off its reader right
    /// after the readers are listed, or failing the USB listing.
    struct UnstableBackend {
        inner: MemoryBackend,
        detach_after_listing: Option<u32>,
        fail_usb: bool,
    }

    #[async_trait]
    impl DeviceBackend for UnstableBackend {
        fn name(&self) -> &str {
            "unstable"
        }

        async fn scan_usb(&self) -> DeviceResult<UsbScan> {
            self.inner.scan_usb().await
        }

        async fn list_usb(&self) -> DeviceResult<Vec<(Arc<dyn YubiKeyDevice>, DeviceInfo)>> {
            if self.fail_usb {
                return Err(DeviceError::Command("USB enumeration failed".to_string()));
            }
            self.inner.list_usb().await
        }

        async fn list_readers(&self) -> DeviceResult<Vec<Arc<dyn YubiKeyDevice>>> {
            let readers = self.inner.list_readers().await?;
            if let Some(serial) = self.detach_after_listing {
                self.inner.detach(serial).await;
            }
            Ok(readers)
        }

        async fn connect(&self, serial: Option<u32>, kind: ConnectionKind) -> DeviceResult<Arc<dyn Connection>> {
            self.inner.connect(serial, kind).await
        }
    }

    fn reader_entry<'a>(report: &'a Value, name: &str) -> &'a Value {
        report["readers"]
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["name"] == name)
            .unwrap()
    }

    #[tokio::test]
    async fn test_report_lists_simulated_key() {
        let backend = MemoryBackend::from_devices(&[SimulatedDevice::default()]).unwrap();
        let report = collect(&backend).await;

        assert_eq!(report["version"], VERSION);
        assert_eq!(report["backend"], "memory");
        assert_eq!(report["devices"][0]["name"], "YubiKey 5 NFC");
        assert_eq!(report["devices"][0]["info"]["serial"], 12345678);
        assert!(report["usb"]["state"].as_u64().unwrap() > 0);
        assert!(report["readers"].is_array());
    }

    #[tokio::test]
    async fn test_report_covers_usb_and_reader_keys() {
        let backend = MemoryBackend::from_devices(&[SimulatedDevice::default(), nfc_key()]).unwrap();
        let report = collect(&backend).await;

        let devices = report["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["info"]["serial"], 12345678);
        assert_eq!(report["usb"]["pids"][0]["count"], 1);

        let readers = report["readers"].as_array().unwrap();
        assert_eq!(readers.len(), 2);
        let nfc = reader_entry(&report, READER);
        assert_eq!(nfc["transport"], "nfc");
        assert_eq!(nfc["info"]["serial"], 99);

        let usb_reader = readers.iter().find(|r| r["name"] != READER).unwrap();
        assert_eq!(usb_reader["transport"], "usb");
        assert_eq!(usb_reader["info"]["serial"], 12345678);
    }

    #[tokio::test]
    async fn test_key_removed_during_collection_is_recorded() {
        let backend = UnstableBackend {
            inner: MemoryBackend::from_devices(&[SimulatedDevice::default(), nfc_key()]).unwrap(),
            detach_after_listing: Some(99),
            fail_usb: false,
        };
        let report = collect(&backend).await;

        assert_eq!(report["backend"], "unstable");
        assert_eq!(report["devices"][0]["info"]["serial"], 12345678);
        let nfc = reader_entry(&report, READER);
        assert!(nfc["info"]["error"].as_str().unwrap().contains(READER));
        assert!(nfc["info"].get("serial").is_none());
    }

    #[tokio::test]
    async fn test_failed_section_does_not_hide_others() {
        let backend = UnstableBackend {
            inner: MemoryBackend::from_devices(&[SimulatedDevice::default()]).unwrap(),
            detach_after_listing: None,
            fail_usb: true,
        };
        let report = collect(&backend).await;

        assert_eq!(report["devices"]["error"], "Command failed: USB enumeration failed");
        assert!(report["usb"]["state"].as_u64().unwrap() > 0);
        assert_eq!(report["readers"].as_array().unwrap().len(), 1);
    }
}
