use crate::types::{Capabilities, DeviceInfo, FormFactor, KeyType, Transport};

/// Marketing name for a key, derived from its device info.
pub fn product_name(info: &DeviceInfo, key_type: Option<KeyType>) -> String {
    match key_type {
        Some(KeyType::Yks) => return "YubiKey Standard".to_string(),
        Some(KeyType::Neo) => return "YubiKey NEO".to_string(),
        Some(KeyType::Ykp) => return "YubiKey Plus".to_string(),
        _ => {}
    }

    let nfc = info.has_transport(Transport::Nfc);
    let usb_c = info.form_factor.is_usb_c();

    if info.is_sky || key_type == Some(KeyType::Sky) {
        if info.version.major() < 5 {
            let fido2 = info.supports(Transport::Usb).contains(Capabilities::FIDO2);
            return if fido2 {
                "Security Key by Yubico".to_string()
            } else {
                "FIDO U2F Security Key".to_string()
            };
        }
        let mut name = "Security Key".to_string();
        if usb_c {
            name.push_str(" C");
        }
        if nfc {
            name.push_str(" NFC");
        }
        return name;
    }

    if info.form_factor.is_bio() {
        let mut name = "YubiKey".to_string();
        if usb_c {
            name.push_str(" C");
        }
        name.push_str(" Bio");
        return name;
    }

    let mut name = if info.version.major() < 5 {
        "YubiKey 4".to_string()
    } else {
        "YubiKey 5".to_string()
    };
    name.push_str(match info.form_factor {
        FormFactor::UsbANano => " Nano",
        FormFactor::UsbCKeychain => "C",
        FormFactor::UsbCNano => "C Nano",
        FormFactor::UsbCLightning => "Ci",
        _ => "",
    });
    if nfc {
        name.push_str(" NFC");
    }
    if info.is_fips {
        name.push_str(" FIPS");
    }
    name
}
