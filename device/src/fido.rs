use crate::serde_hex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Permissions requested with a PIN token (CTAP 2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinPermissions(pub u8);

impl PinPermissions {
    pub const MAKE_CREDENTIAL: PinPermissions = PinPermissions(0x01);
    pub const GET_ASSERTION: PinPermissions = PinPermissions(0x02);
    pub const CREDENTIAL_MGMT: PinPermissions = PinPermissions(0x04);
    pub const BIO_ENROLL: PinPermissions = PinPermissions(0x08);

    pub fn contains(&self, other: PinPermissions) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinToken {
    pub token: Vec<u8>,
    pub permissions: PinPermissions,
}

/// The `authenticatorGetInfo` response, keyed by member name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthenticatorInfo(pub Map<String, Value>);

impl AuthenticatorInfo {
    pub fn option(&self, name: &str) -> Option<bool> {
        self.0.get("options")?.get(name)?.as_bool()
    }

    pub fn has_pin(&self) -> bool {
        self.option("clientPin").unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CredentialMetadata {
    pub existing_cred_count: u32,
    pub max_remaining_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelyingParty {
    pub rp_id: String,
    #[serde(with = "serde_hex")]
    pub rp_id_hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FidoCredential {
    #[serde(with = "serde_hex")]
    pub credential_id: Vec<u8>,
    #[serde(with = "serde_hex")]
    pub user_id: Vec<u8>,
    pub user_name: String,
    pub display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_info_options() {
        let info: AuthenticatorInfo =
            serde_json::from_value(json!({"versions": ["FIDO_2_0"], "options": {"clientPin": true}}))
                .unwrap();
        assert!(info.has_pin());
        assert_eq!(info.option("bioEnroll"), None);
        assert!(!AuthenticatorInfo::default().has_pin());
    }

    #[test]
    fn test_permissions() {
        let p = PinPermissions(PinPermissions::CREDENTIAL_MGMT.0 | PinPermissions::BIO_ENROLL.0);
        assert!(p.contains(PinPermissions::BIO_ENROLL));
        assert!(!p.contains(PinPermissions::GET_ASSERTION));
    }

    #[test]
    fn test_credential_hex_fields() {
        let cred = FidoCredential {
            credential_id: vec![0xca, 0xfe],
            user_id: vec![1],
            user_name: "alice".into(),
            display_name: None,
        };
        let value = serde_json::to_value(&cred).unwrap();
        assert_eq!(value["credential_id"], "cafe");
        assert_eq!(value["user_id"], "01");
    }
}
