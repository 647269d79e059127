//! OATH (TOTP/HOTP) logic that runs on the host side of a session.

use crate::error::{DeviceError, DeviceResult};
use crate::serde_hex;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use data_encoding::BASE32_NOPAD;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PERIOD: u32 = 30;
pub const DEFAULT_DIGITS: u8 = 6;
pub const DEFAULT_IMF: u64 = 0;
pub const HMAC_MINIMUM_KEY_SIZE: usize = 14;
pub const KEY_DERIVATION_ROUNDS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OathType {
    Hotp = 0x10,
    Totp = 0x20,
}

impl From<OathType> for u8 {
    fn from(value: OathType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for OathType {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(OathType::Hotp),
            0x20 => Ok(OathType::Totp),
            other => Err(DeviceError::InvalidData(format!("unknown OATH type: {}", other))),
        }
    }
}

impl FromStr for OathType {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HOTP" => Ok(OathType::Hotp),
            "TOTP" => Ok(OathType::Totp),
            other => Err(DeviceError::InvalidData(format!("unknown OATH type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum HashAlgorithm {
    #[default]
    Sha1 = 0x01,
    Sha256 = 0x02,
    Sha512 = 0x03,
}

impl HashAlgorithm {
    pub fn block_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 | HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    pub fn hmac(&self, key: &[u8], message: &[u8]) -> DeviceResult<Vec<u8>> {
        match self {
            HashAlgorithm::Sha1 => compute_mac::<Hmac<Sha1>>(key, message),
            HashAlgorithm::Sha256 => compute_mac::<Hmac<Sha256>>(key, message),
            HashAlgorithm::Sha512 => compute_mac::<Hmac<Sha512>>(key, message),
        }
    }
}

fn compute_mac<M: Mac + KeyInit>(key: &[u8], message: &[u8]) -> DeviceResult<Vec<u8>> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|e| DeviceError::InvalidData(format!("invalid HMAC key: {}", e)))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl From<HashAlgorithm> for u8 {
    fn from(value: HashAlgorithm) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for HashAlgorithm {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(HashAlgorithm::Sha1),
            0x02 => Ok(HashAlgorithm::Sha256),
            0x03 => Ok(HashAlgorithm::Sha512),
            other => Err(DeviceError::InvalidData(format!("unknown hash algorithm: {}", other))),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(HashAlgorithm::Sha1),
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            other => Err(DeviceError::InvalidData(format!("unknown hash algorithm: {}", other))),
        }
    }
}

/// Everything needed to program a credential onto a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialData {
    pub name: String,
    pub oath_type: OathType,
    pub hash_algorithm: HashAlgorithm,
    #[serde(with = "serde_hex")]
    pub secret: Vec<u8>,
    pub digits: u8,
    pub period: u32,
    pub counter: u32,
    pub issuer: Option<String>,
}

impl CredentialData {
    pub fn new(name: impl Into<String>, oath_type: OathType, secret: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            oath_type,
            hash_algorithm: HashAlgorithm::Sha1,
            secret,
            digits: DEFAULT_DIGITS,
            period: DEFAULT_PERIOD,
            counter: DEFAULT_IMF as u32,
            issuer: None,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_hash(mut self, hash_algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = hash_algorithm;
        self
    }

    pub fn with_digits(mut self, digits: u8) -> Self {
        self.digits = digits;
        self
    }

    pub fn with_period(mut self, period: u32) -> Self {
        self.period = period;
        self
    }

    pub fn with_counter(mut self, counter: u32) -> Self {
        self.counter = counter;
        self
    }

    /// Parses an `otpauth://` URI.
    pub fn parse_uri(uri: &str) -> DeviceResult<Self> {
        let url = url::Url::parse(uri)
            .map_err(|e| DeviceError::InvalidData(format!("invalid URI: {}", e)))?;
        if url.scheme() != "otpauth" {
            return Err(DeviceError::InvalidData("URI scheme must be otpauth://".to_string()));
        }
        let oath_type: OathType = url.host_str().unwrap_or_default().parse()?;

        let path = url.path().trim_start_matches('/');
        let label = urlencoding::decode(path)
            .map_err(|e| DeviceError::InvalidData(format!("invalid label: {}", e)))?;
        let (label_issuer, name) = match label.split_once(':') {
            Some((issuer, name)) => (Some(issuer.trim().to_string()), name.trim().to_string()),
            None => (None, label.trim().to_string()),
        };

        let mut data = CredentialData::new(name, oath_type, Vec::new());
        let mut issuer = label_issuer;
        let mut secret = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "secret" => secret = Some(base32_decode(&value)?),
                "issuer" => issuer = Some(value.into_owned()),
                "algorithm" => data.hash_algorithm = value.parse()?,
                "digits" => data.digits = parse_number(&key, &value)?,
                "period" => data.period = parse_number(&key, &value)?,
                "counter" => data.counter = parse_number(&key, &value)?,
                _ => {}
            }
        }

        data.secret = secret
            .ok_or_else(|| DeviceError::InvalidData("URI is missing a secret".to_string()))?;
        data.issuer = issuer.filter(|i| !i.is_empty());
        data.validate()?;
        Ok(data)
    }

    pub fn validate(&self) -> DeviceResult<()> {
        if self.name.is_empty() {
            return Err(DeviceError::InvalidData("name must not be empty".to_string()));
        }
        if !(6..=8).contains(&self.digits) {
            return Err(DeviceError::InvalidData("digits must be 6, 7 or 8".to_string()));
        }
        if self.period == 0 {
            return Err(DeviceError::InvalidData("period must be greater than 0".to_string()));
        }
        if self.secret.is_empty() {
            return Err(DeviceError::InvalidData("secret must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn id(&self) -> Vec<u8> {
        format_credential_id(self.issuer.as_deref(), &self.name, self.oath_type, self.period)
    }

    /// The key as stored on the device: over-long keys are hashed and
    /// short keys are zero-padded.
    pub fn processed_secret(&self) -> Vec<u8> {
        hmac_shortcut(&self.secret, self.hash_algorithm)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> DeviceResult<T> {
    value
        .parse()
        .map_err(|_| DeviceError::InvalidData(format!("invalid {}: {}", key, value)))
}

pub fn hmac_shortcut(secret: &[u8], hash_algorithm: HashAlgorithm) -> Vec<u8> {
    let mut key = if secret.len() > hash_algorithm.block_size() {
        hash_algorithm.digest(secret)
    } else {
        secret.to_vec()
    };
    if key.len() < HMAC_MINIMUM_KEY_SIZE {
        key.resize(HMAC_MINIMUM_KEY_SIZE, 0);
    }
    key
}

pub fn format_credential_id(
    issuer: Option<&str>,
    name: &str,
    oath_type: OathType,
    period: u32,
) -> Vec<u8> {
    let mut id = name.to_string();
    if let Some(issuer) = issuer {
        id = format!("{}:{}", issuer, id);
    }
    if oath_type == OathType::Totp && period != DEFAULT_PERIOD {
        id = format!("{}/{}", period, id);
    }
    id.into_bytes()
}

/// Splits a stored credential id into `(issuer, name, period)`.
pub fn parse_credential_id(id: &[u8], oath_type: OathType) -> (Option<String>, String, u32) {
    let text = String::from_utf8_lossy(id);
    let mut rest: &str = &text;
    let mut period = DEFAULT_PERIOD;

    if oath_type == OathType::Totp {
        if let Some((prefix, tail)) = rest.split_once('/') {
            if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(p) = prefix.parse() {
                    period = p;
                    rest = tail;
                }
            }
        }
    }

    match rest.split_once(':') {
        Some((issuer, name)) if !issuer.is_empty() => {
            (Some(issuer.to_string()), name.to_string(), period)
        }
        _ => (None, rest.to_string(), period),
    }
}

/// A credential as listed by a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub device_id: String,
    #[serde(with = "serde_hex")]
    pub id: Vec<u8>,
    pub issuer: Option<String>,
    pub name: String,
    pub oath_type: OathType,
    pub period: u32,
    pub touch_required: Option<bool>,
}

impl Credential {
    pub fn from_id(device_id: &str, id: Vec<u8>, oath_type: OathType, touch_required: Option<bool>) -> Self {
        let (issuer, name, period) = parse_credential_id(&id, oath_type);
        Self {
            device_id: device_id.to_string(),
            id,
            issuer,
            name,
            oath_type,
            period,
            touch_required,
        }
    }

    /// Node name for the credential: its id as text.
    pub fn id_string(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }

    pub fn sort_key(&self) -> (String, String) {
        (
            self.issuer.as_deref().unwrap_or(&self.name).to_lowercase(),
            self.name.to_lowercase(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    pub value: String,
    pub valid_from: u64,
    /// `None` for HOTP codes, which do not expire.
    pub valid_to: Option<u64>,
}

impl Code {
    pub fn new(credential: &Credential, timestamp: u64, truncated: u32, digits: u8) -> Self {
        let value = format_code(truncated, digits);
        match credential.oath_type {
            OathType::Totp => {
                let period = credential.period.max(1) as u64;
                let valid_from = timestamp - timestamp % period;
                Code {
                    value,
                    valid_from,
                    valid_to: Some(valid_from + period),
                }
            }
            OathType::Hotp => Code {
                value,
                valid_from: timestamp,
                valid_to: None,
            },
        }
    }
}

/// The 8-byte big-endian time step used as TOTP challenge.
pub fn time_challenge(timestamp: u64, period: u32) -> [u8; 8] {
    (timestamp / period.max(1) as u64).to_be_bytes()
}

/// Dynamic truncation (RFC 4226, section 5.3).
pub fn truncate(response: &[u8]) -> DeviceResult<u32> {
    let last = *response
        .last()
        .ok_or_else(|| DeviceError::InvalidData("empty HMAC response".to_string()))?;
    let offset = (last & 0x0f) as usize;
    let window = response
        .get(offset..offset + 4)
        .ok_or_else(|| DeviceError::InvalidData("HMAC response too short".to_string()))?;
    Ok(u32::from_be_bytes([window[0], window[1], window[2], window[3]]) & 0x7fff_ffff)
}

pub fn format_code(truncated: u32, digits: u8) -> String {
    let modulus = 10u64.pow(digits as u32);
    format!(
        "{:0width$}",
        truncated as u64 % modulus,
        width = digits as usize
    )
}

/// Access key derived from a password, as used by `validate` and `set_key`.
pub fn derive_key(salt: &[u8], password: &str) -> Vec<u8> {
    let mut key = [0u8; 16];
    pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, KEY_DERIVATION_ROUNDS, &mut key);
    key.to_vec()
}

pub fn device_id_from_salt(salt: &[u8]) -> String {
    let digest = Sha256::digest(salt);
    STANDARD_NO_PAD.encode(&digest[..16])
}

/// RFC 4648 base32, case-insensitive, padding and whitespace optional.
pub fn base32_decode(input: &str) -> DeviceResult<Vec<u8>> {
    let cleaned: String = input
        .chars()
        .filter(|c| *c != '=' && *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    BASE32_NOPAD
        .decode(cleaned.as_bytes())
        .map_err(|e| DeviceError::InvalidData(format!("invalid base32 value: {}", e)))
}

impl fmt::Display for OathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OathType::Hotp => write!(f, "HOTP"),
            OathType::Totp => write!(f, "TOTP"),
        }
    }
}
