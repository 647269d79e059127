//! Typed accessors for action parameters.
//!
//! Accessors remove the key they read so that leftover keys can be
//! passed on, the same way the OATH `put_data` action forwards extra
//! credential fields.

use crate::error::{RpcError, RpcResult};
use crate::types::Params;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub trait ParamsExt {
    fn take_value(&mut self, key: &str) -> Option<Value>;

    fn required_str(&mut self, key: &str) -> RpcResult<String> {
        self.optional_str(key)?
            .ok_or_else(|| RpcError::invalid_params(format!("missing parameter '{}'", key)))
    }

    fn optional_str(&mut self, key: &str) -> RpcResult<Option<String>> {
        match self.take_value(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(RpcError::invalid_params(format!(
                "parameter '{}' must be a string, got {}",
                key, other
            ))),
        }
    }

    fn required_hex(&mut self, key: &str) -> RpcResult<Vec<u8>> {
        let value = self.required_str(key)?;
        Ok(hex::decode(value)?)
    }

    /// An absent or empty hex string reads as `None`.
    fn optional_hex(&mut self, key: &str) -> RpcResult<Option<Vec<u8>>> {
        match self.optional_str(key)? {
            Some(value) if !value.is_empty() => Ok(Some(hex::decode(value)?)),
            _ => Ok(None),
        }
    }

    fn optional_bool(&mut self, key: &str) -> RpcResult<Option<bool>> {
        match self.take_value(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(other) => Err(RpcError::invalid_params(format!(
                "parameter '{}' must be a boolean, got {}",
                key, other
            ))),
        }
    }

    fn optional_u64(&mut self, key: &str) -> RpcResult<Option<u64>> {
        match self.take_value(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                RpcError::invalid_params(format!(
                    "parameter '{}' must be a non-negative integer",
                    key
                ))
            }),
            Some(other) => Err(RpcError::invalid_params(format!(
                "parameter '{}' must be an integer, got {}",
                key, other
            ))),
        }
    }

    fn optional_as<T: DeserializeOwned>(&mut self, key: &str) -> RpcResult<Option<T>> {
        match self.take_value(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                RpcError::invalid_params(format!("parameter '{}' is invalid: {}", key, e))
            }),
        }
    }
}

impl ParamsExt for Params {
    fn take_value(&mut self, key: &str) -> Option<Value> {
        self.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_required_str_removes_key() {
        let mut p = params(json!({"name": "alice", "other": 1}));
        assert_eq!(p.required_str("name").unwrap(), "alice");
        assert!(!p.contains_key("name"));
        assert!(p.contains_key("other"));
    }

    #[test]
    fn test_missing_and_mistyped() {
        let mut p = params(json!({"n": 5}));
        assert!(matches!(
            p.required_str("missing"),
            Err(RpcError::InvalidParams(_))
        ));
        assert!(p.required_str("n").is_err());
    }

    #[test]
    fn test_hex_values() {
        let mut p = params(json!({"a": "0a0b", "b": "", "c": "zz"}));
        assert_eq!(p.required_hex("a").unwrap(), vec![0x0a, 0x0b]);
        assert_eq!(p.optional_hex("b").unwrap(), None);
        assert!(p.optional_hex("c").is_err());
        assert_eq!(p.optional_hex("d").unwrap(), None);
    }

    #[test]
    fn test_numbers_and_bools() {
        let mut p = params(json!({"t": 30, "neg": -1, "touch": true}));
        assert_eq!(p.optional_u64("t").unwrap(), Some(30));
        assert!(p.optional_u64("neg").is_err());
        assert_eq!(p.optional_bool("touch").unwrap(), Some(true));
        assert_eq!(p.optional_bool("touch").unwrap(), None);
    }
}
