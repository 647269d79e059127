use crate::error::{RpcError, RpcResult};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

pub type Params = Map<String, Value>;
pub type Body = Map<String, Value>;

pub const CANCEL_SIGNAL: &str = "cancel";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub action: String,
    #[serde(default)]
    pub target: Vec<String>,
    #[serde(default)]
    pub params: Params,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target: Vec::new(),
            params: Params::new(),
        }
    }

    pub fn with_target<I, S>(mut self, target: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = target.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// A message read from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Command(Command),
    Signal(String),
}

impl Incoming {
    pub fn parse_line(line: &str) -> RpcResult<Self> {
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> RpcResult<Self> {
        let Value::Object(object) = value else {
            return Err(RpcError::Exception("Unsupported message type".to_string()));
        };

        if let Some(signal) = object.get("signal") {
            return signal
                .as_str()
                .map(|name| Incoming::Signal(name.to_string()))
                .ok_or_else(|| RpcError::Exception("Signal name must be a string".to_string()));
        }

        if object.contains_key("action") {
            let command: Command = serde_json::from_value(Value::Object(object))?;
            return Ok(Incoming::Command(command));
        }

        Err(RpcError::Exception("Unsupported message type".to_string()))
    }
}

/// A message written to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Success(Body),
    Error {
        status: String,
        message: String,
        body: Body,
    },
    Signal {
        name: String,
        fields: Body,
    },
}

impl Outgoing {
    pub fn success(body: Body) -> Self {
        Outgoing::Success(body)
    }

    pub fn error(err: &RpcError) -> Self {
        Outgoing::Error {
            status: err.status().to_string(),
            message: err.to_string(),
            body: err.body(),
        }
    }

    pub fn signal(name: impl Into<String>, fields: Body) -> Self {
        Outgoing::Signal {
            name: name.into(),
            fields,
        }
    }

    pub fn is_signal(&self) -> bool {
        matches!(self, Outgoing::Signal { .. })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Outgoing::Success(body) => {
                let mut object = body.clone();
                object.insert("result".to_string(), Value::from("success"));
                Value::Object(object)
            }
            Outgoing::Error {
                status,
                message,
                body,
            } => {
                let mut object = Map::new();
                object.insert("result".to_string(), Value::from("error"));
                object.insert("status".to_string(), Value::from(status.as_str()));
                object.insert("message".to_string(), Value::from(message.as_str()));
                object.insert("body".to_string(), Value::Object(body.clone()));
                Value::Object(object)
            }
            Outgoing::Signal { name, fields } => {
                let mut object = fields.clone();
                object.insert("signal".to_string(), Value::from(name.as_str()));
                Value::Object(object)
            }
        }
    }

    /// Parses a message previously produced by [`Outgoing::to_value`].
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut object) = value else {
            return None;
        };

        if let Some(Value::String(name)) = object.remove("signal") {
            return Some(Outgoing::Signal {
                name,
                fields: object,
            });
        }

        match object.remove("result")?.as_str()? {
            "success" => Some(Outgoing::Success(object)),
            "error" => {
                let status = object.get("status")?.as_str()?.to_string();
                let message = object
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let body = match object.remove("body") {
                    Some(Value::Object(body)) => body,
                    _ => Body::new(),
                };
                Some(Outgoing::Error {
                    status,
                    message,
                    body,
                })
            }
            _ => None,
        }
    }
}

impl Serialize for Outgoing {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Turns any serializable value into a response body.
///
/// Non-object values are wrapped under a `value` key.
pub fn to_body<T: Serialize>(value: &T) -> RpcResult<Body> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Body::new()),
        other => {
            let mut body = Body::new();
            body.insert("value".to_string(), other);
            Ok(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_command_defaults() {
        let incoming = Incoming::parse_line(r#"{"action": "get"}"#).unwrap();
        assert_eq!(incoming, Incoming::Command(Command::new("get")));
    }

    #[test]
    fn test_parse_command_with_target_and_params() {
        let incoming = Incoming::parse_line(
            r#"{"action": "code", "target": ["usb", "123"], "params": {"timestamp": 59}}"#,
        )
        .unwrap();
        let Incoming::Command(command) = incoming else {
            panic!("expected command");
        };
        assert_eq!(command.action, "code");
        assert_eq!(command.target, vec!["usb", "123"]);
        assert_eq!(command.params["timestamp"], 59);
    }

    #[test]
    fn test_parse_signal() {
        let incoming = Incoming::parse_line(r#"{"signal": "cancel"}"#).unwrap();
        assert_eq!(incoming, Incoming::Signal(CANCEL_SIGNAL.to_string()));
    }

    #[test]
    fn test_unsupported_message() {
        let err = Incoming::parse_line(r#"{"hello": "world"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported message type");

        let err = Incoming::parse_line("[1, 2]").unwrap_err();
        assert_eq!(err.to_string(), "Unsupported message type");

        assert!(Incoming::parse_line("not json").is_err());
    }

    #[test]
    fn test_success_is_flattened() {
        let mut body = Body::new();
        body.insert("state".to_string(), json!(7));
        let value = Outgoing::success(body).to_value();
        assert_eq!(value, json!({"result": "success", "state": 7}));
    }

    #[test]
    fn test_error_shape() {
        let err = RpcError::state_reset("", vec!["usb".into()]);
        let value = Outgoing::error(&err).to_value();
        assert_eq!(value["result"], "error");
        assert_eq!(value["status"], "state-reset");
        assert_eq!(value["message"], "State reset in node");
        assert_eq!(value["body"]["path"], json!(["usb"]));
    }

    #[test]
    fn test_signal_shape_and_parse_back() {
        let mut fields = Body::new();
        fields.insert("remaining".to_string(), json!(3));
        let outgoing = Outgoing::signal("capture", fields);
        let value = outgoing.to_value();
        assert_eq!(value, json!({"signal": "capture", "remaining": 3}));
        assert_eq!(Outgoing::from_value(value), Some(outgoing));
    }

    #[test]
    fn test_to_body_wraps_scalars() {
        assert_eq!(to_body(&json!(5)).unwrap()["value"], 5);
        assert!(to_body(&()).unwrap().is_empty());
    }
}
