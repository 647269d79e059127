use protocol::RpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Wrong key")]
    WrongKey,

    #[error("PIN invalid, {retries} attempts remaining")]
    PinInvalid { retries: u8 },

    #[error("PIN required")]
    PinRequired,

    #[error("Fingerprint capture error: {0}")]
    Capture(u8),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Command failed: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl From<DeviceError> for RpcError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::ConnectionLost(reason) => RpcError::ConnectionLost(reason),
            DeviceError::Io(e) => RpcError::ConnectionLost(e.to_string()),
            DeviceError::NotSupported(reason) => RpcError::NotSupported(reason),
            DeviceError::InvalidData(reason) => RpcError::InvalidParams(reason),
            DeviceError::Cancelled => RpcError::Cancelled,
            other => RpcError::Device(other.to_string()),
        }
    }
}
