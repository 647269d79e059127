pub mod codec;
pub mod error;
pub mod node;
pub mod params;
pub mod types;

pub use codec::{write_message, MessageReader, MAX_LINE_LENGTH};
pub use error::{RpcError, RpcResult};
pub use node::{ActionSpec, CallContext, Children, Node, NodeHost, SignalSink, GET};
pub use params::ParamsExt;
pub use types::{to_body, Body, Command, Incoming, Outgoing, Params, CANCEL_SIGNAL};

pub use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use crate::error::*;
    pub use crate::node::*;
    pub use crate::params::*;
    pub use crate::types::*;
}
