pub mod config;
pub mod diagnostics;
pub mod nodes;
pub mod server;
pub mod shell;

pub use config::{ConfigError, ConfigResult, KeyrpcConfig, ServerConfig, ShellConfig, SimulatorConfig};
pub use nodes::{RootNode, VERSION};
pub use server::{process, run_rpc};
pub use shell::{resolve_path, run_shell, RpcClient, Shell, ShellError, ShellResult};
