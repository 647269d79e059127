//! Interactive shell over an in-process RPC server.
//!
//! The server runs on the tokio runtime and talks JSON lines over in-memory
//! pipes. The shell itself is a blocking rustyline loop on a dedicated
//! thread, bridged to the pipes by channels.

use crate::config::{KeyrpcConfig, ShellConfig};
use crate::server::run_rpc;
use device::DeviceBackend;
use protocol::{Command, Params, CANCEL_SIGNAL};
use rustyline::completion::Completer;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const PIPE_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Readline error: {0}")]
    Readline(#[from] ReadlineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC server disconnected")]
    Disconnected,
}

pub type ShellResult<T> = Result<T, ShellError>;

/// Splits `line` into a path relative to `current`.
///
/// The last element is the action or child name being addressed; empty
/// input addresses `current` itself with an empty name.
pub fn resolve_path(current: &[String], line: &str) -> Vec<String> {
    if line.is_empty() {
        let mut parts = current.to_vec();
        parts.push(String::new());
        return parts;
    }

    let mut parts: Vec<String> = line.split('/').map(str::to_string).collect();
    if parts[0].is_empty() {
        parts.remove(0);
    } else {
        let mut absolute = current.to_vec();
        absolute.append(&mut parts);
        parts = absolute;
    }

    while let Some(pos) = parts.iter().position(|p| p == "..") {
        parts.remove(pos);
        if pos > 0 {
            parts.remove(pos - 1);
        }
    }
    parts
}

#[derive(Debug, Clone, Copy)]
pub struct Palette {
    enabled: bool,
}

impl Palette {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn paint(&self, code: u8, text: &str) -> String {
        if self.enabled {
            format!("\u{1b}[{};1m{}\u{1b}[0m", code, text)
        } else {
            text.to_string()
        }
    }

    pub fn red(&self, text: &str) -> String {
        self.paint(31, text)
    }

    pub fn green(&self, text: &str) -> String {
        self.paint(32, text)
    }

    pub fn yellow(&self, text: &str) -> String {
        self.paint(33, text)
    }

    pub fn cyan(&self, text: &str) -> String {
        self.paint(36, text)
    }
}

/// Blocking client side of the pipes. Must not be used from async code.
pub struct RpcClient {
    lines: mpsc::Sender<String>,
    messages: mpsc::Receiver<Value>,
}

impl RpcClient {
    fn send(&mut self, value: &impl serde::Serialize) -> ShellResult<()> {
        let line = serde_json::to_string(value)?;
        self.lines
            .blocking_send(line)
            .map_err(|_| ShellError::Disconnected)
    }

    fn recv(&mut self) -> ShellResult<Value> {
        self.messages.blocking_recv().ok_or(ShellError::Disconnected)
    }

    /// Sends a command and waits for its response. Signals received in the
    /// meantime are handed to `on_signal`.
    pub fn call(
        &mut self,
        action: &str,
        target: &[String],
        params: Params,
        mut on_signal: impl FnMut(&Value),
    ) -> ShellResult<Value> {
        let command = Command::new(action)
            .with_target(target.iter().cloned())
            .with_params(params);
        self.send(&command)?;
        loop {
            let message = self.recv()?;
            if message.get("signal").is_some() {
                on_signal(&message);
            } else {
                return Ok(message);
            }
        }
    }

    pub fn get(&mut self, target: &[String]) -> ShellResult<Value> {
        self.call("get", target, Params::new(), |_| {})
    }
}

fn is_success(response: &Value) -> bool {
    response["result"] == "success"
}

/// Starts `run_rpc` on in-memory pipes and returns a client for it.
pub fn spawn_server(
    backend: Arc<dyn DeviceBackend>,
    config: KeyrpcConfig,
) -> (RpcClient, JoinHandle<std::io::Result<()>>) {
    let (mut to_server, server_input) = tokio::io::duplex(PIPE_SIZE);
    let (server_output, from_server) = tokio::io::duplex(PIPE_SIZE);
    let (line_tx, mut line_rx) = mpsc::channel::<String>(8);
    let (message_tx, message_rx) = mpsc::channel::<Value>(64);

    let server = tokio::spawn(async move {
        let result = run_rpc(server_input, server_output, backend, &config).await;
        if let Err(e) = &result {
            error!(error = %e, "RPC server failed");
        }
        result
    });

    tokio::spawn(async move {
        while let Some(mut line) = line_rx.recv().await {
            line.push('\n');
            if let Err(e) = to_server.write_all(line.as_bytes()).await {
                warn!(error = %e, "Error writing to server");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(from_server).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<Value>(&line) {
                Ok(message) => {
                    if message_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Invalid message from server"),
            }
        }
    });

    let client = RpcClient {
        lines: line_tx,
        messages: message_rx,
    };
    (client, server)
}

type SharedClient = Rc<RefCell<RpcClient>>;
type SharedPath = Rc<RefCell<Vec<String>>>;

struct ShellHelper {
    client: SharedClient,
    path: SharedPath,
}

impl ShellHelper {
    fn complete_path(&self, text: &str, nodes_only: bool) -> Vec<String> {
        let mut target = resolve_path(&self.path.borrow(), text);
        let prefix = target.pop().unwrap_or_default();
        let node = match self.client.borrow_mut().get(&target) {
            Ok(node) if is_success(&node) => node,
            _ => return Vec::new(),
        };

        let mut names: Vec<String> = node["children"]
            .as_object()
            .map(|children| children.keys().map(|name| format!("{}/", name)).collect())
            .unwrap_or_default();
        if !nodes_only {
            if let Some(actions) = node["actions"].as_array() {
                names.extend(
                    actions
                        .iter()
                        .filter_map(Value::as_str)
                        .filter(|name| *name != "get")
                        .map(str::to_string),
                );
            }
        }
        names.retain(|name| name.starts_with(&prefix));
        names
    }
}

impl Completer for ShellHelper {
    type Candidate = String;

    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> rustyline::Result<(usize, Vec<String>)> {
        let head = &line[..pos];
        let (offset, text, nodes_only) = if let Some(rest) = head.strip_prefix("cd ") {
            (3, rest, true)
        } else if head.contains(char::is_whitespace) {
            return Ok((pos, Vec::new()));
        } else {
            (0, head, false)
        };
        let start = offset + text.rfind('/').map(|i| i + 1).unwrap_or(0);
        Ok((start, self.complete_path(text, nodes_only)))
    }
}

impl Hinter for ShellHelper {
    type Hint = String;
}

impl Highlighter for ShellHelper {}

impl Validator for ShellHelper {}

impl Helper for ShellHelper {}

pub struct Shell {
    client: SharedClient,
    path: SharedPath,
    palette: Palette,
    out: Box<dyn Write>,
    history_file: Option<PathBuf>,
}

impl Shell {
    pub fn new(client: RpcClient, config: &ShellConfig) -> Self {
        Self::with_output(client, config, Box::new(std::io::stdout()))
    }

    /// A shell printing to `out` instead of stdout.
    pub fn with_output(client: RpcClient, config: &ShellConfig, out: Box<dyn Write>) -> Self {
        Self {
            client: Rc::new(RefCell::new(client)),
            path: SharedPath::default(),
            palette: Palette::new(config.color),
            out,
            history_file: config.history_file.clone(),
        }
    }

    fn editor(&self) -> ShellResult<Editor<ShellHelper, DefaultHistory>> {
        let mut editor = Editor::<ShellHelper, DefaultHistory>::new()?;
        editor.set_helper(Some(ShellHelper {
            client: self.client.clone(),
            path: self.path.clone(),
        }));
        if let Some(history) = &self.history_file {
            if let Err(e) = editor.load_history(history) {
                debug!(error = %e, "no shell history loaded");
            }
        }
        Ok(editor)
    }

    fn prompt(&self) -> String {
        format!("/{}> ", self.path.borrow().join("/"))
    }

    fn print_error(&mut self, response: &Value) -> ShellResult<()> {
        let status = response["status"].as_str().unwrap_or("error");
        let message = response["message"].as_str().unwrap_or_default();
        writeln!(self.out, "{}", self.palette.red(&format!("{}: {}", status, message)))?;
        if response["body"].as_object().is_some_and(|b| !b.is_empty()) {
            writeln!(self.out, "{}", self.palette.red(&response["body"].to_string()))?;
        }
        Ok(())
    }

    fn get_node(&mut self, target: &[String]) -> ShellResult<Option<Value>> {
        let response = self.client.borrow_mut().get(target)?;
        if is_success(&response) {
            Ok(Some(response))
        } else {
            self.print_error(&response)?;
            Ok(None)
        }
    }

    pub fn cd(&mut self, args: &str) -> ShellResult<()> {
        let mut target = if args.is_empty() {
            Vec::new()
        } else {
            resolve_path(&self.path.borrow(), args)
        };
        if target.last().is_some_and(String::is_empty) {
            target.pop();
        }
        if self.get_node(&target)?.is_some() {
            debug!(path = ?target, "changed directory");
            *self.path.borrow_mut() = target;
        }
        Ok(())
    }

    pub fn ls(&mut self) -> ShellResult<()> {
        let path = self.path.borrow().clone();
        let Some(node) = self.get_node(&path)? else {
            return Ok(());
        };

        if let Some(data) = node["data"].as_object() {
            for (key, value) in data {
                writeln!(self.out, "{}", self.palette.yellow(&format!("{}: {}", key, value)))?;
            }
        }
        if let Some(children) = node["children"].as_object() {
            for (name, info) in children {
                writeln!(self.out, "{}", self.palette.green(&format!("{}/", name)))?;
                if let Some(info) = info.as_object() {
                    for (key, value) in info {
                        writeln!(self.out, "{}", self.palette.yellow(&format!("  {}: {}", key, value)))?;
                    }
                }
            }
        }
        if let Some(actions) = node["actions"].as_array() {
            for action in actions.iter().filter_map(Value::as_str) {
                if action != "get" {
                    writeln!(self.out, "{}", self.palette.cyan(action))?;
                }
            }
        }
        Ok(())
    }

    pub fn invoke(&mut self, line: &str) -> ShellResult<()> {
        let (path, args) = match line.split_once(char::is_whitespace) {
            Some((path, args)) => (path, args.trim()),
            None => (line, ""),
        };
        let params = if args.is_empty() {
            Params::new()
        } else {
            match serde_json::from_str::<Value>(args) {
                Ok(Value::Object(params)) => params,
                Ok(_) => {
                    writeln!(self.out, "{}", self.palette.red("Argument must be a JSON object"))?;
                    return Ok(());
                }
                Err(e) => {
                    writeln!(self.out, "{}", self.palette.red(&format!("Error decoding JSON: {}", e)))?;
                    return Ok(());
                }
            }
        };

        let mut target = resolve_path(&self.path.borrow(), path);
        let action = match target.pop() {
            Some(action) if !action.is_empty() => action,
            _ => "get".to_string(),
        };

        let palette = self.palette;
        let out = &mut self.out;
        let response = self
            .client
            .borrow_mut()
            .call(&action, &target, params, |signal| {
                let mut fields = signal.clone();
                let name = fields
                    .as_object_mut()
                    .and_then(|f| f.remove("signal"))
                    .unwrap_or_default();
                if let Err(e) = writeln!(out, "{}", palette.cyan(&format!("{}: {}", name, fields))) {
                    warn!(error = %e, "Failed to print signal");
                }
            })?;

        if is_success(&response) {
            let mut body = response;
            if let Some(map) = body.as_object_mut() {
                map.remove("result");
                if !map.is_empty() {
                    writeln!(self.out, "{}", self.palette.yellow(&body.to_string()))?;
                }
            }
        } else {
            self.print_error(&response)?;
        }
        Ok(())
    }

    /// Runs one input line. Returns `false` when the shell should exit.
    pub fn execute(&mut self, line: &str) -> ShellResult<bool> {
        let line = line.trim();
        match line {
            "quit" | "exit" => return Ok(false),
            "" | "ls" => self.ls()?,
            "cd" => self.cd("")?,
            _ => match line.strip_prefix("cd ") {
                Some(args) => self.cd(args.trim())?,
                None => self.invoke(line)?,
            },
        }
        Ok(true)
    }

    pub fn run(&mut self) -> ShellResult<()> {
        let mut editor = self.editor()?;
        self.cd("")?;
        loop {
            let prompt = self.prompt();
            match editor.readline(&prompt) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        if let Err(e) = editor.add_history_entry(line.trim()) {
                            debug!(error = %e, "history entry not added");
                        }
                    }
                    if !self.execute(&line)? {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(history) = &self.history_file {
            if let Err(e) = editor.save_history(history) {
                warn!(error = %e, "Failed to save shell history");
            }
        }
        Ok(())
    }
}

/// Runs the shell against an in-process server until the user quits.
///
/// Ctrl-C while an action is running sends a `cancel` signal.
pub async fn run_shell(backend: Arc<dyn DeviceBackend>, config: KeyrpcConfig) -> ShellResult<()> {
    let shell_config = config.shell.clone();
    let (client, server) = spawn_server(backend, config);

    let cancel_lines = client.lines.clone();
    let interrupts = tokio::spawn(async move {
        let cancel = json!({ "signal": CANCEL_SIGNAL }).to_string();
        while tokio::signal::ctrl_c().await.is_ok() {
            if cancel_lines.send(cancel.clone()).await.is_err() {
                break;
            }
        }
    });

    println!("Shell starting...");
    let result = tokio::task::spawn_blocking(move || {
        let mut shell = Shell::new(client, &shell_config);
        shell.run()
    })
    .await
    .map_err(std::io::Error::other)?;

    interrupts.abort();
    if let Err(e) = interrupts.await {
        if !e.is_cancelled() {
            warn!(error = %e, "Interrupt handler failed");
        }
    }
    println!("Stopping...");
    server.await.map_err(std::io::Error::other)??;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::{MemoryBackend, SimulatedDevice};

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_resolve_path() {
        let cwd = path(&["usb", "123"]);
        assert_eq!(resolve_path(&cwd, ""), path(&["usb", "123", ""]));
        assert_eq!(resolve_path(&cwd, "ccid"), path(&["usb", "123", "ccid"]));
        assert_eq!(resolve_path(&cwd, "/nfc"), path(&["nfc"]));
        assert_eq!(resolve_path(&cwd, "../456/"), path(&["usb", "456", ""]));
        assert_eq!(resolve_path(&cwd, "../../.."), path(&[]));
        assert_eq!(resolve_path(&[], "/"), path(&[""]));
    }

    #[test]
    fn test_palette() {
        assert_eq!(Palette::new(false).red("x"), "x");
        assert_eq!(Palette::new(true).green("ok"), "\u{1b}[32;1mok\u{1b}[0m");
    }

    const ALICE_URI: &str =
        "otpauth://totp/Example:alice@example.com?secret=GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ&digits=8";

    #[derive(Clone, Default)]
    struct Captured(Rc<RefCell<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn take(&self) -> String {
            String::from_utf8(std::mem::take(&mut *self.0.borrow_mut())).unwrap()
        }
    }

    #[derive(Debug)]
    struct Step {
        keep_going: bool,
        prompt: String,
        output: String,
    }

    /// Feeds `lines` to an uncolored shell over a simulated key, recording
    /// what each line printed and the prompt it left behind.
    async fn run_lines(lines: Vec<String>) -> Vec<Step> {
        let backend = Arc::new(MemoryBackend::from_devices(&[SimulatedDevice::default()]).unwrap());
        let (client, server) = spawn_server(backend, KeyrpcConfig::default());
        let config = ShellConfig {
            color: false,
            history_file: None,
        };

        let steps = tokio::task::spawn_blocking(move || {
            let captured = Captured::default();
            let mut shell = Shell::with_output(client, &config, Box::new(captured.clone()));
            lines
                .iter()
                .map(|line| {
                    let keep_going = shell.execute(line).unwrap();
                    Step {
                        keep_going,
                        prompt: shell.prompt(),
                        output: captured.take(),
                    }
                })
                .collect()
        })
        .await
        .unwrap();

        server.await.unwrap().unwrap();
        steps
    }

    fn lines(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cd_moves_between_nodes() {
        let steps = run_lines(lines(&["cd ..", "cd usb/12345678", "cd nope", "cd ../..", "cd /nfc", "cd"])).await;

        assert_eq!(steps[0].prompt, "/> ");
        assert_eq!(steps[0].output, "");
        assert_eq!(steps[1].prompt, "/usb/12345678> ");
        assert_eq!(steps[2].prompt, "/usb/12345678> ");
        assert_eq!(steps[2].output, "invalid-command: No such node: nope\n");
        assert_eq!(steps[3].prompt, "/> ");
        assert_eq!(steps[4].prompt, "/nfc> ");
        assert_eq!(steps[5].prompt, "/> ");
        assert!(steps.iter().all(|s| s.keep_going));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ls_shows_children_and_actions() {
        let steps = run_lines(vec![
            "ls".to_string(),
            "cd usb/12345678/ccid/oath/accounts".to_string(),
            format!("put_uri {{\"uri\": \"{}\"}}", ALICE_URI),
            String::new(),
        ])
        .await;

        let root: Vec<&str> = steps[0].output.lines().collect();
        assert!(root.contains(&format!("version: \"{}\"", crate::VERSION).as_str()));
        assert!(root.contains(&"usb/"));
        assert!(root.contains(&"nfc/"));
        assert!(root.contains(&"diagnose"));
        assert!(!root.contains(&"get"));

        assert!(steps[2].output.contains("\"issuer\":\"Example\""));

        let accounts: Vec<&str> = steps[3].output.lines().collect();
        assert!(accounts.contains(&"Example:alice@example.com/"));
        assert!(accounts.contains(&"  issuer: \"Example\""));
        assert!(accounts.contains(&"put_uri"));
        assert!(!accounts.contains(&"get"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invoke_passes_json_params() {
        let accounts = "usb/12345678/ccid/oath/accounts";
        let steps = run_lines(vec![
            format!("{}/put_uri {{\"uri\": \"{}\"}}", accounts, ALICE_URI),
            format!("{}/Example:alice@example.com/code {{\"timestamp\": 59}}", accounts),
        ])
        .await;

        let code: Value = serde_json::from_str(steps[1].output.trim()).unwrap();
        assert_eq!(code["value"], "94287082");
        assert_eq!(code["valid_to"], 60);
        assert_eq!(steps[1].prompt, "/> ");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_responses_are_printed() {
        let steps = run_lines(lines(&[
            "usb/12345678/ccid/oath/derive {}",
            "usb/12345678/ccid/oath/derive [1]",
            "usb/12345678/ccid/oath/derive {oops",
            "usb/12345678/nope/get",
            "exit",
        ]))
        .await;

        assert_eq!(
            steps[0].output,
            "invalid-params: Invalid parameters: missing parameter 'password'\n"
        );
        assert_eq!(steps[1].output, "Argument must be a JSON object\n");
        assert!(steps[2].output.starts_with("Error decoding JSON: "));
        assert_eq!(steps[3].output, "invalid-command: No such node: nope\n");
        assert!(steps[..4].iter().all(|s| s.keep_going));
        assert!(!steps[4].keep_going);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_talks_to_in_process_server() {
        let backend = Arc::new(MemoryBackend::from_devices(&[SimulatedDevice::default()]).unwrap());
        let (client, server) = spawn_server(backend, KeyrpcConfig::default());

        let (root, device) = tokio::task::spawn_blocking(move || {
            let mut client = client;
            let root = client.get(&[]).unwrap();
            let device = client.get(&path(&["usb", "12345678"])).unwrap();
            (root, device)
        })
        .await
        .unwrap();

        assert_eq!(root["result"], "success");
        assert_eq!(root["children"], json!({"usb": {}, "nfc": {}}));
        assert_eq!(device["data"]["name"], "YubiKey 5 NFC");
        assert_eq!(device["data"]["info"]["serial"], 12345678);

        server.await.unwrap().unwrap();
    }
}
