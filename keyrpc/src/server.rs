//! The request processing loop.
//!
//! Three tasks cooperate:
//!
//! - the reader parses incoming lines, handles `cancel` and queues commands,
//! - the handler (the caller's task) runs one command at a time against the tree,
//! - the writer serializes every outgoing message as one line.

use crate::config::KeyrpcConfig;
use crate::nodes::RootNode;
use device::DeviceBackend;
use protocol::prelude::*;
use protocol::{write_message, CancellationToken, MessageReader};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

struct Queued {
    command: Command,
    cancel: CancellationToken,
    done: oneshot::Sender<()>,
}

async fn read_incoming<R>(
    reader: R,
    commands: mpsc::Sender<Queued>,
    out: mpsc::UnboundedSender<Outgoing>,
) where
    R: AsyncRead + Unpin,
{
    let mut messages = MessageReader::new(reader);
    let mut cancel = CancellationToken::new();
    let mut running: Option<oneshot::Receiver<()>> = None;

    loop {
        let message = match messages.next_message().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Error reading input");
                break;
            }
        };

        match message {
            Ok(Incoming::Signal(name)) if name == CANCEL_SIGNAL => {
                debug!("cancel requested");
                cancel.cancel();
            }
            Ok(Incoming::Signal(name)) => {
                error!(signal = %name, "Unhandled signal");
            }
            Ok(Incoming::Command(command)) => {
                if let Some(previous) = running.take() {
                    if previous.await.is_err() {
                        debug!("previous command ended without reporting");
                    }
                }
                cancel = CancellationToken::new();
                let (done, finished) = oneshot::channel();
                let queued = Queued {
                    command,
                    cancel: cancel.clone(),
                    done,
                };
                if commands.send(queued).await.is_err() {
                    warn!("command handler stopped, dropping input");
                    break;
                }
                running = Some(finished);
            }
            Err(e) => {
                error!(error = %e, "Returning error");
                if out.send(Outgoing::error(&e)).is_err() {
                    warn!("writer stopped, error dropped");
                    break;
                }
            }
        }
    }

    cancel.cancel();
}

async fn write_outgoing<W>(mut writer: W, mut out: mpsc::UnboundedReceiver<Outgoing>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = out.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            error!(error = %e, "Error writing output");
            break;
        }
    }
}

/// Serves commands from `reader` until end of input, writing responses
/// and signals to `writer`.
pub async fn process<R, W>(reader: R, writer: W, root: &mut NodeHost) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Queued>(1);

    let writer_task = tokio::spawn(write_outgoing(writer, out_rx));
    let reader_task = tokio::spawn(read_incoming(reader, cmd_tx, out_tx.clone()));

    while let Some(Queued {
        command,
        cancel,
        done,
    }) = cmd_rx.recv().await
    {
        debug!(action = %command.action, target = ?command.target, "handling command");
        let ctx = CallContext::new(cancel, SignalSink::new(out_tx.clone()));
        let mut traversed = Vec::new();
        let result = root
            .call(
                &command.action,
                &command.target,
                command.params,
                &ctx,
                &mut traversed,
            )
            .await;

        let response = match result {
            Ok(body) => Outgoing::success(body),
            Err(e) => {
                error!(status = e.status(), error = %e, "Returning error");
                Outgoing::error(&e)
            }
        };
        if out_tx.send(response).is_err() {
            warn!("writer stopped, response dropped");
        }
        if done.send(()).is_err() {
            debug!("reader stopped before command finished");
        }
    }

    reader_task.await.map_err(io::Error::other)?;
    drop(out_tx);
    writer_task.await.map_err(io::Error::other)?;
    Ok(())
}

/// Runs the RPC server for `backend` until `reader` reaches end of input,
/// then closes every open node.
pub async fn run_rpc<R, W>(
    reader: R,
    writer: W,
    backend: Arc<dyn DeviceBackend>,
    config: &KeyrpcConfig,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!(backend = backend.name(), "starting RPC server");
    let mut root = NodeHost::new(Box::new(RootNode::new(backend, &config.server)));
    let result = process(reader, writer, &mut root).await;
    root.close().await;
    info!("RPC server stopped");
    result
}
