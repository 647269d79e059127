//! The node tree that RPC commands are dispatched through.
//!
//! A [`Node`] holds the domain logic for one location in the tree. A
//! [`NodeHost`] wraps it and owns at most one open child at a time. Opening
//! a different child closes the previous one, so device sessions are never
//! held by more than one branch.

use crate::error::{RpcError, RpcResult};
use crate::types::{Body, Outgoing, Params};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub const GET: &str = "get";

pub type Children = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSpec {
    pub name: &'static str,
    /// Invoking the action closes the node's open child first.
    pub closes_child: bool,
}

impl ActionSpec {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            closes_child: true,
        }
    }

    pub const fn keep_child(name: &'static str) -> Self {
        Self {
            name,
            closes_child: false,
        }
    }
}

/// Emits progress signals for the command being processed.
#[derive(Debug, Clone, Default)]
pub struct SignalSink {
    tx: Option<mpsc::UnboundedSender<Outgoing>>,
}

impl SignalSink {
    pub fn new(tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, name: &str, fields: Body) {
        if let Some(tx) = &self.tx {
            if tx.send(Outgoing::signal(name, fields)).is_err() {
                debug!(signal = name, "signal dropped, writer is gone");
            }
        }
    }
}

/// Per-command state handed to every action.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub cancel: CancellationToken,
    pub signals: SignalSink,
}

impl CallContext {
    pub fn new(cancel: CancellationToken, signals: SignalSink) -> Self {
        Self { cancel, signals }
    }

    /// A context with a fresh token whose signals go nowhere.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), SignalSink::discard())
    }

    pub fn signal(&self, name: &str, fields: Body) {
        self.signals.send(name, fields);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> RpcResult<()> {
        if self.is_cancelled() {
            Err(RpcError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
pub trait Node: Send {
    async fn data(&mut self) -> RpcResult<Body> {
        Ok(Body::new())
    }

    /// Actions currently available on this node. `get` is added by the host.
    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(Vec::new())
    }

    async fn children(&mut self) -> RpcResult<Children> {
        Ok(Children::new())
    }

    async fn invoke(&mut self, action: &str, _params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        Err(RpcError::NoSuchAction(action.to_string()))
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        Err(RpcError::NoSuchNode(name.to_string()))
    }

    async fn close(&mut self) -> RpcResult<()> {
        Ok(())
    }

    /// Runs before every call routed through this node.
    fn enter(&mut self) {}

    /// Runs after every call routed through this node, on success or error.
    fn exit(&mut self) {}

    /// Connection loss below a device boundary forgets the open child
    /// and is reported as [`RpcError::NoSuchNode`].
    fn device_boundary(&self) -> bool {
        false
    }
}

struct OpenChild {
    name: String,
    host: Box<NodeHost>,
}

pub struct NodeHost {
    node: Box<dyn Node>,
    child: Option<OpenChild>,
}

impl NodeHost {
    pub fn new(node: Box<dyn Node>) -> Self {
        Self { node, child: None }
    }

    pub fn child_name(&self) -> Option<&str> {
        self.child.as_ref().map(|c| c.name.as_str())
    }

    pub fn child(&self) -> Option<&NodeHost> {
        self.child.as_ref().map(|c| c.host.as_ref())
    }

    /// Dispatches `action` to the node at `target` below this one.
    ///
    /// `traversed` collects the path walked so far and ends up in the body
    /// of any [`RpcError::StateReset`].
    pub fn call<'a>(
        &'a mut self,
        action: &'a str,
        target: &'a [String],
        params: Params,
        ctx: &'a CallContext,
        traversed: &'a mut Vec<String>,
    ) -> BoxFuture<'a, RpcResult<Body>> {
        Box::pin(async move {
            self.node.enter();
            let result = self.dispatch(action, target, params, ctx, traversed).await;
            self.node.exit();

            match result {
                Err(RpcError::ChildReset(message)) => {
                    self.close_child().await;
                    Err(RpcError::state_reset(message, traversed.clone()))
                }
                Err(RpcError::ConnectionLost(reason)) if self.node.device_boundary() => {
                    error!(%reason, "Device error");
                    let name = self.child.take().map(|c| c.name).unwrap_or_default();
                    Err(RpcError::NoSuchNode(name))
                }
                other => other,
            }
        })
    }

    async fn dispatch(
        &mut self,
        action: &str,
        target: &[String],
        params: Params,
        ctx: &CallContext,
        traversed: &mut Vec<String>,
    ) -> RpcResult<Body> {
        if let Some((head, rest)) = target.split_first() {
            traversed.push(head.clone());
            let child = self.open_child(head).await?;
            return child.call(action, rest, params, ctx, traversed).await;
        }

        let actions = self.list_actions().await?;
        if let Some(spec) = actions.iter().find(|spec| spec.name == action).copied() {
            if spec.closes_child {
                self.close_child().await;
            }
            if spec.name == GET {
                return self.describe(actions).await;
            }
            return self.node.invoke(action, params, ctx).await;
        }

        if self.node.children().await?.contains_key(action) {
            traversed.push(action.to_string());
            let child = self.open_child(action).await?;
            return child.call(GET, &[], Params::new(), ctx, traversed).await;
        }

        Err(RpcError::NoSuchAction(action.to_string()))
    }

    async fn list_actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        let mut actions = vec![ActionSpec::new(GET)];
        actions.extend(self.node.actions().await?);
        actions.sort_by_key(|spec| spec.name);
        actions.dedup_by_key(|spec| spec.name);
        Ok(actions)
    }

    async fn describe(&mut self, actions: Vec<ActionSpec>) -> RpcResult<Body> {
        let data = self.node.data().await?;
        let children = self.node.children().await?;

        let mut body = Body::new();
        body.insert("data".to_string(), Value::Object(data));
        body.insert(
            "actions".to_string(),
            Value::Array(actions.iter().map(|spec| Value::from(spec.name)).collect()),
        );
        body.insert("children".to_string(), Value::Object(children));
        Ok(body)
    }

    async fn open_child(&mut self, name: &str) -> RpcResult<&mut NodeHost> {
        if self.child.as_ref().is_some_and(|c| c.name != name) {
            self.close_child().await;
        }

        if self.child.is_none() {
            let node = self.node.create_child(name).await?;
            debug!(child = name, "created child");
            self.child = Some(OpenChild {
                name: name.to_string(),
                host: Box::new(NodeHost::new(node)),
            });
        }

        self.child
            .as_mut()
            .map(|c| c.host.as_mut())
            .ok_or_else(|| RpcError::NoSuchNode(name.to_string()))
    }

    async fn close_child(&mut self) {
        if let Some(OpenChild { name, mut host }) = self.child.take() {
            debug!(child = %name, "close existing child");
            host.close().await;
        }
    }

    /// Closes the open subtree, then the node itself. Errors are logged.
    pub fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.close_child().await;
            if let Err(e) = self.node.close().await {
                error!(error = %e, "Error closing node");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct TestNode {
        name: String,
        depth: usize,
        log: Log,
        boundary: bool,
    }

    impl TestNode {
        fn root(log: &Log) -> Box<dyn Node> {
            Box::new(TestNode {
                name: "root".to_string(),
                depth: 0,
                log: log.clone(),
                boundary: false,
            })
        }
    }

    #[async_trait]
    impl Node for TestNode {
        async fn data(&mut self) -> RpcResult<Body> {
            Ok(json!({ "name": self.name }).as_object().cloned().unwrap_or_default())
        }

        async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
            Ok(vec![
                ActionSpec::new("ping"),
                ActionSpec::keep_child("peek"),
                ActionSpec::new("reset"),
                ActionSpec::new("unplug"),
            ])
        }

        async fn children(&mut self) -> RpcResult<Children> {
            let mut children = Children::new();
            if self.depth < 2 {
                children.insert("a".to_string(), json!({}));
                children.insert("b".to_string(), json!({}));
            }
            Ok(children)
        }

        async fn invoke(&mut self, action: &str, params: Params, _ctx: &CallContext) -> RpcResult<Body> {
            match action {
                "ping" | "peek" => Ok(params),
                "reset" => Err(RpcError::ChildReset(String::new())),
                "unplug" => Err(RpcError::ConnectionLost("removed".to_string())),
                other => Err(RpcError::NoSuchAction(other.to_string())),
            }
        }

        async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
            if self.depth >= 2 || !(name == "a" || name == "b") {
                return Err(RpcError::NoSuchNode(name.to_string()));
            }
            Ok(Box::new(TestNode {
                name: format!("{}/{}", self.name, name),
                depth: self.depth + 1,
                log: self.log.clone(),
                boundary: name == "b",
            }))
        }

        async fn close(&mut self) -> RpcResult<()> {
            self.log.lock().unwrap().push(format!("close {}", self.name));
            Ok(())
        }

        fn device_boundary(&self) -> bool {
            self.boundary
        }
    }

    async fn call(host: &mut NodeHost, action: &str, target: &[&str]) -> RpcResult<Body> {
        let target: Vec<String> = target.iter().map(|s| s.to_string()).collect();
        let ctx = CallContext::detached();
        let mut traversed = Vec::new();
        host.call(action, &target, Params::new(), &ctx, &mut traversed)
            .await
    }

    #[tokio::test]
    async fn test_get_lists_data_actions_and_children() {
        let log = Log::default();
        let mut host = NodeHost::new(TestNode::root(&log));
        let body = call(&mut host, GET, &[]).await.unwrap();

        assert_eq!(body["data"]["name"], "root");
        assert_eq!(body["actions"], json!(["get", "peek", "ping", "reset", "unplug"]));
        assert_eq!(body["children"], json!({"a": {}, "b": {}}));
    }

    #[tokio::test]
    async fn test_target_opens_child_and_child_name_as_action_gets_it() {
        let log = Log::default();
        let mut host = NodeHost::new(TestNode::root(&log));

        let body = call(&mut host, "ping", &["a"]).await.unwrap();
        assert!(body.is_empty());
        assert_eq!(host.child_name(), Some("a"));

        let body = call(&mut host, "b", &[]).await.unwrap();
        assert_eq!(body["data"]["name"], "root/b");
        assert_eq!(host.child_name(), Some("b"));
        assert_eq!(log.lock().unwrap().as_slice(), ["close root/a"]);
    }

    #[tokio::test]
    async fn test_closes_child_flag() {
        let log = Log::default();
        let mut host = NodeHost::new(TestNode::root(&log));
        call(&mut host, GET, &["a", "b"]).await.unwrap();

        call(&mut host, "peek", &[]).await.unwrap();
        assert_eq!(host.child_name(), Some("a"));
        assert!(log.lock().unwrap().is_empty());

        call(&mut host, "ping", &[]).await.unwrap();
        assert_eq!(host.child_name(), None);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["close root/a/b", "close root/a"]
        );
    }

    #[tokio::test]
    async fn test_unknown_action_and_node() {
        let log = Log::default();
        let mut host = NodeHost::new(TestNode::root(&log));

        let err = call(&mut host, "frob", &[]).await.unwrap_err();
        assert_eq!(err, RpcError::NoSuchAction("frob".to_string()));

        let err = call(&mut host, GET, &["zzz"]).await.unwrap_err();
        assert_eq!(err, RpcError::NoSuchNode("zzz".to_string()));
    }

    #[tokio::test]
    async fn test_child_reset_becomes_state_reset_with_path() {
        let log = Log::default();
        let mut host = NodeHost::new(TestNode::root(&log));
        call(&mut host, GET, &["a", "a"]).await.unwrap();

        let err = call(&mut host, "reset", &["a"]).await.unwrap_err();
        assert_eq!(
            err,
            RpcError::StateReset {
                message: "State reset in node".to_string(),
                path: vec!["a".to_string()],
            }
        );
        let a = host.child().unwrap();
        assert_eq!(a.child_name(), None);
    }

    #[tokio::test]
    async fn test_device_boundary_forgets_child() {
        let log = Log::default();
        let mut host = NodeHost::new(TestNode::root(&log));
        call(&mut host, GET, &["b", "a"]).await.unwrap();

        let err = call(&mut host, "unplug", &["b", "a"]).await.unwrap_err();
        assert_eq!(err, RpcError::NoSuchNode("a".to_string()));
        assert_eq!(host.child().unwrap().child_name(), None);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connection_lost_outside_boundary_passes_through() {
        let log = Log::default();
        let mut host = NodeHost::new(TestNode::root(&log));
        let err = call(&mut host, "unplug", &["a"]).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_close_walks_subtree() {
        let log = Log::default();
        let mut host = NodeHost::new(TestNode::root(&log));
        call(&mut host, GET, &["a", "b"]).await.unwrap();
        host.close().await;
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["close root/a/b", "close root/a", "close root"]
        );
    }
}
