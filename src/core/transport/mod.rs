// src/core/transport/mod.rs

//! The transport abstraction: register a named handler, send a request to a
//! node and await its response. The rest of this crate depends on it only
//! through a narrow trait so tests can substitute an in-process double
//! instead of opening real sockets.

use crate::core::cluster::state::NodeId;
use crate::core::errors::CoreError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// A registered action handler. `force_execution` marks a handler (the
/// replica-apply handler, notably) that should never be rejected for
/// thread-pool saturation; no `Transport` impl in this crate currently
/// reads the flag back to change how it dispatches, so today it is
/// metadata only, available for a transport to act on.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: Bytes) -> Result<Bytes, CoreError>;

    fn force_execution(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_node(&self) -> NodeId;

    fn register_handler(&self, action: &str, handler: Arc<dyn Handler>);

    async fn send_request(
        &self,
        node: &NodeId,
        action: &str,
        payload: Bytes,
    ) -> Result<Bytes, CoreError>;
}

/// An in-process mesh of nodes, each with its own handler table. Used by
/// every scenario test in place of a real network: `handle_for(node)`
/// returns a `Transport` impl scoped to that node's identity.
#[derive(Default)]
pub struct LocalMesh {
    nodes: DashMap<NodeId, Arc<DashMap<String, Arc<dyn Handler>>>>,
    /// Node ids present in the mesh but unreachable, simulating a transport
    /// disconnect without removing the node from cluster state.
    partitioned: DashMap<NodeId, ()>,
}

impl LocalMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handle_for(self: &Arc<Self>, node: impl Into<String>) -> LocalTransport {
        let node = node.into();
        self.nodes.entry(node.clone()).or_insert_with(|| Arc::new(DashMap::new()));
        LocalTransport {
            mesh: self.clone(),
            local_node: node,
        }
    }

    pub fn partition(&self, node: impl Into<String>) {
        self.partitioned.insert(node.into(), ());
    }

    pub fn heal(&self, node: &str) {
        self.partitioned.remove(node);
    }
}

/// A single node's view into a `LocalMesh`.
pub struct LocalTransport {
    mesh: Arc<LocalMesh>,
    local_node: NodeId,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.local_node.clone()
    }

    fn register_handler(&self, action: &str, handler: Arc<dyn Handler>) {
        let table = self
            .mesh
            .nodes
            .entry(self.local_node.clone())
            .or_insert_with(|| Arc::new(DashMap::new()));
        table.insert(action.to_string(), handler);
    }

    async fn send_request(
        &self,
        node: &NodeId,
        action: &str,
        payload: Bytes,
    ) -> Result<Bytes, CoreError> {
        if self.mesh.partitioned.contains_key(node) || self.mesh.partitioned.contains_key(&self.local_node) {
            return Err(CoreError::TransportDisconnected(format!(
                "{node} unreachable from {}",
                self.local_node
            )));
        }
        let Some(table) = self.mesh.nodes.get(node) else {
            return Err(CoreError::NodeClosed(node.clone()));
        };
        let Some(handler) = table.get(action).map(|h| h.clone()) else {
            return Err(CoreError::TransportDisconnected(format!(
                "no handler for action {action} on {node}"
            )));
        };
        handler.handle(payload).await
    }
}

/// A length-prefixed TCP transport, sketched as the production
/// implementation. Not exercised by any test: the coordination logic only
/// ever depends on the `Transport` trait.
pub struct TcpTransport {
    local_node: NodeId,
    peers: DashMap<NodeId, std::net::SocketAddr>,
    handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
}

impl TcpTransport {
    pub fn new(local_node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            peers: DashMap::new(),
            handlers: Arc::new(DashMap::new()),
        })
    }

    pub fn add_peer(&self, node: NodeId, addr: std::net::SocketAddr) {
        self.peers.insert(node, addr);
    }

    /// Accepts connections on `addr`, reading one length-prefixed
    /// `(action, payload)` frame per connection and dispatching it to a
    /// registered handler before writing back the length-prefixed response.
    pub async fn listen(self: &Arc<Self>, addr: std::net::SocketAddr) -> Result<(), CoreError> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::serve_connection(stream, handlers).await {
                    warn!(%peer_addr, error = %e, "transport connection ended with error");
                }
            });
        }
    }

    async fn serve_connection(
        mut stream: TcpStream,
        handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
    ) -> Result<(), CoreError> {
        use tokio::io::AsyncWriteExt;
        let action = read_frame(&mut stream).await?;
        let action = String::from_utf8_lossy(&action).to_string();
        let payload = read_frame(&mut stream).await?;
        let response = match handlers.get(&action) {
            Some(handler) => handler.handle(payload).await,
            None => Err(CoreError::TransportDisconnected(format!(
                "no handler for action {action}"
            ))),
        };
        let (ok, body) = match response {
            Ok(body) => (1u8, body),
            Err(e) => (0u8, Bytes::from(e.to_string())),
        };
        stream.write_u8(ok).await?;
        write_frame(&mut stream, &body).await?;
        Ok(())
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Bytes, CoreError> {
    use tokio::io::AsyncReadExt;
    let len = stream.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<(), CoreError> {
    use tokio::io::AsyncWriteExt;
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(body).await?;
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_node(&self) -> NodeId {
        self.local_node.clone()
    }

    fn register_handler(&self, action: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert(action.to_string(), handler);
    }

    async fn send_request(
        &self,
        node: &NodeId,
        action: &str,
        payload: Bytes,
    ) -> Result<Bytes, CoreError> {
        use tokio::io::AsyncReadExt;
        let addr = *self
            .peers
            .get(node)
            .ok_or_else(|| CoreError::NodeClosed(node.clone()))?;
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, action.as_bytes()).await?;
        write_frame(&mut stream, &payload).await?;
        let ok = stream.read_u8().await?;
        let body = read_frame(&mut stream).await?;
        if ok == 1 {
            Ok(body)
        } else {
            Err(CoreError::TransportDisconnected(
                String::from_utf8_lossy(&body).to_string(),
            ))
        }
    }
}

/// Wraps a closure as a `Handler`, for the common case of a one-shot
/// decode/apply/encode handler that doesn't need its own struct.
pub struct BoxedHandler {
    f: Arc<
        dyn Fn(Bytes) -> futures::future::BoxFuture<'static, Result<Bytes, CoreError>>
            + Send
            + Sync,
    >,
    force_execution: bool,
}

impl BoxedHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Bytes, CoreError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |payload| Box::pin(f(payload))),
            force_execution: false,
        }
    }

    pub fn force_execution(mut self) -> Self {
        self.force_execution = true;
        self
    }
}

#[async_trait]
impl Handler for BoxedHandler {
    async fn handle(&self, payload: Bytes) -> Result<Bytes, CoreError> {
        debug!("dispatching transport handler");
        (self.f)(payload).await
    }

    fn force_execution(&self) -> bool {
        self.force_execution
    }
}
