//! Client-side negotiation.
//!
//! The client connects to the well-known control port, declares how many
//! sockets each of its tunnels should carry, reads back the assigned
//! transfer ports, connects to every one of them in order, and partitions
//! the connections into tunnels with the same counts it declared —
//! mirroring the server's partitioning deterministically.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpStream;

use culvert_core::{
    Message, NegotiateError, ProcedureError, RegistryBuilder, read_message, write_message,
};

use crate::config::ClientConfig;
use crate::endpoint::Connection;
use crate::tunnel::partition_into_tunnels;

/// A client endpoint not yet connected. Register procedures with
/// [`subscribe`](Self::subscribe), then [`connect`](Self::connect).
pub struct Client {
    config: ClientConfig,
    registry: RegistryBuilder,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config, registry: RegistryBuilder::new() }
    }

    /// Register a procedure. Must happen before [`connect`](Self::connect);
    /// the table is sealed by negotiation.
    pub fn subscribe<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Bytes) -> Result<Bytes, ProcedureError> + Send + Sync + 'static,
    {
        self.registry.subscribe(name, handler);
    }

    /// Negotiate with the server. Blocks until every transfer connection
    /// is established, then returns the live [`Connection`] with its
    /// receive loops already running.
    pub async fn connect(self) -> Result<Connection, NegotiateError> {
        let control_addr = SocketAddr::new(self.config.server_addr, self.config.control_port);
        let control = TcpStream::connect(control_addr).await.map_err(|source| {
            NegotiateError::Connect { port: self.config.control_port, source }
        })?;
        tracing::info!(%control_addr, "control connection established");
        let (mut control_rd, mut control_wr) = control.into_split();

        let socket_counts = self.config.socket_counts.clone();
        let declared: usize = socket_counts.iter().map(|c| *c as usize).sum();
        write_message(&mut control_wr, &Message::Init { socket_counts: socket_counts.clone() })
            .await?;

        let msg = read_message(&mut control_rd).await?;
        let Message::Accept { ports } = msg else {
            return Err(NegotiateError::Protocol { expected: "Accept", got: msg.kind() });
        };
        if ports.len() != declared {
            return Err(NegotiateError::PortCountMismatch {
                declared,
                assigned: ports.len(),
            });
        }
        tracing::debug!(?ports, "transfer ports assigned");

        let mut streams = Vec::with_capacity(ports.len());
        for port in &ports {
            let addr = SocketAddr::new(self.config.server_addr, *port);
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| NegotiateError::Connect { port: *port, source })?;
            stream.set_nodelay(true).ok();
            streams.push(stream);
        }
        tracing::info!(sockets = streams.len(), "all transfer connections established");

        let tunnels = partition_into_tunnels(streams, &socket_counts);
        Ok(Connection::spawn(self.registry.build(), tunnels))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("config", &self.config).finish_non_exhaustive()
    }
}
