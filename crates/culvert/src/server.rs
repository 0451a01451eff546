//! Server-side negotiation.
//!
//! The server owns the well-known control port. Negotiation is one shot:
//! accept a control connection, read the peer's `Init` declaring per-tunnel
//! socket counts, open one fresh listening port per requested socket
//! (scanning upward from the transfer port base), answer `Accept` with the
//! ports in allocation order, then collect exactly one connection per port
//! and partition them back into tunnels using the declared counts.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpListener;

use culvert_core::{
    Message, NegotiateError, ProcedureError, RegistryBuilder, read_message, write_message,
};

use crate::config::ServerConfig;
use crate::endpoint::Connection;
use crate::tunnel::partition_into_tunnels;

/// A server endpoint waiting for its peer. Register procedures with
/// [`subscribe`](Self::subscribe), then [`accept`](Self::accept) one
/// control connection to negotiate.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    registry: RegistryBuilder,
}

impl Server {
    /// Bind the control listener. Failure here (port taken, no permission)
    /// is fatal to endpoint startup.
    pub async fn bind(config: ServerConfig) -> Result<Self, NegotiateError> {
        let addr = SocketAddr::new(config.bind_addr, config.control_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NegotiateError::Bind { port: config.control_port, source })?;
        tracing::info!(%addr, "control listener ready");
        Ok(Self { config, listener, registry: RegistryBuilder::new() })
    }

    /// The bound control address. Useful when the config asked for port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Register a procedure. Must happen before [`accept`](Self::accept);
    /// the table is sealed by negotiation.
    pub fn subscribe<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Bytes) -> Result<Bytes, ProcedureError> + Send + Sync + 'static,
    {
        self.registry.subscribe(name, handler);
    }

    /// Accept one peer and negotiate. Blocks until the full tunnel
    /// topology is established, then returns the live [`Connection`] with
    /// its receive loops already running.
    pub async fn accept(self) -> Result<Connection, NegotiateError> {
        let (control, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| NegotiateError::Transport(e.into()))?;
        tracing::info!(%peer, "control connection accepted");
        let (mut control_rd, mut control_wr) = control.into_split();

        let msg = read_message(&mut control_rd).await?;
        let Message::Init { socket_counts } = msg else {
            return Err(NegotiateError::Protocol { expected: "Init", got: msg.kind() });
        };
        let total: usize = socket_counts.iter().map(|c| *c as usize).sum();
        tracing::debug!(tunnels = socket_counts.len(), sockets = total, "negotiating");

        let (listeners, ports) = self.open_transfer_ports(total).await?;
        write_message(&mut control_wr, &Message::Accept { ports }).await?;

        let mut streams = Vec::with_capacity(total);
        for listener in &listeners {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| NegotiateError::Transport(e.into()))?;
            stream.set_nodelay(true).ok();
            streams.push(stream);
        }
        tracing::info!(sockets = streams.len(), "all transfer connections accepted");

        let tunnels = partition_into_tunnels(streams, &socket_counts);
        Ok(Connection::spawn(self.registry.build(), tunnels))
    }

    /// Bind `total` fresh listeners, scanning sequentially upward from
    /// just above the transfer port base. Ports already in use are
    /// skipped; any other bind failure is fatal.
    async fn open_transfer_ports(
        &self,
        total: usize,
    ) -> Result<(Vec<TcpListener>, Vec<u16>), NegotiateError> {
        let mut listeners = Vec::with_capacity(total);
        let mut ports = Vec::with_capacity(total);
        let mut port = self.config.transfer_port_base;
        while listeners.len() < total {
            port = port.checked_add(1).ok_or_else(|| NegotiateError::Bind {
                port: u16::MAX,
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "transfer port space exhausted",
                ),
            })?;
            match TcpListener::bind(SocketAddr::new(self.config.bind_addr, port)).await {
                Ok(listener) => {
                    tracing::debug!(port, "transfer port open");
                    listeners.push(listener);
                    ports.push(port);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(source) => return Err(NegotiateError::Bind { port, source }),
            }
        }
        Ok((listeners, ports))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("config", &self.config).finish_non_exhaustive()
    }
}
