//! The live endpoint: tunnels, the local procedure table, and the receive
//! loops.
//!
//! A [`Connection`] exists only after negotiation succeeded. It owns one
//! background receive task per tunnel; each task pulls unsolicited messages
//! off its tunnel and routes them: inbound `Call`s are answered by invoking
//! the local procedure inline (a slow handler stalls that tunnel's
//! delivery, nothing else), `Ping`s are echoed, anything else is logged and
//! dropped. Answers to our own outbound calls never reach these tasks; the
//! tunnel resolves them on the way in.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use culvert_core::{Message, ProcedureRegistry, RpcError, decode_listing};

use crate::tunnel::{PendingCall, Tunnel};

struct Shared {
    registry: ProcedureRegistry,
    tunnels: Vec<Arc<Tunnel>>,
    /// Peer's procedure listing, fetched at most once per endpoint
    /// lifetime on the first call-by-name.
    remote_names: OnceCell<Vec<String>>,
}

/// A negotiated endpoint. Dropping it aborts the receive tasks and closes
/// every link; there is no graceful shutdown handshake.
pub struct Connection {
    shared: Arc<Shared>,
    receive_tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn spawn(registry: ProcedureRegistry, tunnels: Vec<Arc<Tunnel>>) -> Self {
        let shared = Arc::new(Shared { registry, tunnels, remote_names: OnceCell::new() });
        let receive_tasks = (0..shared.tunnels.len())
            .map(|index| tokio::spawn(receive_loop(shared.clone(), index)))
            .collect();
        Self { shared, receive_tasks }
    }

    pub fn tunnel_count(&self) -> usize {
        self.shared.tunnels.len()
    }

    /// Direct access to a tunnel, for callers that want raw
    /// [`Tunnel::call`] dispatch.
    ///
    /// # Panics
    ///
    /// Panics when `index` is out of range, like any slice index.
    pub fn tunnel(&self, index: usize) -> &Arc<Tunnel> {
        &self.shared.tunnels[index]
    }

    /// The local self-description payload: every registered procedure
    /// name, stable order, NUL-terminated.
    pub fn procedure_listing(&self) -> Bytes {
        self.shared.registry.listing()
    }

    /// Call a remote procedure by id on the given tunnel. Returns the
    /// future immediately; the caller awaits resolution.
    pub async fn call(
        &self,
        fn_id: u8,
        args: Bytes,
        tunnel_index: usize,
    ) -> Result<PendingCall, RpcError> {
        self.shared.tunnels[tunnel_index].call(fn_id, args).await
    }

    /// Resolve a remote procedure name to its id, fetching the peer's
    /// listing on first use.
    ///
    /// Unknown names are an explicit [`RpcError::UnknownProcedure`]; they
    /// are never conflated with the self-description procedure at id 0.
    pub async fn resolve(&self, name: &str) -> Result<u8, RpcError> {
        let names = self
            .shared
            .remote_names
            .get_or_try_init(|| async {
                tracing::debug!("fetching remote procedure listing");
                let response = self.shared.tunnels[0].call(0, Bytes::new()).await?.await?;
                let names = decode_listing(&response);
                tracing::debug!(count = names.len(), "remote procedure listing cached");
                Ok::<_, RpcError>(names)
            })
            .await?;
        names
            .iter()
            .position(|n| n == name)
            .and_then(|pos| u8::try_from(pos).ok())
            .ok_or_else(|| RpcError::UnknownProcedure(name.to_owned()))
    }

    /// Call a remote procedure by name and await its response. A remote
    /// failure surfaces as [`RpcError::Remote`] carrying the peer's error
    /// text.
    pub async fn call_by_name(
        &self,
        name: &str,
        args: Bytes,
        tunnel_index: usize,
    ) -> Result<Bytes, RpcError> {
        let fn_id = self.resolve(name).await?;
        self.call(fn_id, args, tunnel_index).await?.await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.receive_tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("tunnels", &self.shared.tunnels.len())
            .field("procedures", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}

/// The permanent receive loop for one tunnel. Runs until the tunnel dies
/// or the connection is dropped.
async fn receive_loop(shared: Arc<Shared>, tunnel_index: usize) {
    let tunnel = shared.tunnels[tunnel_index].clone();
    while tunnel.is_alive() {
        for msg in tunnel.listen().await {
            match msg {
                Message::Call { fn_id, call_id, args } => {
                    let reply = match invoke(&shared.registry, fn_id, args) {
                        Ok(response) => Message::Result { fn_id, call_id, response },
                        Err(text) => {
                            Message::Error { fn_id, call_id, message: Bytes::from(text) }
                        }
                    };
                    if let Err(e) = tunnel.send(&reply).await {
                        tracing::warn!(
                            tunnel = tunnel_index,
                            fn_id,
                            call_id,
                            error = %e,
                            "failed to send reply"
                        );
                    }
                }
                Message::Ping => {
                    if let Err(e) = tunnel.send(&Message::Ping).await {
                        tracing::warn!(tunnel = tunnel_index, error = %e, "failed to echo ping");
                    }
                }
                other => {
                    tracing::warn!(
                        tunnel = tunnel_index,
                        kind = other.kind(),
                        "dropping unroutable message"
                    );
                }
            }
        }
    }
    tracing::debug!(tunnel = tunnel_index, "receive loop stopped: tunnel dead");
}

/// Invoke the local procedure at `fn_id`. Handler failures and panics both
/// come back as the error text for an `Error` reply; nothing thrown by a
/// handler can kill the receive loop.
fn invoke(registry: &ProcedureRegistry, fn_id: u8, args: Bytes) -> Result<Bytes, String> {
    let Some(handler) = registry.handler(fn_id) else {
        return Err(format!("no procedure with id {fn_id}"));
    };
    match catch_unwind(AssertUnwindSafe(|| handler(args))) {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(e.message().to_owned()),
        Err(panic) => {
            let text = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("panic in procedure: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("panic in procedure: {s}")
            } else {
                "panic in procedure".to_owned()
            };
            tracing::error!(fn_id, "{text}");
            Err(text)
        }
    }
}
