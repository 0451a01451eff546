//! culvert: bidirectional RPC over multi-socket TCP tunnels.
//!
//! culvert connects two processes — typically a desktop client and its
//! backend — through one or more logical channels ("tunnels"), each made of
//! one or more raw TCP connections ("links"). Either side may invoke named
//! byte-in/byte-out procedures on the other; payload contents are never
//! interpreted by the transport.
//!
//! # Quick start
//!
//! Server:
//!
//! ```ignore
//! use culvert::{Server, ServerConfig};
//!
//! let mut server = Server::bind(ServerConfig::default()).await?;
//! server.subscribe("echo", |args| Ok(args));
//! let conn = server.accept().await?; // negotiates, spawns receive loops
//! ```
//!
//! Client:
//!
//! ```ignore
//! use bytes::Bytes;
//! use culvert::{Client, ClientConfig};
//!
//! let client = Client::new(ClientConfig::default());
//! let conn = client.connect().await?;
//! let reply = conn.call_by_name("echo", Bytes::from_static(b"hi"), 0).await?;
//! assert_eq!(reply, Bytes::from_static(b"hi"));
//! ```
//!
//! # Topology
//!
//! During negotiation the client declares how many sockets each tunnel
//! should carry. The server opens one fresh listening port per socket,
//! answers with the port list, and both sides partition the resulting
//! connections into tunnels identically. Outbound messages on a tunnel are
//! load-balanced uniformly across its links; order is preserved per link
//! only.
//!
//! # Guarantees and non-guarantees
//!
//! Calls are correlated by a `(call_id, fn_id)` pair; concurrent calls on
//! one tunnel resolve independently. There is no encryption,
//! authentication, reconnection, or protocol-level call timeout — callers
//! wanting deadlines race the returned future against their own timer. A
//! remote handler failure surfaces as [`RpcError::Remote`] carrying the
//! peer's error text; it never affects other in-flight calls.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod endpoint;
mod link;
pub mod server;
pub mod tunnel;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig, DEFAULT_CONTROL_PORT, DEFAULT_TRANSFER_PORT_BASE};
pub use endpoint::Connection;
pub use server::Server;
pub use tunnel::{PendingCall, Tunnel, LISTEN_TIMEOUT};

// Re-export the core vocabulary so applications depend on one crate.
pub use culvert_core::{
    CallId, DecodeError, Message, NegotiateError, ProcedureError, ProcedureRegistry,
    RegistryBuilder, RpcError, TransportError, decode_listing, read_message, write_message,
    MAX_CALL_ID, MAX_FRAME_LEN, NO_CALL_ID, SELF_DESCRIPTION,
};
