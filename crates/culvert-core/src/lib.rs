//! culvert-core: Core types for the culvert RPC transport.
//!
//! This crate defines:
//! - Wire messages and their framing ([`Message`], [`read_message`], [`write_message`])
//! - Call identifiers ([`CallId`], [`NO_CALL_ID`])
//! - Error types ([`TransportError`], [`RpcError`], [`NegotiateError`])
//! - The local procedure registry ([`ProcedureRegistry`], [`RegistryBuilder`])

#![forbid(unsafe_code)]

mod error;
mod message;
mod registry;

pub use error::*;
pub use message::*;
pub use registry::*;
