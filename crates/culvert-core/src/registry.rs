//! The local procedure registry.
//!
//! Procedures are byte-in/byte-out handlers registered by name before
//! negotiation. Ids are positions in the stable ordered list; position 0
//! always holds the implicit self-description procedure, whose response is
//! the NUL-terminated concatenation of every registered name. The remote
//! side resolves names to ids against that listing.

use std::sync::Arc;

use bytes::Bytes;

use crate::ProcedureError;

/// Name of the implicit self-description procedure at id 0.
pub const SELF_DESCRIPTION: &str = "GetProcedures";

/// A locally registered procedure. Exceptions do not exist on the wire:
/// handlers report failure through the `Err` text, which travels back to
/// the remote caller verbatim.
pub type Handler = Arc<dyn Fn(Bytes) -> Result<Bytes, ProcedureError> + Send + Sync>;

/// Collects subscriptions before negotiation seals them.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<(String, Handler)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate name, on the reserved self-description name,
    /// or when the table would no longer fit the one-byte id space.
    pub fn subscribe<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Bytes) -> Result<Bytes, ProcedureError> + Send + Sync + 'static,
    {
        let name = name.into();
        assert_ne!(name, SELF_DESCRIPTION, "procedure name {name:?} is reserved");
        assert!(
            !self.entries.iter().any(|(n, _)| *n == name),
            "procedure {name:?} already registered"
        );
        assert!(
            self.entries.len() < u8::MAX as usize,
            "procedure table full: ids must fit in a byte"
        );
        self.entries.push((name, Arc::new(handler)));
    }

    /// Seal the table, synthesizing the self-description entry at id 0.
    pub fn build(self) -> ProcedureRegistry {
        let mut names = Vec::with_capacity(self.entries.len() + 1);
        names.push(SELF_DESCRIPTION.to_owned());
        names.extend(self.entries.iter().map(|(n, _)| n.clone()));

        let listing = encode_listing(&names);
        let self_description = listing.clone();

        let mut handlers: Vec<Handler> = Vec::with_capacity(names.len());
        handlers.push(Arc::new(move |_args| Ok(self_description.clone())));
        handlers.extend(self.entries.into_iter().map(|(_, h)| h));

        ProcedureRegistry { names, handlers, listing }
    }
}

/// The sealed procedure table. Built once per endpoint, read-only after.
pub struct ProcedureRegistry {
    names: Vec<String>,
    handlers: Vec<Handler>,
    listing: Bytes,
}

impl ProcedureRegistry {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        // Never true: id 0 always exists.
        self.names.is_empty()
    }

    pub fn name(&self, fn_id: u8) -> Option<&str> {
        self.names.get(fn_id as usize).map(String::as_str)
    }

    pub fn handler(&self, fn_id: u8) -> Option<&Handler> {
        self.handlers.get(fn_id as usize)
    }

    /// The self-description payload: every name, stable order, each
    /// terminated by NUL.
    pub fn listing(&self) -> Bytes {
        self.listing.clone()
    }
}

impl std::fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

fn encode_listing(names: &[String]) -> Bytes {
    let mut buf = Vec::with_capacity(names.iter().map(|n| n.len() + 1).sum());
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    Bytes::from(buf)
}

/// Decode a peer's self-description payload back into its name list.
///
/// Lossy on invalid UTF-8, mirroring how error texts are surfaced: the
/// transport never rejects a peer over payload contents.
pub fn decode_listing(payload: &[u8]) -> Vec<String> {
    payload
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(args: Bytes) -> Result<Bytes, ProcedureError> {
        Ok(args)
    }

    #[test]
    fn listing_round_trips_with_self_description_first() {
        let mut builder = RegistryBuilder::new();
        builder.subscribe("echo", echo);
        builder.subscribe("reverse", |args: Bytes| {
            let mut v = args.to_vec();
            v.reverse();
            Ok(Bytes::from(v))
        });
        let registry = builder.build();

        let names = decode_listing(&registry.listing());
        assert_eq!(names, vec![SELF_DESCRIPTION, "echo", "reverse"]);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.name(0), Some(SELF_DESCRIPTION));
        assert_eq!(registry.name(1), Some("echo"));
        assert_eq!(registry.name(3), None);
    }

    #[test]
    fn self_description_handler_returns_the_listing() {
        let mut builder = RegistryBuilder::new();
        builder.subscribe("echo", echo);
        let registry = builder.build();

        let handler = registry.handler(0).unwrap();
        let out = handler(Bytes::new()).unwrap();
        assert_eq!(out, registry.listing());
    }

    #[test]
    fn empty_registry_still_describes_itself() {
        let registry = RegistryBuilder::new().build();
        assert_eq!(registry.len(), 1);
        assert_eq!(decode_listing(&registry.listing()), vec![SELF_DESCRIPTION]);
    }

    #[test]
    fn handler_errors_carry_their_text() {
        let mut builder = RegistryBuilder::new();
        builder.subscribe("fail", |_args| Err(ProcedureError::new("boom")));
        let registry = builder.build();

        let err = registry.handler(1).unwrap()(Bytes::new()).unwrap_err();
        assert_eq!(err.message(), "boom");
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_names_fail_fast() {
        let mut builder = RegistryBuilder::new();
        builder.subscribe("echo", echo);
        builder.subscribe("echo", echo);
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn reserved_name_fails_fast() {
        let mut builder = RegistryBuilder::new();
        builder.subscribe(SELF_DESCRIPTION, echo);
    }
}
