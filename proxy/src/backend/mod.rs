//! Backend tier handlers.
//!
//! A handler is a single-connection client to one cache tier. Calls on a
//! handler are strictly sequential; each handler owns its transport and is
//! never shared between client connections. `Miss` and `NotFound` are
//! normal outcomes and are always distinguished from transport errors.

mod memcached;
mod memory;

pub use memcached::{TcpBackend, TextConn};
pub use memory::{MemoryBackend, MemoryHandler};

use protocol_memcache::text::StoreVerb;
use std::future::Future;
use std::io;

/// Outcome of a storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    NotStored,
    Exists,
    NotFound,
}

/// Outcome of a retrieval operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Hit { flags: u32, value: Vec<u8> },
    Miss,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Outcome of a touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Touched,
    NotFound,
}

/// A failure that makes the current backend exchange unusable.
///
/// Any of these aborts the in-flight logical operation; the connection that
/// observed it is not reused.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("backend error reply: {0}")]
    Server(String),
    #[error("unexpected backend reply")]
    Protocol,
}

/// Single-connection access to one cache tier.
pub trait Handler: Send {
    /// Store one item under `verb` semantics.
    fn store(
        &mut self,
        verb: StoreVerb,
        key: &[u8],
        flags: u32,
        exptime: u32,
        value: &[u8],
    ) -> impl Future<Output = Result<StoreOutcome, BackendError>> + Send;

    /// Fetch one item.
    fn get(&mut self, key: &[u8]) -> impl Future<Output = Result<GetOutcome, BackendError>> + Send;

    /// Remove one item.
    fn delete(
        &mut self,
        key: &[u8],
    ) -> impl Future<Output = Result<DeleteOutcome, BackendError>> + Send;

    /// Update one item's expiration.
    fn touch(
        &mut self,
        key: &[u8],
        exptime: u32,
    ) -> impl Future<Output = Result<TouchOutcome, BackendError>> + Send;

    /// Fetch one item and update its expiration.
    fn gat(
        &mut self,
        key: &[u8],
        exptime: u32,
    ) -> impl Future<Output = Result<GetOutcome, BackendError>> + Send;
}

/// Zero-argument constructor producing a fresh handler for one tier.
///
/// The server holds one of these per tier and invokes it once per accepted
/// client connection.
pub trait Connect: Clone + Send + Sync + 'static {
    type Handler: Handler + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Handler>> + Send;
}
