//! Byte-stream providers
//!
//! The partitioning engine never touches storage directly: it sees a
//! [ByteStream] over one object and a [ByteStore] that opens, creates, and
//! enumerates objects. The crate ships a local-filesystem store and an
//! in-memory store with object-store semantics; real remote transports
//! implement the same pair behind a blocking adapter.

use std::time::Duration;

use crate::{error::Result, uri::ObjectUri};

pub mod local;
pub mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

/// Transport timeouts advertised by a stream.
///
/// The engine does not retry on timeout; it surfaces the failure with the
/// offending URI and aborts the enclosing slice operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for StreamTimeouts {
    fn default() -> Self {
        StreamTimeouts {
            connect: Duration::from_secs(30),
            read: Duration::from_secs(300),
        }
    }
}

/// A readable, writable, seekable stream over one stored object
pub trait ByteStream: std::fmt::Debug {
    /// Read `len` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Read the whole object into memory.
    fn read_all(&mut self) -> Result<Vec<u8>>;

    /// Write bytes at the current position.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Move the current position.
    fn seek(&mut self, pos: u64) -> Result<()>;

    /// Close the stream, optionally replacing the object's full content.
    ///
    /// Remote stores treat the payload as a one-shot upload; durability is
    /// only guaranteed once this returns.
    fn close(&mut self, payload: Option<&[u8]>) -> Result<()>;

    /// Whether the stream talks to a remote store.
    fn is_remote(&self) -> bool;

    fn timeouts(&self) -> StreamTimeouts {
        StreamTimeouts::default()
    }
}

/// Opens, creates, probes, and enumerates objects in one storage namespace
pub trait ByteStore {
    /// Open an existing object for reading.
    fn open(&self, uri: &ObjectUri) -> Result<Box<dyn ByteStream>>;

    /// Create an object for writing. With `clobber`, an existing object is
    /// replaced; without it, creation over an existing object fails.
    fn create(&self, uri: &ObjectUri, clobber: bool) -> Result<Box<dyn ByteStream>>;

    /// Whether an object exists.
    fn exists(&self, uri: &ObjectUri) -> Result<bool>;

    /// Enumerate object URIs matching a pattern with `*`/`?` wildcards.
    fn list(&self, pattern: &ObjectUri) -> Result<Vec<String>>;

    /// Whether this store is remote. Placement of opened files (memory vs
    /// disk) keys off this.
    fn is_remote(&self) -> bool;
}
