//! Per-connection state table.
//!
//! Owns, for every live connection: the socket handle, the I/O buffer, and a
//! dedicated serialization lock. Connections are keyed by a stable id
//! allocated from a slab arena, so ids cannot collide by construction.
//!
//! Two locks with different scopes guard this state:
//! - the table mutex, held only for the map mutation itself;
//! - the per-connection lock, acquired by the handler before `take` and held
//!   for the entire message cycle. It is what serializes two readiness
//!   dispatches for the same connection; the one-shot interest mechanics are
//!   not the correctness guarantee.

use mio::net::TcpStream;
use slab::Slab;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct ConnEntry {
    stream: Arc<TcpStream>,
    /// Serialization lock: exactly one handler per connection at a time.
    guard: Arc<Mutex<()>>,
    /// I/O buffer; `None` while a handler owns it.
    buffer: Option<Vec<u8>>,
}

/// Registry of active connections with exclusive buffer ownership transfer.
pub struct ConnectionRegistry {
    table: Mutex<Slab<ConnEntry>>,
    buffer_size: usize,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize, buffer_size: usize) -> Self {
        Self {
            table: Mutex::new(Slab::with_capacity(max_connections)),
            buffer_size,
            max_connections,
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, Slab<ConnEntry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new connection, allocating its buffer and lock.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&self, stream: TcpStream) -> Option<(usize, Arc<TcpStream>)> {
        let mut table = self.lock_table();
        if table.len() >= self.max_connections {
            return None;
        }
        let stream = Arc::new(stream);
        let id = table.insert(ConnEntry {
            stream: Arc::clone(&stream),
            guard: Arc::new(Mutex::new(())),
            buffer: Some(vec![0u8; self.buffer_size]),
        });
        Some((id, stream))
    }

    /// Get the per-connection serialization lock.
    ///
    /// Returns `None` if the connection is gone (raced with a close).
    pub fn guard(&self, id: usize) -> Option<Arc<Mutex<()>>> {
        self.lock_table().get(id).map(|e| Arc::clone(&e.guard))
    }

    /// Get the connection's socket handle.
    pub fn stream(&self, id: usize) -> Option<Arc<TcpStream>> {
        self.lock_table().get(id).map(|e| Arc::clone(&e.stream))
    }

    /// Remove and return the connection's buffer, transferring exclusive
    /// ownership to the caller for the duration of one message cycle.
    ///
    /// Returns `None` if the connection is gone or the buffer is already
    /// owned elsewhere; the caller must abandon silently.
    pub fn take(&self, id: usize) -> Option<Vec<u8>> {
        self.lock_table().get_mut(id).and_then(|e| e.buffer.take())
    }

    /// Return buffer ownership after a completed cycle.
    ///
    /// A no-op if the connection was removed while the buffer was out; the
    /// buffer is simply dropped.
    pub fn put(&self, id: usize, buffer: Vec<u8>) {
        if let Some(entry) = self.lock_table().get_mut(id) {
            debug_assert!(entry.buffer.is_none(), "buffer returned twice");
            entry.buffer = Some(buffer);
        }
    }

    /// Delete the connection's entry, discarding any still-owned buffer.
    ///
    /// Returns the socket handle so the caller can deregister it; the socket
    /// closes when the last `Arc` drops.
    pub fn remove(&self, id: usize) -> Option<Arc<TcpStream>> {
        let mut table = self.lock_table();
        if table.contains(id) {
            Some(table.remove(id).stream)
        } else {
            None
        }
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.lock_table().contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock_table().len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.lock_table().is_empty()
    }

    /// Ids of all live connections, for the shutdown sweep.
    pub fn ids(&self) -> Vec<usize> {
        self.lock_table().iter().map(|(id, _)| id).collect()
    }
}
