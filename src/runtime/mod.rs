//! Event-driven connection runtime.
//!
//! The reactor multiplexes one listening socket and N connection sockets
//! over a single `mio::Poll` loop, offloading per-connection work to a fixed
//! worker pool. Shared pieces:
//! - `ConnectionRegistry`: per-connection buffer + serialization lock
//! - `handler`: the header → body → echo → re-arm message cycle
//! - `acceptor`: drains the listening socket into registry entries

mod acceptor;
mod handler;
mod pool;
mod reactor;
mod registry;

pub use reactor::{Server, ShutdownHandle};
