//! Listener-side of the reactor: converts listening-socket readiness into
//! zero or more registered connections.
//!
//! The listener's readiness is edge-style: a single notification may hide
//! multiple queued connections, so accepting loops until `WouldBlock`. A
//! failure for one candidate discards only that candidate; the rest of the
//! batch is still accepted.

use crate::runtime::reactor::PollHandle;
use crate::runtime::registry::ConnectionRegistry;
use mio::net::TcpListener;
use mio::Token;
use std::io;
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, warn};

/// Drain all pending inbound connections.
///
/// Accepted sockets are non-blocking, get a registry entry (buffer + lock),
/// and are armed for one-shot readable interest.
pub fn accept_batch(listener: &TcpListener, registry: &ConnectionRegistry, poller: &PollHandle) {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let (id, stream) = match registry.insert(stream) {
                    Some(pair) => pair,
                    None => {
                        warn!(peer = %peer_addr, "Connection limit reached, rejecting");
                        continue;
                    }
                };

                if let Err(e) = poller.arm_readable(stream.as_raw_fd(), Token(id)) {
                    warn!(conn_id = id, error = %e, "Failed to register connection");
                    registry.remove(id);
                    continue;
                }

                debug!(conn_id = id, peer = %peer_addr, "Accepted connection");
            }
            // No more pending connections: the batch is done.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::net::TcpStream as StdStream;
    use std::time::Duration;

    fn poll_parts() -> (Poll, PollHandle) {
        let poll = Poll::new().unwrap();
        let handle = PollHandle::new(poll.registry().try_clone().unwrap());
        (poll, handle)
    }

    fn bound_listener() -> TcpListener {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        TcpListener::from_std(std_listener)
    }

    #[test]
    fn test_accepts_all_pending() {
        let (_poll, poller) = poll_parts();
        let listener = bound_listener();
        let addr = listener.local_addr().unwrap();
        let registry = ConnectionRegistry::new(16, 64);

        let _c1 = StdStream::connect(addr).unwrap();
        let _c2 = StdStream::connect(addr).unwrap();
        let _c3 = StdStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        accept_batch(&listener, &registry, &poller);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_capacity_rejects_only_excess() {
        let (_poll, poller) = poll_parts();
        let listener = bound_listener();
        let addr = listener.local_addr().unwrap();
        let registry = ConnectionRegistry::new(1, 64);

        let _c1 = StdStream::connect(addr).unwrap();
        let _c2 = StdStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        accept_batch(&listener, &registry, &poller);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_idle_listener_is_quiet() {
        let (_poll, poller) = poll_parts();
        let listener = bound_listener();
        let registry = ConnectionRegistry::new(16, 64);

        accept_batch(&listener, &registry, &poller);
        assert!(registry.is_empty());
    }
}
