//! Per-connection message cycle.
//!
//! Drives one connection through header-read → body-read → echo-write →
//! drain → re-arm. The connection's serialization lock is acquired before
//! the buffer is taken and held until the cycle ends, so a second readiness
//! dispatch for the same connection blocks instead of observing a missing
//! buffer.
//!
//! The socket is non-blocking and owned by the reactor's notification model,
//! so the read/write loops are busy-polls with a short sleep between
//! `WouldBlock` retries, bounded by per-stage deadlines. A timeout is the
//! sole cancellation path and unconditionally closes the connection.

use crate::protocol::{FrameError, FrameHeader, HEADER_LEN};
use crate::runtime::reactor::PollHandle;
use crate::runtime::registry::ConnectionRegistry;
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::PoisonError;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Sleep between `WouldBlock` retries in the accumulate loops.
const RETRY_DELAY: Duration = Duration::from_micros(500);

/// Per-stage deadline budgets for one message cycle.
///
/// The echo write carries the body's budget; the drain step needs none
/// because it never retries.
#[derive(Debug, Clone, Copy)]
pub struct CycleTimeouts {
    pub header: Duration,
    pub body: Duration,
    pub echo: Duration,
}

impl Default for CycleTimeouts {
    fn default() -> Self {
        Self {
            header: Duration::from_secs(3),
            body: Duration::from_secs(5),
            echo: Duration::from_secs(5),
        }
    }
}

/// Stage of the cycle an error exit happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Body,
    Echo,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Header => "header",
            Stage::Body => "body",
            Stage::Echo => "echo",
        })
    }
}

/// Why a connection left the cycle for `Close`.
#[derive(Debug)]
enum CloseReason {
    /// Clean zero-length read before any header byte arrived.
    PeerClosed,
    /// Zero-length read mid-frame.
    UnexpectedEof(Stage),
    /// Stage deadline elapsed.
    Timeout(Stage),
    /// Bad magic or out-of-range length.
    Protocol(FrameError),
    /// Non-retryable I/O failure (reset, broken pipe, ...).
    Io(io::Error),
}

/// Process one readiness dispatch for the connection `id`.
///
/// On a successful cycle the buffer is returned to the registry and readable
/// interest is re-armed; on any error exit the connection is torn down. A
/// connection that vanished between dispatch and processing (raced with a
/// close) is abandoned silently.
pub fn process(
    registry: &ConnectionRegistry,
    poller: &PollHandle,
    id: usize,
    timeouts: &CycleTimeouts,
    drain_after_echo: bool,
) {
    let lock = match registry.guard(id) {
        Some(lock) => lock,
        None => return,
    };
    let _serial = lock.lock().unwrap_or_else(PoisonError::into_inner);

    let stream = match registry.stream(id) {
        Some(stream) => stream,
        None => return,
    };
    let mut buffer = match registry.take(id) {
        Some(buffer) => buffer,
        None => return,
    };

    match run_cycle(&stream, &mut buffer, timeouts, drain_after_echo) {
        Ok(()) => {
            registry.put(id, buffer);
            if let Err(e) = poller.arm_readable(stream.as_raw_fd(), Token(id)) {
                warn!(conn_id = id, error = %e, "Failed to re-arm interest");
                close(registry, poller, id);
            }
        }
        Err(reason) => {
            // Error exit: the buffer is discarded, not returned.
            log_close(id, &reason);
            close(registry, poller, id);
        }
    }
}

/// Tear a connection down: deregister, delete registry state, close socket.
pub fn close(registry: &ConnectionRegistry, poller: &PollHandle, id: usize) {
    if let Some(stream) = registry.remove(id) {
        let _ = poller.disarm(stream.as_raw_fd());
        debug!(conn_id = id, "Connection closed");
    }
}

/// One full message cycle over an exclusively owned buffer.
fn run_cycle(
    stream: &TcpStream,
    buffer: &mut [u8],
    timeouts: &CycleTimeouts,
    drain_after_echo: bool,
) -> Result<(), CloseReason> {
    let buffer_size = buffer.len();

    let mut header_bytes = [0u8; HEADER_LEN];
    read_full(stream, &mut header_bytes, timeouts.header, Stage::Header)?;

    let header = FrameHeader::decode(&header_bytes);
    header.validate(buffer_size).map_err(CloseReason::Protocol)?;

    let body = &mut buffer[..header.data_len as usize];
    read_full(stream, body, timeouts.body, Stage::Body)?;

    // The frame is immutable once fully received: re-emit the identical
    // header and payload bytes.
    write_full(stream, &header_bytes, timeouts.echo)?;
    write_full(stream, body, timeouts.echo)?;

    if drain_after_echo {
        drain_buffered(stream, buffer_size);
    }

    Ok(())
}

/// Accumulate exactly `buf.len()` bytes from a non-blocking socket.
fn read_full(
    mut stream: &TcpStream,
    buf: &mut [u8],
    timeout: Duration,
    stage: Stage,
) -> Result<(), CloseReason> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(if filled == 0 && stage == Stage::Header {
                    CloseReason::PeerClosed
                } else {
                    CloseReason::UnexpectedEof(stage)
                });
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(CloseReason::Timeout(stage));
                }
                thread::sleep(RETRY_DELAY);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(CloseReason::Io(e)),
        }
    }

    Ok(())
}

/// Write all of `buf`, retrying partial writes and `WouldBlock`.
fn write_full(mut stream: &TcpStream, buf: &[u8], timeout: Duration) -> Result<(), CloseReason> {
    let deadline = Instant::now() + timeout;
    let mut written = 0;

    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => {
                return Err(CloseReason::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0",
                )));
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(CloseReason::Timeout(Stage::Echo));
                }
                thread::sleep(RETRY_DELAY);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(CloseReason::Io(e)),
        }
    }

    Ok(())
}

/// Discard bytes already buffered on the socket, at most `limit` of them.
///
/// Single pass: stops on `WouldBlock`, a zero-length read, or any error.
/// Errors are left for the next cycle to observe.
fn drain_buffered(mut stream: &TcpStream, limit: usize) {
    let mut scratch = [0u8; 512];
    let mut drained = 0;

    while drained < limit {
        match stream.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => drained += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }

    if drained > 0 {
        debug!(drained, "Discarded buffered bytes after echo");
    }
}

fn log_close(id: usize, reason: &CloseReason) {
    match reason {
        CloseReason::PeerClosed => debug!(conn_id = id, "Peer closed connection"),
        CloseReason::UnexpectedEof(stage) => {
            warn!(conn_id = id, %stage, "Connection closed mid-frame")
        }
        CloseReason::Timeout(stage) => error!(conn_id = id, %stage, "I/O timed out"),
        CloseReason::Protocol(e) => error!(conn_id = id, error = %e, "Protocol violation"),
        CloseReason::Io(e) => error!(conn_id = id, error = %e, "Connection error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::{Shutdown, TcpListener as StdListener, TcpStream as StdStream};

    fn connected_pair() -> (TcpStream, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (TcpStream::from_std(accepted), client)
    }

    fn short_timeouts() -> CycleTimeouts {
        CycleTimeouts {
            header: Duration::from_millis(200),
            body: Duration::from_millis(200),
            echo: Duration::from_millis(200),
        }
    }

    fn frame(msg_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = FrameHeader::new(payload.len() as u32, msg_id)
            .encode()
            .to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn read_echo(client: &mut StdStream, payload_len: usize) -> (FrameHeader, Vec<u8>) {
        let mut header_bytes = [0u8; HEADER_LEN];
        client.read_exact(&mut header_bytes).unwrap();
        let mut payload = vec![0u8; payload_len];
        client.read_exact(&mut payload).unwrap();
        (FrameHeader::decode(&header_bytes), payload)
    }

    #[test]
    fn test_round_trip() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        client.write_all(&frame(7, b"hello")).unwrap();
        run_cycle(&server, &mut buffer, &short_timeouts(), false).unwrap();

        let (header, payload) = read_echo(&mut client, 5);
        assert_eq!(header, FrameHeader::new(5, 7));
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_sequential_messages_same_connection() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        client.write_all(&frame(1, b"first")).unwrap();
        run_cycle(&server, &mut buffer, &short_timeouts(), false).unwrap();
        let (header, payload) = read_echo(&mut client, 5);
        assert_eq!(header.msg_id, 1);
        assert_eq!(payload, b"first");

        client.write_all(&frame(2, b"second!")).unwrap();
        run_cycle(&server, &mut buffer, &short_timeouts(), false).unwrap();
        let (header, payload) = read_echo(&mut client, 7);
        assert_eq!(header.msg_id, 2);
        assert_eq!(payload, b"second!");
    }

    #[test]
    fn test_back_to_back_messages_not_interleaved() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        // Both frames hit the socket before the first cycle runs.
        let mut both = frame(10, b"aaaa");
        both.extend_from_slice(&frame(11, b"bbbb"));
        client.write_all(&both).unwrap();

        run_cycle(&server, &mut buffer, &short_timeouts(), false).unwrap();
        let (header, payload) = read_echo(&mut client, 4);
        assert_eq!(header.msg_id, 10);
        assert_eq!(payload, b"aaaa");

        // The second header is only read after the first echo completed.
        run_cycle(&server, &mut buffer, &short_timeouts(), false).unwrap();
        let (header, payload) = read_echo(&mut client, 4);
        assert_eq!(header.msg_id, 11);
        assert_eq!(payload, b"bbbb");
    }

    #[test]
    fn test_fragmented_frame_reassembled() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        let bytes = frame(3, b"fragmented payload");
        let writer = thread::spawn(move || {
            for chunk in bytes.chunks(1) {
                client.write_all(chunk).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            client
        });

        run_cycle(&server, &mut buffer, &CycleTimeouts::default(), false).unwrap();

        let mut client = writer.join().unwrap();
        let (header, payload) = read_echo(&mut client, 18);
        assert_eq!(header.msg_id, 3);
        assert_eq!(payload, b"fragmented payload");
    }

    #[test]
    fn test_bad_magic_closes() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        let mut bytes = frame(1, b"hello");
        bytes[0] = 0xFF;
        client.write_all(&bytes).unwrap();

        let result = run_cycle(&server, &mut buffer, &short_timeouts(), false);
        assert!(matches!(
            result,
            Err(CloseReason::Protocol(FrameError::InvalidMagic(_)))
        ));
    }

    #[test]
    fn test_zero_length_closes() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        client
            .write_all(&FrameHeader::new(0, 1).encode())
            .unwrap();

        let result = run_cycle(&server, &mut buffer, &short_timeouts(), false);
        assert!(matches!(
            result,
            Err(CloseReason::Protocol(FrameError::InvalidLength(0)))
        ));
    }

    #[test]
    fn test_oversized_length_closes() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        client
            .write_all(&FrameHeader::new(1025, 1).encode())
            .unwrap();

        let result = run_cycle(&server, &mut buffer, &short_timeouts(), false);
        assert!(matches!(
            result,
            Err(CloseReason::Protocol(FrameError::InvalidLength(1025)))
        ));
    }

    #[test]
    fn test_clean_peer_close() {
        let (server, client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        client.shutdown(Shutdown::Write).unwrap();

        let result = run_cycle(&server, &mut buffer, &short_timeouts(), false);
        assert!(matches!(result, Err(CloseReason::PeerClosed)));
    }

    #[test]
    fn test_eof_mid_header() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        client.write_all(&[0x1A, 0x2B, 0x3C]).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let result = run_cycle(&server, &mut buffer, &short_timeouts(), false);
        assert!(matches!(
            result,
            Err(CloseReason::UnexpectedEof(Stage::Header))
        ));
    }

    #[test]
    fn test_header_timeout() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        // Partial header, then silence.
        client.write_all(&[0x1A, 0x2B]).unwrap();

        let result = run_cycle(&server, &mut buffer, &short_timeouts(), false);
        assert!(matches!(result, Err(CloseReason::Timeout(Stage::Header))));
    }

    #[test]
    fn test_body_timeout() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        client
            .write_all(&FrameHeader::new(100, 1).encode())
            .unwrap();
        client.write_all(b"only part of the body").unwrap();

        let result = run_cycle(&server, &mut buffer, &short_timeouts(), false);
        assert!(matches!(result, Err(CloseReason::Timeout(Stage::Body))));
    }

    #[test]
    fn test_drain_discards_buffered_bytes() {
        let (server, mut client) = connected_pair();
        let mut buffer = vec![0u8; 1024];

        let mut both = frame(20, b"kept");
        both.extend_from_slice(&frame(21, b"stale"));
        client.write_all(&both).unwrap();
        // Let both frames land in the server-side socket buffer.
        thread::sleep(Duration::from_millis(50));

        run_cycle(&server, &mut buffer, &short_timeouts(), true).unwrap();
        let (header, payload) = read_echo(&mut client, 4);
        assert_eq!(header.msg_id, 20);
        assert_eq!(payload, b"kept");

        // The trailing frame was drained: the next cycle finds an idle socket.
        let result = run_cycle(&server, &mut buffer, &short_timeouts(), true);
        assert!(matches!(result, Err(CloseReason::Timeout(Stage::Header))));
    }
}
