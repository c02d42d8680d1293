//! Load-generation client for the framed echo protocol.
//!
//! Fans connections out across threads; each connection sends a batch of
//! framed messages and verifies every echo byte-for-byte against what was
//! sent. Uses plain blocking sockets with a read timeout — the client is a
//! consumer of the wire protocol, not of the reactor.

use crate::config::LoadArgs;
use crate::protocol::{FrameHeader, HEADER_LEN};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Read timeout on every client socket.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregated counters across all connection threads.
#[derive(Debug, Default)]
pub struct LoadStats {
    pub connections: AtomicUsize,
    pub sent: AtomicUsize,
    pub received: AtomicUsize,
    pub errors: AtomicUsize,
}

/// Run the load test and log a summary. Returns the stats for inspection.
pub fn run(args: &LoadArgs) -> io::Result<Arc<LoadStats>> {
    if args.message_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "message_size must be non-zero",
        ));
    }

    info!(
        server = %args.server,
        connections = args.connections,
        messages = args.messages,
        message_size = args.message_size,
        "Starting load run"
    );

    let stats = Arc::new(LoadStats::default());
    let start = Instant::now();

    let mut handles = Vec::with_capacity(args.connections);
    for i in 0..args.connections {
        let stats = Arc::clone(&stats);
        let server = args.server.clone();
        let messages = args.messages;
        let message_size = args.message_size;

        handles.push(thread::spawn(move || {
            run_connection(&server, messages, message_size, &stats);
        }));

        // Stagger connection creation to avoid a thundering herd.
        if i % 100 == 0 && i > 0 {
            thread::sleep(Duration::from_millis(10));
        }
    }

    for handle in handles {
        let _ = handle.join();
    }

    let elapsed = start.elapsed();
    let received = stats.received.load(Ordering::SeqCst);
    info!(
        connections = stats.connections.load(Ordering::SeqCst),
        sent = stats.sent.load(Ordering::SeqCst),
        received,
        errors = stats.errors.load(Ordering::SeqCst),
        elapsed_secs = format_args!("{:.2}", elapsed.as_secs_f64()),
        "Load run complete"
    );
    if !elapsed.is_zero() {
        info!(
            throughput = format_args!("{:.0} msg/s", received as f64 / elapsed.as_secs_f64()),
            "Throughput"
        );
    }

    Ok(stats)
}

/// One connection's whole lifecycle: connect, send/verify every message,
/// disconnect. Any failure counts one error and ends the loop.
fn run_connection(server: &str, messages: usize, message_size: usize, stats: &LoadStats) {
    let mut stream = match TcpStream::connect(server) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Connection failed");
            stats.errors.fetch_add(1, Ordering::SeqCst);
            return;
        }
    };
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        error!(error = %e, "Failed to set read timeout");
        stats.errors.fetch_add(1, Ordering::SeqCst);
        return;
    }
    stats.connections.fetch_add(1, Ordering::SeqCst);

    let payload = vec![b'a'; message_size];
    let mut echo_header = [0u8; HEADER_LEN];
    let mut echo_payload = vec![0u8; message_size];

    for msg_id in 0..messages as u32 {
        let sent_header = FrameHeader::new(message_size as u32, msg_id).encode();

        if let Err(e) = stream
            .write_all(&sent_header)
            .and_then(|()| stream.write_all(&payload))
        {
            error!(msg_id, error = %e, "Send failed");
            stats.errors.fetch_add(1, Ordering::SeqCst);
            break;
        }
        stats.sent.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = stream
            .read_exact(&mut echo_header)
            .and_then(|()| stream.read_exact(&mut echo_payload))
        {
            error!(msg_id, error = %e, "Receive failed");
            stats.errors.fetch_add(1, Ordering::SeqCst);
            break;
        }

        if echo_header != sent_header || echo_payload != payload {
            error!(msg_id, "Echoed data mismatch");
            stats.errors.fetch_add(1, Ordering::SeqCst);
            break;
        }
        stats.received.fetch_add(1, Ordering::SeqCst);
    }
}
