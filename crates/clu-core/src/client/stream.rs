//! Pull-based stream of decrypted broadcast replies.
//!
//! A broadcast request is sent once; replies from many devices trickle in
//! until a deadline. [`BroadcastStream`] collects them on a background worker
//! and hands them to the caller through a small bounded queue, so the caller
//! can stop pulling early (drop the stream) without waiting out the full
//! timeout. The sequence is finite and non-restartable.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::cipher::CipherKey;
use crate::protocol::CluCommand;
use crate::transport::{CluSocket, Payload, TransportError};

/// Replies queued between the collector worker and the consumer. The worker
/// blocks when the queue is full rather than dropping a reply.
const QUEUE_CAPACITY: usize = 8;

/// Finite iterator over decrypted broadcast reply payloads.
///
/// Each yielded [`Payload`] carries the sender's endpoint and the decrypted
/// plaintext frame. Duplicates (same sender, same plaintext) are suppressed.
pub struct BroadcastStream {
    rx: mpsc::Receiver<Payload>,
    // Dropping the handle detaches the worker: it self-terminates at the
    // deadline, at the reply limit, or when its queue send fails because
    // this stream was dropped. Joining here could block a caller that
    // stopped early for the rest of the timeout.
    _worker: JoinHandle<()>,
}

impl BroadcastStream {
    /// Sends `command` encrypted under `request_key` to the broadcast
    /// `target`, then collects up to `limit` distinct replies that decrypt
    /// under `response_key` within `timeout`.
    pub fn open(
        request_key: &CipherKey,
        response_key: &CipherKey,
        command: &CluCommand,
        target: SocketAddr,
        timeout: Duration,
        limit: usize,
    ) -> Result<Self, TransportError> {
        let socket = CluSocket::bind("0.0.0.0:0".parse().expect("static addr"), true)?;
        let request = Payload::new(
            match target {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "broadcast target must be IPv4",
                    )))
                }
            },
            target.port(),
            request_key.encrypt(&command.serialize()),
        );

        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let response_key = response_key.clone();
        let worker = std::thread::Builder::new()
            .name("clu-broadcast".to_string())
            .spawn(move || collect(socket, request, response_key, timeout, limit, tx))
            .map_err(TransportError::Io)?;

        Ok(Self {
            rx,
            _worker: worker,
        })
    }
}

/// Worker body: one send, then a timed collection loop.
fn collect(
    socket: CluSocket,
    request: Payload,
    response_key: CipherKey,
    timeout: Duration,
    limit: usize,
    tx: mpsc::SyncSender<Payload>,
) {
    if let Err(e) = socket.send(&request) {
        error!(error = %e, "broadcast send failed");
        return;
    }

    let deadline = Instant::now() + timeout;
    let mut seen: HashSet<(std::net::Ipv4Addr, u16, Vec<u8>)> = HashSet::new();
    while seen.len() < limit {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(d) if !d.is_zero() => d,
            _ => break,
        };
        let raw = match socket.try_receive(remaining) {
            Ok(Some(p)) => p,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "broadcast receive failed");
                break;
            }
        };
        let Some(plain) = response_key.decrypt(&raw.bytes) else {
            debug!(from = %raw.address, "broadcast reply did not decrypt, ignoring");
            continue;
        };
        if !seen.insert((raw.address, raw.port, plain.clone())) {
            trace!(from = %raw.address, "duplicate broadcast reply suppressed");
            continue;
        }
        let reply = Payload::new(raw.address, raw.port, plain);
        // Blocks while the queue is full; errors only when the consumer
        // dropped the stream, which ends collection.
        if tx.send(reply).is_err() {
            break;
        }
    }
}

impl Iterator for BroadcastStream {
    type Item = Payload;

    fn next(&mut self) -> Option<Payload> {
        self.rx.recv().ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
