//! UDP transport wrapper with bounded-wait receive semantics.
//!
//! [`CluSocket`] wraps a blocking `std::net::UdpSocket` behind a mutex so one
//! socket can be shared between a listener thread and reply senders. Receive
//! never blocks forever: every call carries an explicit timeout and reports
//! expiry as `Ok(None)` rather than an error, which lets callers run
//! poll loops with a shrinking deadline budget.
//!
//! # How the timed receive works (for beginners)
//!
//! UDP (User Datagram Protocol) is connectionless: a plain `recv_from` waits
//! for the next datagram, forever if none arrives.  To keep every wait
//! bounded, the socket is reconfigured before each receive:
//!
//! 1. `set_read_timeout` tells the OS to abort the blocking `recv_from`
//!    once the duration elapses.  The abort surfaces as an `io::Error` of
//!    kind `WouldBlock` or `TimedOut`, depending on the platform.
//!
//! 2. [`CluSocket::try_receive`] maps that error to `Ok(None)`, so "nothing
//!    arrived" becomes an ordinary value instead of a failure path.
//!
//! 3. Callers loop with a deadline: each pass computes the time remaining
//!    and passes it as the next timeout.  When the remainder reaches zero
//!    the loop ends, and a shutdown flag can be checked between passes.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

/// Largest datagram the protocol produces. Frames are short except for Lua
/// scripts, which are still bounded well below this.
const MAX_DATAGRAM: usize = 2048;

/// Smallest timeout the OS socket layer accepts; zero means "block forever"
/// on `set_read_timeout`, which is exactly what we must avoid.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// One inbound or outbound datagram: the remote IPv4 endpoint plus the raw
/// (encrypted) frame bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub address: Ipv4Addr,
    pub port: u16,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn new(address: Ipv4Addr, port: u16, bytes: Vec<u8>) -> Self {
        Self { address, port, bytes }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.address), self.port)
    }
}

/// Shared UDP socket with timed receive.
#[derive(Debug)]
pub struct CluSocket {
    inner: Mutex<UdpSocket>,
}

impl CluSocket {
    /// Binds a UDP socket on `addr`. `broadcast` additionally enables sending
    /// to the subnet broadcast address (needed by discovery senders).
    pub fn bind(addr: SocketAddr, broadcast: bool) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        if broadcast {
            socket.set_broadcast(true)?;
        }
        Ok(Self {
            inner: Mutex::new(socket),
        })
    }

    /// The locally bound address (useful after binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.lock().local_addr()?)
    }

    /// Sends one datagram to the payload's endpoint.
    pub fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        self.lock().send_to(&payload.bytes, payload.socket_addr())?;
        Ok(())
    }

    /// Waits up to `timeout` for one datagram. Returns `Ok(None)` when the
    /// timeout expires with nothing received; non-IPv4 senders are dropped
    /// the same way.
    pub fn try_receive(&self, timeout: Duration) -> Result<Option<Payload>, TransportError> {
        let socket = self.lock();
        socket.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        let mut buf = [0u8; MAX_DATAGRAM];
        match socket.recv_from(&mut buf) {
            Ok((len, SocketAddr::V4(remote))) => Ok(Some(Payload::new(
                *remote.ip(),
                remote.port(),
                buf[..len].to_vec(),
            ))),
            Ok((_, SocketAddr::V6(_))) => Ok(None),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Drains any datagrams already queued on the socket without waiting.
    /// Called before a request so a stale reply cannot be mistaken for the
    /// fresh one.
    pub fn discard(&self) -> Result<(), TransportError> {
        let socket = self.lock();
        socket.set_nonblocking(true)?;
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf) {
                Ok(_) => continue,
                Err(e) if is_timeout(&e) => break,
                Err(e) => {
                    socket.set_nonblocking(false)?;
                    return Err(e.into());
                }
            }
        }
        socket.set_nonblocking(false)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UdpSocket> {
        // A poisoned socket mutex means a holder panicked mid-syscall; the
        // socket itself is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Both `WouldBlock` and `TimedOut` signal timeout depending on platform.
fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
