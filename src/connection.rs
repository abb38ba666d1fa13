//! Transport abstraction over a single remote peer, and the
//! proxy/route/callee slot manager built on top of it.
//!
//! Grounded on `original_source/WiPhone/tinySIP.h`'s `Connection`,
//! `UDP_SIPConnection`/`TCP_SIPConnection`, and `ensureIpConnection`, and
//! spec §4.3. The teacher's `transport/udp.rs`/`transport/tcp.rs` are
//! `tokio`-async; this crate's engine is a synchronous, non-reentrant
//! `poll(now_ms)` (spec §5), so the transport here is plain non-blocking
//! `std::net`, polled the same way.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write as IoWrite};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::rc::Rc;
use std::time::Duration;

/// A connection is stale iff pinged twice since the last pong and the gap
/// between the last ping and last pong exceeds this threshold.
pub const STALE_CONNECTION_MS: u64 = 10_000;
/// Back-off duration after a failed connect attempt, per spec §4.3/§7.
pub const CONNECT_BACKOFF_MS: u64 = 10_000;

const PEEK_BUF_LEN: usize = 2001;

/// Transport kind for a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
}

enum Medium {
    Udp { socket: UdpSocket, target: SocketAddr },
    Tcp { stream: TcpStream },
}

impl std::fmt::Debug for Medium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Medium::Udp { .. } => f.write_str("Medium::Udp"),
            Medium::Tcp { .. } => f.write_str("Medium::Tcp"),
        }
    }
}

/// A single transport connection to one remote peer, with RFC 5626
/// ping/pong liveness bookkeeping.
#[derive(Debug)]
pub struct Connection {
    kind: TransportKind,
    medium: Medium,
    remote: SocketAddr,
    local_port: u16,
    connected: bool,

    pub ms_last_connected: u64,
    pub ms_last_received: u64,
    pub ms_last_ping: u64,
    pub ms_last_pong: u64,
    pub pinged: bool,
    pub re_pinged: bool,
    pub ever_ponged: bool,
}

impl Connection {
    /// Opens a new connection of `kind` to `remote`, honoring `timeout` for
    /// the initial attempt (spec §5: 500ms for initial proxy attach, 5000ms
    /// for later resolutions — callers choose the value).
    pub fn connect(kind: TransportKind, remote: SocketAddr, timeout: Duration, now_ms: u64) -> io::Result<Self> {
        let (medium, local_port) = match kind {
            TransportKind::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", 0))?;
                socket.connect(remote)?;
                socket.set_nonblocking(true)?;
                let local_port = socket.local_addr()?.port();
                (Medium::Udp { socket, target: remote }, local_port)
            }
            TransportKind::Tcp => {
                let stream = TcpStream::connect_timeout(&remote, timeout)?;
                stream.set_nonblocking(true)?;
                let local_port = stream.local_addr()?.port();
                (Medium::Tcp { stream }, local_port)
            }
        };

        Ok(Self {
            kind,
            medium,
            remote,
            local_port,
            connected: true,
            ms_last_connected: now_ms,
            ms_last_received: 0,
            ms_last_ping: 0,
            ms_last_pong: 0,
            pinged: false,
            re_pinged: false,
            ever_ponged: false,
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The transport's own connectivity opinion.
    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn stop(&mut self) {
        self.connected = false;
    }

    /// For UDP: sets the destination of the next [`Connection::write`]. A
    /// no-op for TCP (kept for API parity with the Arduino-style
    /// begin/write/end packet sequence in the original).
    pub fn begin_packet(&mut self, addr: SocketAddr) {
        if let Medium::Udp { target, .. } = &mut self.medium {
            *target = addr;
        }
    }

    /// Finalizes a UDP packet. A no-op here since [`Connection::write`]
    /// transmits immediately; kept for API symmetry with `begin_packet`.
    pub fn end_packet(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Bytes available to read without blocking (0 if none, per spec §5).
    pub fn available(&self) -> usize {
        let mut scratch = [0u8; PEEK_BUF_LEN];
        let res = match &self.medium {
            Medium::Udp { socket, .. } => socket.peek(&mut scratch),
            Medium::Tcp { stream } => stream.peek(&mut scratch),
        };
        res.unwrap_or(0)
    }

    /// Reads up to `buf.len()` bytes, updating `ms_last_received` on a
    /// non-empty read.
    pub fn read(&mut self, buf: &mut [u8], now_ms: u64) -> io::Result<usize> {
        let res = match &mut self.medium {
            Medium::Udp { socket, .. } => socket.recv(buf),
            Medium::Tcp { stream } => stream.read(buf),
        };
        if let Ok(n) = res {
            if n > 0 {
                self.ms_last_received = now_ms;
            }
        }
        res
    }

    /// Writes `buf` in full (best-effort, per spec §5's small-message
    /// assumption).
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.medium {
            Medium::Udp { socket, target } => socket.send_to(buf, *target),
            Medium::Tcp { stream } => stream.write(buf),
        }
    }

    /// RFC 5626 §4.4.1 staleness predicate (spec §4.3).
    pub fn is_stale(&self) -> bool {
        self.ever_ponged
            && self.pinged
            && self.re_pinged
            && self.ms_last_ping.saturating_sub(self.ms_last_pong) > STALE_CONNECTION_MS
    }
}

/// Which role a connection plays for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The registrar/outbound-proxy connection.
    Proxy,
    /// The first hop of the dialog's route set, when different from the
    /// proxy.
    Route,
    /// A direct connection to the callee, when routing allows it.
    Callee,
}

/// Owns the proxy/route/callee connection slots and the
/// `ensure_ip_connection` reuse/backoff policy from spec §4.3.
pub struct ConnectionManager {
    pub transport_pref: TransportKind,
    slots: HashMap<Slot, Rc<RefCell<Connection>>>,
    backoff_until: HashMap<Slot, u64>,
}

impl ConnectionManager {
    pub fn new(transport_pref: TransportKind) -> Self {
        Self {
            transport_pref,
            slots: HashMap::new(),
            backoff_until: HashMap::new(),
        }
    }

    pub fn get(&self, slot: Slot) -> Option<Rc<RefCell<Connection>>> {
        self.slots.get(&slot).cloned()
    }

    /// Ensures `slot` holds a live connection to `(ip, port)`, per spec
    /// §4.3: reuse if the existing connection already satisfies the
    /// request; otherwise tear down and reconnect, entering a back-off
    /// window on failure. Non-proxy slots alias to the live proxy
    /// connection when they target the same address.
    pub fn ensure_ip_connection(
        &mut self,
        slot: Slot,
        ip: IpAddr,
        port: u16,
        force_renew: bool,
        timeout: Duration,
        now_ms: u64,
    ) -> io::Result<Rc<RefCell<Connection>>> {
        let target = SocketAddr::new(ip, port);

        if !force_renew {
            if let Some(conn) = self.slots.get(&slot) {
                let satisfies = {
                    let c = conn.borrow();
                    c.remote() == target && c.connected() && !c.is_stale()
                };
                if satisfies {
                    return Ok(conn.clone());
                }
            }
        }

        if slot != Slot::Proxy {
            if let Some(proxy) = self.slots.get(&Slot::Proxy) {
                let aliasable = {
                    let p = proxy.borrow();
                    p.remote() == target && p.connected()
                };
                if aliasable {
                    self.slots.insert(slot, proxy.clone());
                    return Ok(proxy.clone());
                }
            }
        }

        if let Some(&until) = self.backoff_until.get(&slot) {
            if now_ms < until {
                if let Some(conn) = self.slots.get(&slot) {
                    return Ok(conn.clone());
                }
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "in back-off"));
            }
        }

        self.slots.remove(&slot);

        match Connection::connect(self.transport_pref, target, timeout, now_ms) {
            Ok(conn) => {
                self.backoff_until.remove(&slot);
                let conn = Rc::new(RefCell::new(conn));
                self.slots.insert(slot, conn.clone());
                Ok(conn)
            }
            Err(err) => {
                self.backoff_until.insert(slot, now_ms + CONNECT_BACKOFF_MS);
                Err(err)
            }
        }
    }

    pub fn teardown(&mut self, slot: Slot) {
        if let Some(conn) = self.slots.remove(&slot) {
            conn.borrow_mut().stop();
        }
    }
}

/// Resolves `host` to an `IpAddr` via A/AAAA records only (spec §9 note 4:
/// NAPTR/SRV resolution is an explicit Non-goal here).
pub fn resolve_host(host: &str, default_port: u16) -> io::Result<IpAddr> {
    (host, default_port)
        .to_socket_addrs()?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address found for host"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_udp_peer() -> (UdpSocket, SocketAddr) {
        let sock = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    #[test]
    fn udp_write_then_read_round_trips() {
        let (peer, peer_addr) = loopback_udp_peer();
        let mut conn = Connection::connect(TransportKind::Udp, peer_addr, Duration::from_millis(500), 0).unwrap();

        conn.write(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", from).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(conn.available() > 0);
        let n = conn.read(&mut buf, 100).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(conn.ms_last_received, 100);
    }

    #[test]
    fn staleness_requires_two_pings_and_elapsed_gap() {
        let (peer, peer_addr) = loopback_udp_peer();
        drop(peer);
        let mut conn = Connection::connect(TransportKind::Udp, peer_addr, Duration::from_millis(500), 0).unwrap();
        assert!(!conn.is_stale());

        conn.ever_ponged = true;
        conn.pinged = true;
        conn.re_pinged = true;
        conn.ms_last_ping = 20_000;
        conn.ms_last_pong = 0;
        assert!(conn.is_stale());

        conn.ms_last_pong = 15_000;
        assert!(!conn.is_stale());
    }

    #[test]
    fn ensure_ip_connection_reuses_live_connection() {
        let (peer, peer_addr) = loopback_udp_peer();
        let mut mgr = ConnectionManager::new(TransportKind::Udp);
        let c1 = mgr
            .ensure_ip_connection(Slot::Proxy, peer_addr.ip(), peer_addr.port(), false, Duration::from_millis(500), 0)
            .unwrap();
        let c2 = mgr
            .ensure_ip_connection(Slot::Proxy, peer_addr.ip(), peer_addr.port(), false, Duration::from_millis(500), 10)
            .unwrap();
        assert!(Rc::ptr_eq(&c1, &c2));
        drop(peer);
    }

    #[test]
    fn ensure_ip_connection_aliases_non_proxy_slot_to_proxy() {
        let (peer, peer_addr) = loopback_udp_peer();
        let mut mgr = ConnectionManager::new(TransportKind::Udp);
        let proxy = mgr
            .ensure_ip_connection(Slot::Proxy, peer_addr.ip(), peer_addr.port(), false, Duration::from_millis(500), 0)
            .unwrap();
        let callee = mgr
            .ensure_ip_connection(Slot::Callee, peer_addr.ip(), peer_addr.port(), false, Duration::from_millis(500), 0)
            .unwrap();
        assert!(Rc::ptr_eq(&proxy, &callee));
        drop(peer);
    }

    #[test]
    fn failed_connect_enters_backoff() {
        // Port 0 resolved to an address with nothing listening should fail
        // fast enough for TCP connect_timeout. Use a closed TCP port.
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener); // now nothing is listening on `addr`

        let mut mgr = ConnectionManager::new(TransportKind::Tcp);
        let first = mgr.ensure_ip_connection(Slot::Proxy, addr.ip(), addr.port(), false, Duration::from_millis(200), 0);
        assert!(first.is_err());

        let second = mgr.ensure_ip_connection(Slot::Proxy, addr.ip(), addr.port(), false, Duration::from_millis(200), 100);
        assert!(second.is_err());
        assert_eq!(mgr.backoff_until[&Slot::Proxy], CONNECT_BACKOFF_MS);
    }
}
