//! KCP transport adapter
//!
//! Owns the UDP socket and one ARQ engine per peer, and narrows everything
//! down to the event surface the relay core consumes: `Connected`,
//! `Data(channel)`, `Disconnected`, `Error`. A single driver task owns all
//! per-connection state, so events reach the core in order per connection
//! without any locking around the engines.
//!
//! Datagram framing: a leading channel byte. `1` carries a raw KCP segment
//! (the reliable channel), `2` carries an application frame verbatim (the
//! unreliable channel). Inside the reliable stream one KCP message is one
//! adapter frame: `[opcode][payload]` with Hello/Ping/Data/Disconnect
//! opcodes; only Data reaches the core.

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::wire::ConnectionId;

use bytes::{Buf, Bytes};
use kcp::Kcp;
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Datagram channel byte for reliable (KCP) traffic
pub const CHANNEL_RELIABLE: u8 = 1;
/// Datagram channel byte for unreliable traffic
pub const CHANNEL_UNRELIABLE: u8 = 2;

/// Size of a raw KCP segment header
const KCP_OVERHEAD: usize = 24;

/// Reliable-stream opcodes
mod opcode {
    pub const HELLO: u8 = 1;
    pub const PING: u8 = 2;
    pub const DATA: u8 = 3;
    pub const DISCONNECT: u8 = 4;
}

/// Keep-alive cadence for connections with no outbound traffic
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Sub-channel an application frame travelled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Reliable,
    Unreliable,
}

/// Event surfaced to the relay core
#[derive(Debug)]
pub enum TransportEvent {
    Connected(ConnectionId),
    Data(ConnectionId, Channel, Bytes),
    Disconnected(ConnectionId),
    Error(ConnectionId, RelayError),
}

enum Command {
    Send {
        conn: ConnectionId,
        channel: Channel,
        data: Bytes,
    },
    Disconnect {
        conn: ConnectionId,
    },
    Shutdown,
}

/// Outbound operations the relay core performs on the transport.
///
/// The trait is the seam between the core and the wire; tests substitute a
/// recording implementation.
pub trait SessionLink: Send + Sync + 'static {
    /// Enqueue `data` to `conn`; returns immediately
    fn send(&self, conn: ConnectionId, channel: Channel, data: Bytes);
    /// Tear the connection down; a `Disconnected` event follows
    fn disconnect(&self, conn: ConnectionId);
}

/// Command-channel handle implementing [`SessionLink`] for the driver task
#[derive(Clone)]
pub struct KcpTransportHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionLink for KcpTransportHandle {
    fn send(&self, conn: ConnectionId, channel: Channel, data: Bytes) {
        // A closed channel means the driver is gone; nothing left to tell.
        let _ = self.commands.send(Command::Send {
            conn,
            channel,
            data,
        });
    }

    fn disconnect(&self, conn: ConnectionId) {
        let _ = self.commands.send(Command::Disconnect { conn });
    }
}

/// Bound KCP transport: the driver task plus its event stream
pub struct KcpTransport {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    handle: KcpTransportHandle,
    driver: Option<tokio::task::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl KcpTransport {
    /// Bind the UDP socket and start the driver task
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let bind_addr: SocketAddr = if config.kcp_dual_mode {
            format!("[::]:{}", config.kcp_port)
        } else {
            format!("0.0.0.0:{}", config.kcp_port)
        }
        .parse()
        .map_err(|_| RelayError::config("invalid KCP bind address"))?;

        let socket = UdpSocket::bind(bind_addr).await.map_err(RelayError::Io)?;
        let local_addr = socket.local_addr().map_err(RelayError::Io)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            socket: Arc::new(socket),
            events: event_tx,
            conns: HashMap::new(),
            by_addr: HashMap::new(),
            next_id: 1,
            clock: Instant::now(),
            nodelay: config.kcp_nodelay,
            interval: config.kcp_interval,
            fast_resend: config.kcp_fast_resend,
            send_window: config.kcp_send_window_size,
            receive_window: config.kcp_receive_window_size,
            idle_timeout: config.idle_timeout(),
            dead_link_after: Duration::from_millis(
                u64::from(config.kcp_interval) * u64::from(config.kcp_max_retransmit),
            ),
            // One datagram never exceeds 64 KiB; anything larger is OS
            // socket-buffer intent.
            recv_buffer_size: config.kcp_recv_buffer_size.min(64 * 1024),
        };
        let tick = Duration::from_millis(u64::from(config.kcp_interval));
        let task = tokio::spawn(driver.run(command_rx, tick));

        info!(addr = %local_addr, "KCP transport bound");
        Ok(Self {
            events: event_rx,
            handle: KcpTransportHandle {
                commands: command_tx,
            },
            driver: Some(task),
            local_addr,
        })
    }

    /// Cloneable outbound handle
    pub fn handle(&self) -> KcpTransportHandle {
        self.handle.clone()
    }

    /// Take the event stream; the relay core owns it from here
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        std::mem::replace(&mut self.events, mpsc::unbounded_channel().1)
    }

    /// Receive the next event (useful in tests; the server uses
    /// [`take_events`](Self::take_events))
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flush a disconnect to every peer and stop the driver. Commands queued
    /// before this call are processed first.
    pub async fn shutdown(mut self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        if let Some(task) = self.driver.take() {
            let _ = task.await;
        }
        info!(addr = %self.local_addr, "KCP transport stopped");
    }
}

impl Drop for KcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.driver.take() {
            let _ = self.handle.commands.send(Command::Shutdown);
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Driver internals
// ---------------------------------------------------------------------------

/// KCP output sink: wraps each segment in the reliable channel byte and
/// fires it at the peer. `WouldBlock` drops the datagram; the ARQ layer
/// retransmits.
struct DatagramSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl Write for DatagramSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut packet = Vec::with_capacity(data.len() + 1);
        packet.push(CHANNEL_RELIABLE);
        packet.extend_from_slice(data);
        match self.socket.try_send_to(&packet, self.peer) {
            Ok(_) => Ok(data.len()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(data.len()),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Conn {
    id: ConnectionId,
    addr: SocketAddr,
    kcp: Kcp<DatagramSink>,
    last_recv: Instant,
    last_ping: Instant,
    greeted: bool,
    // Dead-link tracking: the last time the send queue was empty or shrank.
    send_progress: Instant,
    last_wait_snd: usize,
}

struct Driver {
    socket: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<TransportEvent>,
    conns: HashMap<ConnectionId, Conn>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    next_id: ConnectionId,
    clock: Instant,
    nodelay: bool,
    interval: u32,
    fast_resend: u32,
    send_window: u16,
    receive_window: u16,
    idle_timeout: Duration,
    dead_link_after: Duration,
    recv_buffer_size: usize,
}

enum Pump {
    Keep,
    Remove,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut datagram = vec![0u8; self.recv_buffer_size];
        let mut frame = vec![0u8; 64 * 1024];
        let socket = self.socket.clone();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Send { conn, channel, data }) => {
                            self.handle_send(conn, channel, data);
                        }
                        Some(Command::Disconnect { conn }) => {
                            self.handle_disconnect(conn);
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                received = socket.recv_from(&mut datagram) => {
                    match received {
                        Ok((len, addr)) => self.handle_datagram(&datagram[..len], addr, &mut frame),
                        Err(e) => {
                            // Per-peer ICMP errors surface here on some
                            // platforms; the socket itself is still fine.
                            warn!(error = %e, "UDP receive failed");
                        }
                    }
                }
                _ = ticker.tick() => self.handle_tick(),
            }
        }

        self.drain();
    }

    fn now_ms(&self) -> u32 {
        self.clock.elapsed().as_millis() as u32
    }

    fn handle_datagram(&mut self, datagram: &[u8], addr: SocketAddr, frame: &mut Vec<u8>) {
        if datagram.len() < 2 {
            trace!(peer = %addr, "runt datagram dropped");
            return;
        }
        match datagram[0] {
            CHANNEL_RELIABLE => self.handle_reliable(&datagram[1..], addr, frame),
            CHANNEL_UNRELIABLE => {
                // Unknown peers cannot open a connection unreliably.
                if let Some(&id) = self.by_addr.get(&addr) {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.last_recv = Instant::now();
                    }
                    let data = Bytes::copy_from_slice(&datagram[1..]);
                    let _ = self
                        .events
                        .send(TransportEvent::Data(id, Channel::Unreliable, data));
                } else {
                    trace!(peer = %addr, "unreliable datagram from unknown peer dropped");
                }
            }
            other => trace!(peer = %addr, channel = other, "unknown channel byte dropped"),
        }
    }

    fn handle_reliable(&mut self, segment: &[u8], addr: SocketAddr, frame: &mut Vec<u8>) {
        if segment.len() < KCP_OVERHEAD {
            trace!(peer = %addr, len = segment.len(), "short KCP segment dropped");
            return;
        }

        let id = match self.by_addr.get(&addr) {
            Some(&id) => id,
            None => {
                // First segment from a new peer carries the conversation id
                // in its header; adopt it.
                let mut header = &segment[0..4];
                let conv = header.get_u32_le();
                self.open_conn(addr, conv)
            }
        };

        let now = self.now_ms();
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        conn.last_recv = Instant::now();
        if let Err(e) = conn.kcp.input(segment) {
            debug!(conn = id, peer = %addr, error = %e, "KCP input rejected");
            return;
        }
        let _ = conn.kcp.update(now);
        let _ = conn.kcp.flush();

        match Self::pump(conn, &self.events, frame) {
            Pump::Keep => {}
            Pump::Remove => self.drop_conn(id, "peer disconnect"),
        }
    }

    fn open_conn(&mut self, addr: SocketAddr, conv: u32) -> ConnectionId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let sink = DatagramSink {
            socket: self.socket.clone(),
            peer: addr,
        };
        let mut kcp = Kcp::new(conv, sink);
        kcp.set_wndsize(self.send_window, self.receive_window);
        kcp.set_nodelay(
            self.nodelay,
            self.interval as i32,
            self.fast_resend as i32,
            true,
        );

        let now = Instant::now();
        self.conns.insert(
            id,
            Conn {
                id,
                addr,
                kcp,
                last_recv: now,
                last_ping: now,
                greeted: false,
                send_progress: now,
                last_wait_snd: 0,
            },
        );
        self.by_addr.insert(addr, id);
        debug!(conn = id, peer = %addr, conv, "connection opened");
        id
    }

    /// Drain every completed KCP message from a connection
    fn pump(conn: &mut Conn, events: &mpsc::UnboundedSender<TransportEvent>, frame: &mut Vec<u8>) -> Pump {
        loop {
            let size = match conn.kcp.peeksize() {
                Ok(size) => size,
                Err(_) => return Pump::Keep,
            };
            if frame.len() < size {
                frame.resize(size, 0);
            }
            let len = match conn.kcp.recv(&mut frame[..]) {
                Ok(len) => len,
                Err(_) => return Pump::Keep,
            };
            if len == 0 {
                continue;
            }

            let (op, payload) = (frame[0], &frame[1..len]);
            match op {
                opcode::HELLO => {
                    if !conn.greeted {
                        conn.greeted = true;
                        Self::send_frame(conn, opcode::HELLO, &[]);
                        let _ = events.send(TransportEvent::Connected(conn.id));
                    }
                }
                opcode::PING => {
                    Self::send_frame(conn, opcode::PING, &[]);
                }
                opcode::DATA => {
                    if !conn.greeted {
                        // Data before the hello still implies a live peer.
                        conn.greeted = true;
                        let _ = events.send(TransportEvent::Connected(conn.id));
                    }
                    let _ = events.send(TransportEvent::Data(
                        conn.id,
                        Channel::Reliable,
                        Bytes::copy_from_slice(payload),
                    ));
                }
                opcode::DISCONNECT => return Pump::Remove,
                other => {
                    warn!(conn = conn.id, opcode = other, "unknown stream opcode ignored");
                }
            }
        }
    }

    fn send_frame(conn: &mut Conn, op: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(op);
        frame.extend_from_slice(payload);
        if let Err(e) = conn.kcp.send(&frame) {
            warn!(conn = conn.id, error = %e, "KCP send failed");
        }
    }

    fn handle_send(&mut self, id: ConnectionId, channel: Channel, data: Bytes) {
        let now = self.now_ms();
        let Some(conn) = self.conns.get_mut(&id) else {
            trace!(conn = id, "send to unknown connection dropped");
            return;
        };
        match channel {
            Channel::Reliable => {
                Self::send_frame(conn, opcode::DATA, &data);
                let _ = conn.kcp.update(now);
                let _ = conn.kcp.flush();
            }
            Channel::Unreliable => {
                let mut packet = Vec::with_capacity(data.len() + 1);
                packet.push(CHANNEL_UNRELIABLE);
                packet.extend_from_slice(&data);
                if let Err(e) = self.socket.try_send_to(&packet, conn.addr) {
                    trace!(conn = id, error = %e, "unreliable send dropped");
                }
            }
        }
    }

    fn handle_disconnect(&mut self, id: ConnectionId) {
        let now = self.now_ms();
        if let Some(conn) = self.conns.get_mut(&id) {
            // Best-effort goodbye so well-behaved peers tear down fast.
            Self::send_frame(conn, opcode::DISCONNECT, &[]);
            let _ = conn.kcp.update(now);
            let _ = conn.kcp.flush();
        }
        self.drop_conn(id, "local disconnect");
    }

    fn handle_tick(&mut self) {
        let now_ms = self.now_ms();
        let now = Instant::now();
        let mut dead: Vec<(ConnectionId, Option<RelayError>)> = Vec::new();

        for conn in self.conns.values_mut() {
            let _ = conn.kcp.update(now_ms);

            let wait = conn.kcp.wait_snd();
            if wait == 0 || wait < conn.last_wait_snd {
                conn.send_progress = now;
            }
            conn.last_wait_snd = wait;

            if now.duration_since(conn.last_recv) > self.idle_timeout {
                dead.push((conn.id, None));
                continue;
            }
            if conn.kcp.is_dead_link()
                || (wait > 0 && now.duration_since(conn.send_progress) > self.dead_link_after)
            {
                dead.push((
                    conn.id,
                    Some(RelayError::transport("retransmission limit reached")),
                ));
                continue;
            }
            if conn.greeted && now.duration_since(conn.last_ping) >= PING_INTERVAL {
                conn.last_ping = now;
                Self::send_frame(conn, opcode::PING, &[]);
            }
        }

        for (id, error) in dead {
            if let Some(error) = error {
                warn!(conn = id, error = %error, "dead link");
                let _ = self.events.send(TransportEvent::Error(id, error));
            } else {
                debug!(conn = id, "idle timeout");
            }
            self.drop_conn(id, "liveness check");
        }
    }

    fn drop_conn(&mut self, id: ConnectionId, why: &str) {
        if let Some(conn) = self.conns.remove(&id) {
            self.by_addr.remove(&conn.addr);
            debug!(conn = id, peer = %conn.addr, why, "connection dropped");
            let _ = self.events.send(TransportEvent::Disconnected(id));
        }
    }

    /// Shutdown path: best-effort disconnect to every peer, no events
    fn drain(&mut self) {
        let now = self.now_ms();
        for conn in self.conns.values_mut() {
            Self::send_frame(conn, opcode::DISCONNECT, &[]);
            let _ = conn.kcp.update(now);
            let _ = conn.kcp.flush();
        }
        self.conns.clear();
        self.by_addr.clear();
    }
}
