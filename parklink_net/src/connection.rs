// One TCP connection, driven without blocking.
//
// The socket is put in non-blocking mode. `read_incoming` pulls whatever
// bytes are available into a `FrameAssembler` and reports one of:
//
// - `PacketReady`: a complete packet (call again, more may be buffered)
// - `NeedMoreData`: bytes arrived but no complete frame yet
// - `NoData`: nothing to read right now
// - `Disconnected`: the peer closed or the socket failed
// - `Malformed`: a frame could not be decoded
//
// Outgoing packets are encoded into frames and queued. `flush_outbound`
// writes as much as the socket takes and remembers how far into the front
// frame it got. `send_front` puts control traffic (pings) ahead of the
// queue, but never in front of a frame that is already partially written,
// which would corrupt the stream.
//
// The connection also carries per-peer session state: authentication
// progress, the challenge issued to it, the player it maps to, and ping
// timing. Liveness is the time since the last received byte.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use parklink_protocol::{AuthStatus, FrameAssembler, Packet, PlayerId, ProtocolError, encode_frame};

const READ_CHUNK: usize = 64 * 1024;

/// Reason reported when nothing more specific was recorded.
pub const DEFAULT_DISCONNECT_REASON: &str = "connection closed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
pub enum ReadStatus {
    NoData,
    NeedMoreData,
    PacketReady(Packet),
    Disconnected,
    Malformed(ProtocolError),
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    assembler: FrameAssembler,
    outbound: VecDeque<Vec<u8>>,
    /// Bytes of `outbound[0]` already written.
    front_written: usize,
    last_packet_time: Instant,
    disconnect_reason: Option<String>,
    closed: bool,
    /// Close once the outbound queue drains (used after a refusal verdict
    /// or a kick, so the final message still reaches the peer).
    close_after_flush: bool,
    pub auth_status: AuthStatus,
    pub challenge: Vec<u8>,
    pub player: Option<PlayerId>,
    pub ping_sent_at: Option<Instant>,
}

impl Connection {
    pub fn new(id: ConnectionId, stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            id,
            stream,
            peer,
            assembler: FrameAssembler::new(),
            outbound: VecDeque::new(),
            front_written: 0,
            last_packet_time: Instant::now(),
            disconnect_reason: None,
            closed: false,
            close_after_flush: false,
            auth_status: AuthStatus::None,
            challenge: Vec::new(),
            player: None,
            ping_sent_at: None,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_status == AuthStatus::Ok
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read once from the socket and try to complete a packet.
    pub fn read_incoming(&mut self) -> ReadStatus {
        if self.closed {
            return ReadStatus::Disconnected;
        }
        match self.assembler.next_packet() {
            Ok(Some(packet)) => return ReadStatus::PacketReady(packet),
            Ok(None) => {}
            Err(e) => return ReadStatus::Malformed(e),
        }

        let mut buf = [0u8; READ_CHUNK];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                tracing::debug!(connection = %self.id, "peer closed the connection");
                self.closed = true;
                ReadStatus::Disconnected
            }
            Ok(n) => {
                self.assembler.extend(&buf[..n]);
                self.last_packet_time = Instant::now();
                match self.assembler.next_packet() {
                    Ok(Some(packet)) => ReadStatus::PacketReady(packet),
                    Ok(None) => ReadStatus::NeedMoreData,
                    Err(e) => ReadStatus::Malformed(e),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadStatus::NoData,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadStatus::NoData,
            Err(e) => {
                tracing::debug!(connection = %self.id, error = %e, "read failed");
                self.set_disconnect_reason(e.to_string());
                self.closed = true;
                ReadStatus::Disconnected
            }
        }
    }

    /// Queue a packet behind everything already queued.
    pub fn send(&mut self, packet: &Packet) {
        if let Some(frame) = self.frame(packet) {
            self.outbound.push_back(frame);
        }
    }

    /// Queue a packet ahead of everything not yet started.
    pub fn send_front(&mut self, packet: &Packet) {
        let Some(frame) = self.frame(packet) else {
            return;
        };
        let index = if self.front_written > 0 { 1 } else { 0 };
        self.outbound.insert(index.min(self.outbound.len()), frame);
    }

    fn frame(&self, packet: &Packet) -> Option<Vec<u8>> {
        if self.closed {
            return None;
        }
        match encode_frame(packet) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(connection = %self.id, id = ?packet.id(), error = %e, "dropping unsendable packet");
                None
            }
        }
    }

    /// Write queued frames until the socket would block. An error means
    /// the connection is dead.
    pub fn flush_outbound(&mut self) -> io::Result<()> {
        while let Some(frame) = self.outbound.front() {
            match self.stream.write(&frame[self.front_written..]) {
                Ok(0) => {
                    self.closed = true;
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no data"));
                }
                Ok(n) => {
                    self.front_written += n;
                    if self.front_written == frame.len() {
                        self.outbound.pop_front();
                        self.front_written = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.set_disconnect_reason(e.to_string());
                    self.closed = true;
                    return Err(e);
                }
            }
        }
        if self.close_after_flush && self.outbound.is_empty() {
            self.close();
        }
        Ok(())
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Close as soon as everything queued so far has been written.
    pub fn close_after_flush(&mut self, reason: impl Into<String>) {
        self.set_disconnect_reason(reason);
        self.close_after_flush = true;
    }

    pub fn is_closing(&self) -> bool {
        self.close_after_flush
    }

    pub fn received_recently(&self, window: Duration) -> bool {
        self.last_packet_time.elapsed() < window
    }

    pub fn last_packet_time(&self) -> Instant {
        self.last_packet_time
    }

    pub fn set_disconnect_reason(&mut self, reason: impl Into<String>) {
        self.disconnect_reason = Some(reason.into());
    }

    pub fn disconnect_reason(&self) -> &str {
        self.disconnect_reason
            .as_deref()
            .unwrap_or(DEFAULT_DISCONNECT_REASON)
    }

    /// Shut the socket down and drop anything still queued.
    pub fn close(&mut self) {
        if self.closed && self.outbound.is_empty() {
            return;
        }
        self.outbound.clear();
        self.front_written = 0;
        self.closed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
        tracing::debug!(connection = %self.id, reason = self.disconnect_reason(), "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use parklink_protocol::CommandId;

    /// A connected (client, server) pair over localhost.
    fn tcp_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            Connection::new(ConnectionId(1), client).unwrap(),
            Connection::new(ConnectionId(2), server).unwrap(),
        )
    }

    fn flush_all(conn: &mut Connection) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.pending_outbound() > 0 {
            conn.flush_outbound().unwrap();
            assert!(Instant::now() < deadline, "flush timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn next_packet(conn: &mut Connection) -> Packet {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.read_incoming() {
                ReadStatus::PacketReady(p) => return p,
                ReadStatus::NoData | ReadStatus::NeedMoreData => {
                    assert!(Instant::now() < deadline, "no packet arrived");
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => panic!("unexpected read status {other:?}"),
            }
        }
    }

    fn chat(text: &str) -> Packet {
        let mut p = Packet::new(CommandId::Chat);
        p.write_string(text);
        p
    }

    #[test]
    fn packets_arrive_in_order() {
        let (mut a, mut b) = tcp_pair();
        a.send(&chat("one"));
        a.send(&chat("two"));
        flush_all(&mut a);
        assert_eq!(next_packet(&mut b).read_string(), "one");
        assert_eq!(next_packet(&mut b).read_string(), "two");
        assert!(matches!(b.read_incoming(), ReadStatus::NoData));
    }

    #[test]
    fn front_insert_jumps_the_queue() {
        let (mut a, mut b) = tcp_pair();
        a.send(&chat("bulk"));
        a.send_front(&Packet::new(CommandId::Ping));
        flush_all(&mut a);
        assert_eq!(next_packet(&mut b).id(), CommandId::Ping);
        assert_eq!(next_packet(&mut b).id(), CommandId::Chat);
    }

    #[test]
    fn large_packet_survives_partial_reads() {
        let (mut a, mut b) = tcp_pair();
        let blob: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let mut p = Packet::new(CommandId::Map);
        p.write_bytes(&blob);
        a.send(&p);

        // Interleave flushing and reading so neither side's buffer fills.
        let deadline = Instant::now() + Duration::from_secs(5);
        let received = loop {
            a.flush_outbound().unwrap();
            match b.read_incoming() {
                ReadStatus::PacketReady(p) => break p,
                ReadStatus::NoData | ReadStatus::NeedMoreData => {
                    assert!(Instant::now() < deadline);
                }
                other => panic!("unexpected read status {other:?}"),
            }
        };
        assert_eq!(received.payload(), blob.as_slice());
    }

    #[test]
    fn peer_close_reports_default_reason() {
        let (a, mut b) = tcp_pair();
        drop(a);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match b.read_incoming() {
                ReadStatus::Disconnected => break,
                ReadStatus::NoData => assert!(Instant::now() < deadline),
                other => panic!("unexpected read status {other:?}"),
            }
        }
        assert!(b.is_closed());
        assert_eq!(b.disconnect_reason(), DEFAULT_DISCONNECT_REASON);
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut raw = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut conn = Connection::new(ConnectionId(9), server).unwrap();

        raw.write_all(&u32::MAX.to_le_bytes()).unwrap();
        raw.write_all(&[0; 8]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.read_incoming() {
                ReadStatus::Malformed(e) => {
                    assert!(e.is_fatal());
                    break;
                }
                ReadStatus::NoData | ReadStatus::NeedMoreData => assert!(Instant::now() < deadline),
                other => panic!("unexpected read status {other:?}"),
            }
        }
    }

    #[test]
    fn close_after_flush_delivers_then_closes() {
        let (mut a, mut b) = tcp_pair();
        a.send(&chat("bye"));
        a.close_after_flush("kicked");
        flush_all(&mut a);
        assert!(a.is_closed());
        assert_eq!(a.disconnect_reason(), "kicked");
        assert_eq!(next_packet(&mut b).read_string(), "bye");
    }

    #[test]
    fn liveness_window() {
        let (a, _b) = tcp_pair();
        assert!(a.received_recently(Duration::from_secs(60)));
        assert!(!a.received_recently(Duration::ZERO));
    }
}
