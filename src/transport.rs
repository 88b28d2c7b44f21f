//! Transport collaborator
//!
//! The login code never touches sockets directly. It talks to a
//! [`Transport`], which frames whole PDUs on top of some byte stream.
//! [`TcpTransport`] is the software TCP implementation used by the daemon;
//! tests plug in scripted transports.

use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{self, IscsiPdu, BHS_SIZE};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

/// Well-known iSCSI port
pub const ISCSI_LISTEN_PORT: u16 = 3260;

/// Network portal: host name or address plus TCP port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Portal {
    /// Host name or address, IPv6 literals without brackets
    pub host: String,
    pub port: u16,
}

impl Portal {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Portal {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`; IPv6 literals must be bracketed when a port is given
    pub fn parse(s: &str) -> IscsiResult<Self> {
        let bad = || IscsiError::Config(format!("invalid portal address {:?}", s));

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let close = rest.find(']').ok_or_else(bad)?;
            let host = &rest[..close];
            let port = match &rest[close + 1..] {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(bad)?),
            };
            (host, port)
        } else if s.matches(':').count() > 1 {
            // Bare IPv6 literal, no port
            (s, None)
        } else {
            match s.split_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (s, None),
            }
        };

        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == ',') {
            return Err(bad());
        }
        let port = match port {
            Some(p) => match p.parse::<u16>() {
                Ok(v) if v != 0 => v,
                _ => return Err(bad()),
            },
            None => ISCSI_LISTEN_PORT,
        };

        Ok(Portal::new(host, port))
    }

    pub fn resolve(&self) -> IscsiResult<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| IscsiError::Config(format!("{} did not resolve", self)))
    }
}

impl fmt::Display for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Portal {
    type Err = IscsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Portal::parse(s)
    }
}

/// Parse a `TargetAddress` value: `host[:port][,tpgt]`
pub fn parse_target_address(value: &str) -> IscsiResult<(Portal, Option<u16>)> {
    let (addr, tpgt) = match value.rsplit_once(',') {
        Some((addr, tag)) => {
            let tag = tag.parse::<u16>().map_err(|_| {
                IscsiError::Config(format!("invalid portal group tag in {:?}", value))
            })?;
            (addr, Some(tag))
        }
        None => (value, None),
    };
    Ok((Portal::parse(addr)?, tpgt))
}

/// Result of polling a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Connect still in progress, or nothing to read yet
    Pending,
    /// Connected, no data waiting
    Connected,
    /// A whole PDU is buffered; `recv_pdu` returns it without waiting
    Readable,
}

/// PDU transport used by a connection
pub trait Transport: fmt::Debug {
    /// Start connecting. With `non_blocking` the call returns before the
    /// handshake completes and [`Transport::poll`] reports completion.
    fn connect(&mut self, portal: &Portal, non_blocking: bool) -> IscsiResult<()>;

    fn poll(&mut self) -> IscsiResult<Readiness>;

    fn send_pdu(
        &mut self,
        pdu: &IscsiPdu,
        header_digest: bool,
        data_digest: bool,
        timeout: Duration,
    ) -> IscsiResult<()>;

    /// Next PDU. Returns at once after `poll` reported
    /// [`Readiness::Readable`], otherwise waits up to `timeout`.
    fn recv_pdu(
        &mut self,
        header_digest: bool,
        data_digest: bool,
        max_data_length: usize,
        timeout: Duration,
    ) -> IscsiResult<IscsiPdu>;

    /// Release the underlying socket. Safe to call repeatedly.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Socket options applied on the next connect
    fn configure(&mut self, _tcp_window_size: Option<usize>, _type_of_service: Option<u32>) {}
}

/// Software TCP transport
#[derive(Debug, Default)]
pub struct TcpTransport {
    socket: Option<Socket>,
    connected: bool,
    /// Bytes read by `poll` that do not form a PDU yet
    rx: Vec<u8>,
    /// SO_SNDBUF/SO_RCVBUF size, if configured
    pub tcp_window_size: Option<usize>,
    /// IP type of service, if configured
    pub type_of_service: Option<u32>,
}

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport::default()
    }

    fn socket(&self) -> IscsiResult<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| IscsiError::Session("transport is not connected".to_string()))
    }

    fn blocking_socket(&self, timeout: Duration) -> IscsiResult<&Socket> {
        let socket = self.socket()?;
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)?;
        Ok(socket)
    }

    /// Block until at least `len` bytes are buffered
    fn fill_to(&mut self, len: usize, timeout: Duration) -> IscsiResult<()> {
        let have = self.rx.len();
        if have >= len {
            return Ok(());
        }
        let mut tail = vec![0u8; len - have];
        let mut socket = self.blocking_socket(timeout)?;
        socket.read_exact(&mut tail).map_err(map_timeout)?;
        self.rx.extend_from_slice(&tail);
        Ok(())
    }
}

/// Length on the wire of the PDU starting at `buf[0]`, once its BHS is in
fn framed_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < BHS_SIZE {
        return None;
    }
    // AHS words are read and dropped by the parser
    Some(BHS_SIZE + buf[4] as usize * 4 + pdu::data_segment_length(buf).div_ceil(4) * 4)
}

fn has_whole_pdu(buf: &[u8]) -> bool {
    framed_len(buf).is_some_and(|len| buf.len() >= len)
}

fn reject_digests(header_digest: bool, data_digest: bool) -> IscsiResult<()> {
    if header_digest || data_digest {
        return Err(IscsiError::Protocol(
            "digests are not used on login PDUs".to_string(),
        ));
    }
    Ok(())
}

fn map_timeout(e: std::io::Error) -> IscsiError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            IscsiError::Timeout(format!("transport: {}", e))
        }
        _ => IscsiError::Io(e),
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, portal: &Portal, non_blocking: bool) -> IscsiResult<()> {
        self.disconnect();

        let addr = portal.resolve()?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        if let Some(size) = self.tcp_window_size {
            socket.set_send_buffer_size(size)?;
            socket.set_recv_buffer_size(size)?;
        }
        if let (Some(tos), true) = (self.type_of_service, addr.is_ipv4()) {
            socket.set_tos(tos)?;
        }
        socket.set_nonblocking(non_blocking)?;

        log::debug!("connecting to {} ({})", portal, addr);
        match socket.connect(&addr.into()) {
            Ok(()) => self.connected = true,
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                log::debug!("connect to {} in progress", addr);
            }
            Err(e) => return Err(e.into()),
        }

        self.socket = Some(socket);
        Ok(())
    }

    fn poll(&mut self) -> IscsiResult<Readiness> {
        // Field borrow only, `rx` is filled below
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| IscsiError::Session("transport is not connected".to_string()))?;

        if !self.connected {
            if let Some(err) = socket.take_error()? {
                return Err(err.into());
            }
            return match socket.peer_addr() {
                Ok(_) => {
                    self.connected = true;
                    Ok(Readiness::Connected)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(Readiness::Pending),
                Err(e) => Err(e.into()),
            };
        }

        socket.set_nonblocking(true)?;
        let mut reader: &Socket = socket;
        let mut chunk = [0u8; 4096];
        while !has_whole_pdu(&self.rx) {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    return Err(IscsiError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )))
                }
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(if has_whole_pdu(&self.rx) {
            Readiness::Readable
        } else {
            Readiness::Connected
        })
    }

    fn send_pdu(
        &mut self,
        pdu: &IscsiPdu,
        header_digest: bool,
        data_digest: bool,
        timeout: Duration,
    ) -> IscsiResult<()> {
        reject_digests(header_digest, data_digest)?;
        let mut socket = self.blocking_socket(timeout)?;
        socket.write_all(&pdu.to_bytes()).map_err(map_timeout)?;
        Ok(())
    }

    fn recv_pdu(
        &mut self,
        header_digest: bool,
        data_digest: bool,
        max_data_length: usize,
        timeout: Duration,
    ) -> IscsiResult<IscsiPdu> {
        reject_digests(header_digest, data_digest)?;
        self.fill_to(BHS_SIZE, timeout)?;

        let data_len = pdu::data_segment_length(&self.rx);
        if data_len > max_data_length {
            self.rx.clear();
            return Err(IscsiError::InvalidPdu(format!(
                "data segment of {} bytes exceeds limit of {}",
                data_len, max_data_length
            )));
        }

        let len = framed_len(&self.rx).unwrap_or(BHS_SIZE);
        self.fill_to(len, timeout)?;
        let rest = self.rx.split_off(len);
        let buf = std::mem::replace(&mut self.rx, rest);
        IscsiPdu::from_bytes(&buf)
    }

    fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            log::debug!("closing transport");
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.connected = false;
        self.rx.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn configure(&mut self, tcp_window_size: Option<usize>, type_of_service: Option<u32>) {
        self.tcp_window_size = tcp_window_size;
        self.type_of_service = type_of_service;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_portal_parse_forms() {
        assert_eq!(Portal::parse("10.0.0.1").unwrap(), Portal::new("10.0.0.1", 3260));
        assert_eq!(
            Portal::parse("storage.example.com:3261").unwrap(),
            Portal::new("storage.example.com", 3261)
        );
        assert_eq!(Portal::parse("[fe80::1]:3262").unwrap(), Portal::new("fe80::1", 3262));
        assert_eq!(Portal::parse("[fe80::1]").unwrap(), Portal::new("fe80::1", 3260));
        assert_eq!(Portal::parse("fe80::1").unwrap(), Portal::new("fe80::1", 3260));
    }

    #[test]
    fn test_portal_parse_rejects_garbage() {
        for bad in ["", ":3260", "host:", "host:0", "host:99999", "[fe80::1", "[]:3260", "a b"] {
            assert!(Portal::parse(bad).is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_portal_display_brackets_ipv6() {
        assert_eq!(Portal::new("fe80::1", 3260).to_string(), "[fe80::1]:3260");
        assert_eq!(Portal::new("10.0.0.1", 3260).to_string(), "10.0.0.1:3260");
    }

    #[test]
    fn test_target_address_with_tag() {
        let (portal, tag) = parse_target_address("10.1.1.1:3260,2").unwrap();
        assert_eq!(portal, Portal::new("10.1.1.1", 3260));
        assert_eq!(tag, Some(2));

        let (portal, tag) = parse_target_address("[2001:db8::5]:3270,1").unwrap();
        assert_eq!(portal, Portal::new("2001:db8::5", 3270));
        assert_eq!(tag, Some(1));

        assert!(parse_target_address("10.1.1.1:3260,x").is_err());
    }

    #[test]
    fn test_tcp_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut bhs = [0u8; BHS_SIZE];
            stream.read_exact(&mut bhs).unwrap();
            let len = pdu::data_segment_length(&bhs).div_ceil(4) * 4;
            let mut data = vec![0u8; len];
            stream.read_exact(&mut data).unwrap();

            let mut reply = IscsiPdu::new();
            reply.opcode = pdu::opcode::LOGIN_RESPONSE;
            reply.data = b"AuthMethod=None\0".to_vec();
            stream.write_all(&reply.to_bytes()).unwrap();
        });

        let mut transport = TcpTransport::new();
        transport
            .connect(&Portal::new("127.0.0.1", port), false)
            .unwrap();
        assert!(transport.is_connected());

        let mut request = IscsiPdu::new();
        request.opcode = pdu::opcode::LOGIN_REQUEST;
        request.data = b"InitiatorName=iqn.2024-01.test:init\0".to_vec();
        transport
            .send_pdu(&request, false, false, Duration::from_secs(5))
            .unwrap();

        let reply = transport
            .recv_pdu(false, false, 8192, Duration::from_secs(5))
            .unwrap();
        assert_eq!(reply.opcode, pdu::opcode::LOGIN_RESPONSE);
        assert_eq!(reply.data, b"AuthMethod=None\0");

        server.join().unwrap();
        transport.disconnect();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_poll_waits_for_whole_pdu() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = TcpTransport::new();
        transport
            .connect(&Portal::new("127.0.0.1", port), false)
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let mut reply = IscsiPdu::new();
        reply.opcode = pdu::opcode::LOGIN_RESPONSE;
        reply.data = b"TargetAlias=disk1\0".to_vec();
        let bytes = reply.to_bytes();

        peer.write_all(&bytes[..BHS_SIZE + 4]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.poll().unwrap(), Readiness::Connected);

        peer.write_all(&bytes[BHS_SIZE + 4..]).unwrap();
        let mut readiness = Readiness::Connected;
        for _ in 0..200 {
            readiness = transport.poll().unwrap();
            if readiness == Readiness::Readable {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(readiness, Readiness::Readable);

        let got = transport
            .recv_pdu(false, false, 8192, Duration::from_millis(1))
            .unwrap();
        assert_eq!(got.opcode, pdu::opcode::LOGIN_RESPONSE);
        assert_eq!(got.data, b"TargetAlias=disk1\0");
        assert_eq!(transport.poll().unwrap(), Readiness::Connected);
    }

    #[test]
    fn test_digests_refused() {
        let mut transport = TcpTransport::new();
        let err = transport
            .send_pdu(&IscsiPdu::new(), true, false, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, IscsiError::Protocol(_)));
    }
}
