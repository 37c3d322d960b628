//! Tor cell protocol
//!
//! Implements the fixed-length cell format used on a link after version
//! negotiation, and the channel messages carried in those cells.
//! Cells are the basic unit of communication in the Tor protocol.

use crate::error::{Result, TorError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Circuit identifier on a link
pub type CircId = u32;

/// High bit set on every circuit id this client allocates
pub const CLIENT_CIRC_ID_MSB: CircId = 0x8000_0000;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for padding
    Padding = 0,
    /// CREATE - create a circuit (deprecated)
    Create = 1,
    /// CREATED - circuit created (deprecated)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created
    CreatedFast = 6,
    /// VERSIONS - negotiate versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell that can be sent early
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }
}

/// Tor cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (4 bytes for v4+ protocol)
    pub circuit_id: CircId,

    /// Command
    pub command: CellCommand,

    /// Payload (up to 509 bytes, zero padded on the wire)
    pub payload: Vec<u8>,
}

impl Cell {
    /// Cell size (514 bytes total: 4 circuit_id + 1 command + 509 payload)
    pub const SIZE: usize = 514;

    /// Header size (circuit id and command)
    pub const HEADER_SIZE: usize = 5;

    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell
    pub fn new(circuit_id: CircId, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Serialize cell to exactly [`Cell::SIZE`] bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > Self::PAYLOAD_SIZE {
            return Err(TorError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.payload);
        buf.resize(Self::SIZE, 0);
        Ok(buf)
    }

    /// Parse a cell from its 5-byte header and 509-byte body
    pub fn from_parts(header: &[u8; Self::HEADER_SIZE], body: &[u8]) -> Result<Self> {
        if body.len() != Self::PAYLOAD_SIZE {
            return Err(TorError::Protocol(format!(
                "cell body is {} bytes, expected {}",
                body.len(),
                Self::PAYLOAD_SIZE
            )));
        }

        let circuit_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let command = CellCommand::from_u8(header[4]).ok_or(TorError::UnknownCommand {
            kind: "cell",
            value: header[4],
        })?;

        Ok(Self {
            circuit_id,
            command,
            payload: body.to_vec(),
        })
    }

    /// Parse cell from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(TorError::Protocol("Cell too short".into()));
        }

        let mut header = [0u8; Self::HEADER_SIZE];
        header.copy_from_slice(&data[..Self::HEADER_SIZE]);
        Self::from_parts(&header, &data[Self::HEADER_SIZE..Self::SIZE])
    }
}

/// Reason code carried in a DESTROY cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestroyReason(pub u8);

impl DestroyReason {
    pub const NONE: Self = Self(0);
    pub const PROTOCOL: Self = Self(1);
    pub const INTERNAL: Self = Self(2);
    pub const REQUESTED: Self = Self(3);
    pub const HIBERNATING: Self = Self(4);
    pub const RESOURCELIMIT: Self = Self(5);
    pub const CONNECTFAILED: Self = Self(6);
    pub const OR_IDENTITY: Self = Self(7);
    pub const CHANNEL_CLOSED: Self = Self(8);
    pub const FINISHED: Self = Self(9);
    pub const TIMEOUT: Self = Self(10);
    pub const DESTROYED: Self = Self(11);
    pub const NOSUCHSERVICE: Self = Self(12);

    /// Human-readable name of this reason
    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
    }
}

impl From<u8> for DestroyReason {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Body of a NETINFO cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netinfo {
    /// Sender's clock, seconds since the epoch (zero from clients)
    pub timestamp: u32,
    /// The address the sender sees for the other end
    pub other_addr: Option<IpAddr>,
    /// The sender's own addresses
    pub my_addrs: Vec<IpAddr>,
}

impl Netinfo {
    /// A client NETINFO: no timestamp, no addresses of our own
    pub fn from_client(other_addr: Option<IpAddr>) -> Self {
        Self {
            timestamp: 0,
            other_addr,
            my_addrs: Vec::new(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        match self.other_addr {
            Some(addr) => encode_addr(&addr, out),
            None => out.extend_from_slice(&[0, 0]),
        }
        out.push(self.my_addrs.len().min(u8::MAX as usize) as u8);
        for addr in self.my_addrs.iter().take(u8::MAX as usize) {
            encode_addr(addr, out);
        }
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let timestamp = u32::from_be_bytes(r.take_array()?);
        let other_addr = decode_addr(&mut r)?;
        let n = r.take_u8()?;
        let mut my_addrs = Vec::with_capacity(n as usize);
        for _ in 0..n {
            if let Some(addr) = decode_addr(&mut r)? {
                my_addrs.push(addr);
            }
        }
        Ok(Self {
            timestamp,
            other_addr,
            my_addrs,
        })
    }
}

fn encode_addr(addr: &IpAddr, out: &mut Vec<u8>) {
    match addr {
        IpAddr::V4(v4) => {
            out.extend_from_slice(&[4, 4]);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.extend_from_slice(&[6, 16]);
            out.extend_from_slice(&v6.octets());
        }
    }
}

fn decode_addr(r: &mut Reader<'_>) -> Result<Option<IpAddr>> {
    let atype = r.take_u8()?;
    let len = r.take_u8()? as usize;
    let bytes = r.take(len)?;
    Ok(match (atype, len) {
        (4, 4) => Some(IpAddr::V4(Ipv4Addr::new(
            bytes[0], bytes[1], bytes[2], bytes[3],
        ))),
        (6, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    })
}

/// Cursor over a cell body
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(TorError::Protocol("truncated cell body".into()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.take(N)?);
        Ok(a)
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        self.buf
    }
}

/// A decoded channel message
///
/// One variant per cell command this engine understands. Relay bodies stay
/// onion-encrypted; the circuit decrypts them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChanMsg {
    Padding,
    CreateFast { x: [u8; 20] },
    CreatedFast { y: [u8; 20], kh: [u8; 20] },
    Destroy { reason: DestroyReason },
    Netinfo(Netinfo),
    Versions(Vec<u16>),
    Relay(Vec<u8>),
    RelayEarly(Vec<u8>),
    /// A known command with no decoder here
    Unhandled(CellCommand),
}

impl ChanMsg {
    /// The cell command this message is sent with
    pub fn command(&self) -> CellCommand {
        match self {
            ChanMsg::Padding => CellCommand::Padding,
            ChanMsg::CreateFast { .. } => CellCommand::CreateFast,
            ChanMsg::CreatedFast { .. } => CellCommand::CreatedFast,
            ChanMsg::Destroy { .. } => CellCommand::Destroy,
            ChanMsg::Netinfo(_) => CellCommand::Netinfo,
            ChanMsg::Versions(_) => CellCommand::Versions,
            ChanMsg::Relay(_) => CellCommand::Relay,
            ChanMsg::RelayEarly(_) => CellCommand::RelayEarly,
            ChanMsg::Unhandled(cmd) => *cmd,
        }
    }

    /// Decode the body of `cell` according to its command
    pub fn decode(cell: &Cell) -> Result<Self> {
        let body = &cell.payload[..];
        let mut r = Reader::new(body);
        Ok(match cell.command {
            CellCommand::Padding => ChanMsg::Padding,
            CellCommand::CreateFast => ChanMsg::CreateFast {
                x: r.take_array()?,
            },
            CellCommand::CreatedFast => ChanMsg::CreatedFast {
                y: r.take_array()?,
                kh: r.take_array()?,
            },
            CellCommand::Destroy => ChanMsg::Destroy {
                reason: r.take_u8()?.into(),
            },
            CellCommand::Netinfo => ChanMsg::Netinfo(Netinfo::decode(body)?),
            CellCommand::Versions => ChanMsg::Versions(
                body.chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .take_while(|v| *v != 0)
                    .collect(),
            ),
            CellCommand::Relay | CellCommand::RelayEarly => {
                if body.len() != Cell::PAYLOAD_SIZE {
                    return Err(TorError::Protocol(format!(
                        "relay body is {} bytes",
                        body.len()
                    )));
                }
                if cell.command == CellCommand::Relay {
                    ChanMsg::Relay(body.to_vec())
                } else {
                    ChanMsg::RelayEarly(body.to_vec())
                }
            }
            other => ChanMsg::Unhandled(other),
        })
    }

    /// Encode this message into a cell on `circuit_id`
    pub fn into_cell(self, circuit_id: CircId) -> Result<Cell> {
        let command = self.command();
        let mut payload = Vec::with_capacity(Cell::PAYLOAD_SIZE);
        match self {
            ChanMsg::Padding | ChanMsg::Unhandled(_) => {}
            ChanMsg::CreateFast { x } => payload.extend_from_slice(&x),
            ChanMsg::CreatedFast { y, kh } => {
                payload.extend_from_slice(&y);
                payload.extend_from_slice(&kh);
            }
            ChanMsg::Destroy { reason } => payload.push(reason.0),
            ChanMsg::Netinfo(n) => n.encode(&mut payload),
            ChanMsg::Versions(vs) => {
                for v in vs {
                    payload.extend_from_slice(&v.to_be_bytes());
                }
            }
            ChanMsg::Relay(body) | ChanMsg::RelayEarly(body) => payload = body,
        }

        if payload.len() > Cell::PAYLOAD_SIZE {
            return Err(TorError::PayloadTooLarge(payload.len()));
        }
        Ok(Cell::new(circuit_id, command, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_serialization() {
        let cell = Cell::new(0x8000_0001, CellCommand::CreateFast, vec![1, 2, 3, 4]);
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::SIZE);
        assert_eq!(&bytes[..5], &[0x80, 0, 0, 1, 5]);
        assert!(bytes[9..].iter().all(|b| *b == 0));

        let parsed = Cell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.circuit_id, 0x8000_0001);
        assert_eq!(parsed.command, CellCommand::CreateFast);
        assert_eq!(parsed.payload.len(), Cell::PAYLOAD_SIZE);
    }

    #[test]
    fn test_unknown_command() {
        let mut bytes = vec![0u8; Cell::SIZE];
        bytes[4] = 200;
        match Cell::from_bytes(&bytes) {
            Err(TorError::UnknownCommand { kind, value }) => {
                assert_eq!(kind, "cell");
                assert_eq!(value, 200);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_oversized_payload() {
        let cell = Cell::new(1, CellCommand::Relay, vec![0; 510]);
        assert!(matches!(cell.to_bytes(), Err(TorError::PayloadTooLarge(510))));
    }

    #[test]
    fn test_created_fast_decode() {
        let mut body = vec![0xAA; 20];
        body.extend_from_slice(&[0xBB; 20]);
        let cell = Cell::new(7, CellCommand::CreatedFast, body);
        let bytes = cell.to_bytes().unwrap();

        let msg = ChanMsg::decode(&Cell::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(
            msg,
            ChanMsg::CreatedFast {
                y: [0xAA; 20],
                kh: [0xBB; 20]
            }
        );

        // A short body cannot hold Y and KH
        let short = Cell::new(7, CellCommand::CreatedFast, vec![0; 30]);
        assert!(ChanMsg::decode(&short).is_err());
    }

    #[test]
    fn test_destroy_reason() {
        let cell = ChanMsg::Destroy {
            reason: DestroyReason::FINISHED,
        }
        .into_cell(9)
        .unwrap();
        assert_eq!(cell.payload, vec![9]);

        let bytes = cell.to_bytes().unwrap();
        let msg = ChanMsg::decode(&Cell::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(
            msg,
            ChanMsg::Destroy {
                reason: DestroyReason::FINISHED
            }
        );
        assert_eq!(DestroyReason(77).name(), "UNKNOWN");
        assert_eq!(DestroyReason::PROTOCOL.to_string(), "PROTOCOL (1)");
    }

    #[test]
    fn test_netinfo() {
        let netinfo = Netinfo {
            timestamp: 0x5f00_0000,
            other_addr: Some("192.0.2.7".parse().unwrap()),
            my_addrs: vec!["2001:db8::1".parse().unwrap(), "198.51.100.1".parse().unwrap()],
        };
        let cell = ChanMsg::Netinfo(netinfo.clone()).into_cell(0).unwrap();
        assert_eq!(&cell.payload[..6], &[0x5f, 0, 0, 0, 4, 4]);

        let bytes = cell.to_bytes().unwrap();
        match ChanMsg::decode(&Cell::from_bytes(&bytes).unwrap()).unwrap() {
            ChanMsg::Netinfo(n) => assert_eq!(n, netinfo),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_netinfo_skips_unknown_address_type() {
        // timestamp, other = hostname type (0xF0) with 3 bytes, one IPv4 addr
        let mut body = vec![0, 0, 0, 1, 0xF0, 3, b'a', b'b', b'c', 1, 4, 4, 10, 0, 0, 1];
        body.resize(Cell::PAYLOAD_SIZE, 0);
        let msg = ChanMsg::decode(&Cell::new(0, CellCommand::Netinfo, body)).unwrap();
        match msg {
            ChanMsg::Netinfo(n) => {
                assert_eq!(n.other_addr, None);
                assert_eq!(n.my_addrs, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_versions() {
        let cell = ChanMsg::Versions(vec![3, 4, 5]).into_cell(0).unwrap();
        let bytes = cell.to_bytes().unwrap();
        let msg = ChanMsg::decode(&Cell::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(msg, ChanMsg::Versions(vec![3, 4, 5]));
    }

    #[test]
    fn test_unhandled_command() {
        let cell = Cell::new(0, CellCommand::Certs, vec![]);
        assert_eq!(
            ChanMsg::decode(&cell).unwrap(),
            ChanMsg::Unhandled(CellCommand::Certs)
        );
    }
}
