//! Relay cells
//!
//! The logical messages carried, onion-encrypted, inside RELAY cell bodies.
//!
//! ```text
//! command (1) | recognized (2) | stream id (2) | digest (4) | length (2) | payload (<= 498) | padding
//! ```

use super::cell::{Cell, Reader};
use crate::error::{Result, TorError};
use rand::{CryptoRng, RngCore};

/// Stream identifier within a circuit (0 is the circuit itself)
pub type StreamId = u16;

/// Size of the relay header
pub const RELAY_HEADER_LEN: usize = 11;

/// Largest payload a relay cell can carry
pub const RELAY_PAYLOAD_MAX: usize = Cell::PAYLOAD_SIZE - RELAY_HEADER_LEN;

/// Byte range of the recognized field
pub const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;

/// Byte range of the truncated digest
pub const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - drop cell
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// Reason code carried in a RELAY_END
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndReason(pub u8);

impl EndReason {
    pub const MISC: Self = Self(1);
    pub const RESOLVEFAILED: Self = Self(2);
    pub const CONNECTREFUSED: Self = Self(3);
    pub const EXITPOLICY: Self = Self(4);
    pub const DESTROY: Self = Self(5);
    pub const DONE: Self = Self(6);
    pub const TIMEOUT: Self = Self(7);
    pub const NOROUTE: Self = Self(8);
    pub const HIBERNATING: Self = Self(9);
    pub const INTERNAL: Self = Self(10);
    pub const RESOURCELIMIT: Self = Self(11);
    pub const CONNRESET: Self = Self(12);
    pub const TORPROTOCOL: Self = Self(13);
    pub const NOTDIRECTORY: Self = Self(14);
}

/// A decoded relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMsg {
    /// Open a stream to `target` ("host:port") at the exit
    Begin { target: String, flags: u32 },
    Data(Vec<u8>),
    End { reason: EndReason },
    /// The stream is open; the body may carry the resolved address
    Connected(Vec<u8>),
    /// Flow-control credit, optionally authenticated with a digest
    Sendme { digest: Option<[u8; 20]> },
    BeginDir,
    Drop,
    /// A recognized command with no decoder here
    Other { command: RelayCommand, body: Vec<u8> },
}

const SENDME_V1: u8 = 1;

impl RelayMsg {
    /// The relay command byte for this message
    pub fn command(&self) -> RelayCommand {
        match self {
            RelayMsg::Begin { .. } => RelayCommand::Begin,
            RelayMsg::Data(_) => RelayCommand::Data,
            RelayMsg::End { .. } => RelayCommand::End,
            RelayMsg::Connected(_) => RelayCommand::Connected,
            RelayMsg::Sendme { .. } => RelayCommand::Sendme,
            RelayMsg::BeginDir => RelayCommand::BeginDir,
            RelayMsg::Drop => RelayCommand::Drop,
            RelayMsg::Other { command, .. } => *command,
        }
    }

    /// Encode the payload of this message
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            RelayMsg::Begin { target, flags } => {
                if target.as_bytes().contains(&0) {
                    return Err(TorError::Protocol("NUL in BEGIN target".into()));
                }
                let mut b = Vec::with_capacity(target.len() + 5);
                b.extend_from_slice(target.as_bytes());
                b.push(0);
                b.extend_from_slice(&flags.to_be_bytes());
                b
            }
            RelayMsg::Data(data) => data.clone(),
            RelayMsg::End { reason } => vec![reason.0],
            RelayMsg::Connected(body) => body.clone(),
            RelayMsg::Sendme { digest: None } => Vec::new(),
            RelayMsg::Sendme {
                digest: Some(digest),
            } => {
                let mut b = Vec::with_capacity(23);
                b.push(SENDME_V1);
                b.extend_from_slice(&(digest.len() as u16).to_be_bytes());
                b.extend_from_slice(digest);
                b
            }
            RelayMsg::BeginDir | RelayMsg::Drop => Vec::new(),
            RelayMsg::Other { body, .. } => body.clone(),
        };

        if body.len() > RELAY_PAYLOAD_MAX {
            return Err(TorError::PayloadTooLarge(body.len()));
        }
        Ok(body)
    }

    /// Decode a payload according to its command byte
    pub fn decode(command: u8, body: &[u8]) -> Result<Self> {
        let command = RelayCommand::from_u8(command).ok_or(TorError::UnknownCommand {
            kind: "relay",
            value: command,
        })?;

        Ok(match command {
            RelayCommand::Begin => {
                let nul = body
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or_else(|| TorError::Protocol("unterminated BEGIN target".into()))?;
                let target = std::str::from_utf8(&body[..nul])
                    .map_err(|_| TorError::Protocol("BEGIN target is not UTF-8".into()))?
                    .to_string();
                let mut r = Reader::new(&body[nul + 1..]);
                let flags = if r.remaining().len() >= 4 {
                    u32::from_be_bytes(r.take_array()?)
                } else {
                    0
                };
                RelayMsg::Begin { target, flags }
            }
            RelayCommand::Data => RelayMsg::Data(body.to_vec()),
            RelayCommand::End => RelayMsg::End {
                reason: EndReason(body.first().copied().unwrap_or(EndReason::MISC.0)),
            },
            RelayCommand::Connected => RelayMsg::Connected(body.to_vec()),
            RelayCommand::Sendme => RelayMsg::Sendme {
                digest: decode_sendme(body)?,
            },
            RelayCommand::BeginDir => RelayMsg::BeginDir,
            RelayCommand::Drop => RelayMsg::Drop,
            other => RelayMsg::Other {
                command: other,
                body: body.to_vec(),
            },
        })
    }
}

fn decode_sendme(body: &[u8]) -> Result<Option<[u8; 20]>> {
    if body.is_empty() {
        return Ok(None);
    }

    let mut r = Reader::new(body);
    match r.take_u8()? {
        0 => Ok(None),
        SENDME_V1 => {
            let len = u16::from_be_bytes(r.take_array()?);
            if len != 20 {
                return Err(TorError::Protocol(format!(
                    "SENDME v1 digest of {} bytes",
                    len
                )));
            }
            Ok(Some(r.take_array()?))
        }
        v => Err(TorError::Protocol(format!("SENDME version {}", v))),
    }
}

/// A relay message addressed to a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    pub stream_id: StreamId,
    pub msg: RelayMsg,
}

impl RelayCell {
    pub fn new(stream_id: StreamId, msg: RelayMsg) -> Self {
        Self { stream_id, msg }
    }

    /// Lay out the plaintext 509-byte body with a zero digest field
    ///
    /// Short payloads are followed by four zero bytes and then random
    /// padding; payloads within four bytes of the maximum are zero padded.
    pub fn encode_plain<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<[u8; Cell::PAYLOAD_SIZE]> {
        let payload = self.msg.encode_body()?;

        let mut buf = [0u8; Cell::PAYLOAD_SIZE];
        buf[0] = self.msg.command() as u8;
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[9..11].copy_from_slice(&(payload.len() as u16).to_be_bytes());

        let end = RELAY_HEADER_LEN + payload.len();
        buf[RELAY_HEADER_LEN..end].copy_from_slice(&payload);
        if Cell::PAYLOAD_SIZE - end > 4 {
            rng.fill_bytes(&mut buf[end + 4..]);
        }
        Ok(buf)
    }

    /// Parse a decrypted, digest-checked body
    pub fn decode_plain(body: &[u8]) -> Result<Self> {
        if body.len() != Cell::PAYLOAD_SIZE {
            return Err(TorError::Protocol(format!(
                "relay body is {} bytes",
                body.len()
            )));
        }

        let stream_id = u16::from_be_bytes([body[3], body[4]]);
        let len = u16::from_be_bytes([body[9], body[10]]) as usize;
        if len > RELAY_PAYLOAD_MAX {
            return Err(TorError::PayloadTooLarge(len));
        }

        let msg = RelayMsg::decode(body[0], &body[RELAY_HEADER_LEN..RELAY_HEADER_LEN + len])?;
        Ok(Self { stream_id, msg })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_layout() {
        let mut rng = rand::thread_rng();
        let cell = RelayCell::new(0x0102, RelayMsg::Data(vec![0xEE; 10]));
        let buf = cell.encode_plain(&mut rng).unwrap();

        assert_eq!(buf.len(), Cell::PAYLOAD_SIZE);
        assert_eq!(buf[0], RelayCommand::Data as u8);
        assert_eq!(&buf[RECOGNIZED_RANGE], &[0, 0]);
        assert_eq!(&buf[3..5], &[1, 2]);
        assert_eq!(&buf[DIGEST_RANGE], &[0, 0, 0, 0]);
        assert_eq!(&buf[9..11], &[0, 10]);
        assert_eq!(&buf[11..21], &[0xEE; 10]);
        assert_eq!(&buf[21..25], &[0, 0, 0, 0]);

        assert_eq!(RelayCell::decode_plain(&buf).unwrap(), cell);
    }

    #[test]
    fn test_padding_is_random() {
        let mut rng = rand::thread_rng();
        let cell = RelayCell::new(1, RelayMsg::BeginDir);
        let a = cell.encode_plain(&mut rng).unwrap();
        let b = cell.encode_plain(&mut rng).unwrap();
        assert_eq!(&a[..15], &b[..15]);
        assert_ne!(&a[15..], &b[15..]);
    }

    #[test]
    fn test_near_full_payload_zero_padded() {
        let mut rng = rand::thread_rng();
        let cell = RelayCell::new(1, RelayMsg::Data(vec![0xAB; RELAY_PAYLOAD_MAX - 3]));
        let buf = cell.encode_plain(&mut rng).unwrap();
        assert_eq!(&buf[Cell::PAYLOAD_SIZE - 3..], &[0, 0, 0]);

        let full = RelayCell::new(1, RelayMsg::Data(vec![0xAB; RELAY_PAYLOAD_MAX]));
        let buf = full.encode_plain(&mut rng).unwrap();
        assert_eq!(buf[Cell::PAYLOAD_SIZE - 1], 0xAB);
    }

    #[test]
    fn test_oversized_payload() {
        let mut rng = rand::thread_rng();
        let cell = RelayCell::new(1, RelayMsg::Data(vec![0; RELAY_PAYLOAD_MAX + 1]));
        assert!(matches!(
            cell.encode_plain(&mut rng),
            Err(TorError::PayloadTooLarge(499))
        ));
    }

    #[test]
    fn test_unknown_relay_command() {
        match RelayMsg::decode(42, &[]) {
            Err(TorError::UnknownCommand { kind, value }) => {
                assert_eq!(kind, "relay");
                assert_eq!(value, 42);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sendme_versions() {
        let digest = [0x5A; 20];
        let body = RelayMsg::Sendme {
            digest: Some(digest),
        }
        .encode_body()
        .unwrap();
        assert_eq!(body.len(), 23);
        assert_eq!(&body[..3], &[1, 0, 20]);
        assert_eq!(
            RelayMsg::decode(5, &body).unwrap(),
            RelayMsg::Sendme {
                digest: Some(digest)
            }
        );

        assert_eq!(
            RelayMsg::decode(5, &[]).unwrap(),
            RelayMsg::Sendme { digest: None }
        );
        assert!(RelayMsg::decode(5, &[1, 0, 19]).is_err());
        assert!(RelayMsg::decode(5, &[9]).is_err());
    }

    #[test]
    fn test_begin_target() {
        let msg = RelayMsg::Begin {
            target: "example.com:443".into(),
            flags: 0,
        };
        let body = msg.encode_body().unwrap();
        assert_eq!(&body[..16], b"example.com:443\0");
        assert_eq!(RelayMsg::decode(1, &body).unwrap(), msg);
    }

    #[test]
    fn test_end_reason() {
        assert_eq!(
            RelayMsg::decode(3, &[6]).unwrap(),
            RelayMsg::End {
                reason: EndReason::DONE
            }
        );
        // An empty END means MISC
        assert_eq!(
            RelayMsg::decode(3, &[]).unwrap(),
            RelayMsg::End {
                reason: EndReason::MISC
            }
        );
    }

    #[test]
    fn test_other_commands_preserved() {
        let msg = RelayMsg::decode(RelayCommand::Truncated as u8, &[8]).unwrap();
        assert_eq!(
            msg,
            RelayMsg::Other {
                command: RelayCommand::Truncated,
                body: vec![8]
            }
        );
    }
}
