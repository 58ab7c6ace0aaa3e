use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::Error;

/// Relay stream commands glueing an application stream to a circuit.
///
/// `DATA` carries stream bytes and is passed through untouched by this
/// crate; the rest have structured payloads encoded/decoded below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Resolve = 11,
    Resolved = 12,
}

/// Reasons carried by an `END` cell.
///
/// Numeric values match the wire values a circuit peer expects; do not
/// renumber without updating anything that logs a raw reason byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum EndReason {
    Misc = 1,
    ResolveFailed = 2,
    ConnectRefused = 3,
    ExitPolicy = 4,
    Destroy = 5,
    Done = 6,
    Timeout = 7,
}

/// The destination carried in a `BEGIN` cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginTarget {
    /// `"addr:port"` — general-circuit connect.
    General { addr: String, port: u16 },
    /// `":port"` — rendezvous connect; the exit already knows the host.
    Rendezvous { port: u16 },
}

impl BeginTarget {
    pub fn port(&self) -> u16 {
        match self {
            Self::General { port, .. } => *port,
            Self::Rendezvous { port } => *port,
        }
    }

    /// # Test
    ///
    /// ```
    /// use tor_edge_codec::cell::BeginTarget;
    ///
    /// let mut buf = bytes::BytesMut::new();
    /// BeginTarget::General { addr: "example.com".into(), port: 80 }.encode(&mut buf);
    /// assert_eq!(&buf[..], b"example.com:80\0");
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::General { addr, port } => {
                buf.extend_from_slice(format!("{addr}:{port}").as_bytes());
            }
            Self::Rendezvous { port } => {
                buf.extend_from_slice(format!(":{port}").as_bytes());
            }
        }
        buf.put_u8(0);
    }

    /// Parse a `BEGIN` payload. Returns `Err(MissingNulTerminator)` for a
    /// payload with no NUL in its declared length — callers must drop such
    /// cells silently rather than echo an `END` (see exit-edge handling).
    ///
    /// # Test
    ///
    /// ```
    /// use tor_edge_codec::cell::BeginTarget;
    ///
    /// let target = BeginTarget::decode(b"example.com:80\0").unwrap();
    /// assert_eq!(target, BeginTarget::General { addr: "example.com".into(), port: 80 });
    ///
    /// let target = BeginTarget::decode(b":443\0").unwrap();
    /// assert_eq!(target, BeginTarget::Rendezvous { port: 443 });
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let nul = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::MissingNulTerminator)?;
        let body =
            std::str::from_utf8(&bytes[..nul]).map_err(|_| Error::InvalidInput)?;

        let (host, port_str) = body.rsplit_once(':').ok_or(Error::InvalidInput)?;
        let port: u16 = port_str.parse().map_err(|_| Error::InvalidInput)?;

        Ok(if host.is_empty() {
            Self::Rendezvous { port }
        } else {
            Self::General {
                addr: host.to_string(),
                port,
            }
        })
    }
}

/// An answer carried in a `RESOLVED` cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAnswer {
    Ipv4(Ipv4Addr),
    Ipv6([u8; 16]),
    Hostname(String),
    Error,
}

impl ResolvedAnswer {
    fn type_byte(&self) -> u8 {
        match self {
            Self::Hostname(_) => 0x00,
            Self::Ipv4(_) => 0x04,
            Self::Ipv6(_) => 0x06,
            Self::Error => 0xF0,
        }
    }

    /// # Test
    ///
    /// ```
    /// use std::net::Ipv4Addr;
    /// use tor_edge_codec::cell::ResolvedAnswer;
    ///
    /// let mut buf = bytes::BytesMut::new();
    /// ResolvedAnswer::Ipv4(Ipv4Addr::new(1, 2, 3, 4)).encode(&mut buf);
    /// assert_eq!(&buf[..], &[0x04, 0x04, 1, 2, 3, 4]);
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_byte());
        match self {
            Self::Ipv4(addr) => {
                buf.put_u8(4);
                buf.extend_from_slice(&addr.octets());
            }
            Self::Ipv6(addr) => {
                buf.put_u8(16);
                buf.extend_from_slice(addr);
            }
            Self::Hostname(name) => {
                buf.put_u8(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
            Self::Error => buf.put_u8(0),
        }
    }

    fn decode_one(bytes: &[u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < 2 {
            return Err(Error::InvalidInput);
        }

        let kind = bytes[0];
        let len = bytes[1] as usize;
        let value = bytes.get(2..2 + len).ok_or(Error::InvalidInput)?;

        let answer = match kind {
            0x00 => Self::Hostname(
                std::str::from_utf8(value)
                    .map_err(|_| Error::InvalidInput)?
                    .to_string(),
            ),
            0x04 => Self::Ipv4(Ipv4Addr::from(<[u8; 4]>::try_from(value)?)),
            0x06 => Self::Ipv6(<[u8; 16]>::try_from(value)?),
            0xF0 => Self::Error,
            _ => return Err(Error::InvalidInput),
        };

        Ok((answer, 2 + len))
    }
}

/// Encode the `RESOLVED` payload: a run of TLV-encoded answers.
pub fn encode_resolved(buf: &mut BytesMut, answers: &[ResolvedAnswer]) {
    for answer in answers {
        answer.encode(buf);
    }
}

/// Decode every TLV answer in a `RESOLVED` payload.
///
/// # Test
///
/// ```
/// use std::net::Ipv4Addr;
/// use tor_edge_codec::cell::{ResolvedAnswer, decode_resolved};
///
/// let mut buf = bytes::BytesMut::new();
/// ResolvedAnswer::Ipv4(Ipv4Addr::new(1, 2, 3, 4)).encode(&mut buf);
/// let answers = decode_resolved(&buf).unwrap();
/// assert_eq!(answers, vec![ResolvedAnswer::Ipv4(Ipv4Addr::new(1, 2, 3, 4))]);
/// ```
pub fn decode_resolved(bytes: &[u8]) -> Result<Vec<ResolvedAnswer>, Error> {
    let mut answers = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (answer, used) = ResolvedAnswer::decode_one(&bytes[offset..])?;
        answers.push(answer);
        offset += used;
    }
    Ok(answers)
}

/// Encode the `CONNECTED` payload: 4-byte IPv4 for general streams, empty
/// for rendezvous streams (never leak the exit-side address).
pub fn encode_connected(buf: &mut BytesMut, addr: Option<Ipv4Addr>) {
    if let Some(addr) = addr {
        buf.extend_from_slice(&addr.octets());
    }
}

/// # Test
///
/// ```
/// use std::net::Ipv4Addr;
/// use tor_edge_codec::cell::decode_connected;
///
/// assert_eq!(decode_connected(&[1, 2, 3, 4]).unwrap(), Some(Ipv4Addr::new(1, 2, 3, 4)));
/// assert_eq!(decode_connected(&[]).unwrap(), None);
/// ```
pub fn decode_connected(bytes: &[u8]) -> Result<Option<Ipv4Addr>, Error> {
    if bytes.is_empty() {
        return Ok(None);
    }

    Ok(Some(Ipv4Addr::from(<[u8; 4]>::try_from(bytes)?)))
}

/// Encode an `END` payload: 1-byte reason, plus 4-byte rejected IPv4 for
/// `EXITPOLICY` only.
pub fn encode_end(buf: &mut BytesMut, reason: EndReason, rejected: Option<Ipv4Addr>) {
    buf.put_u8(reason.into());
    if reason == EndReason::ExitPolicy {
        if let Some(addr) = rejected {
            buf.extend_from_slice(&addr.octets());
        }
    }
}

/// # Test
///
/// ```
/// use std::net::Ipv4Addr;
/// use tor_edge_codec::cell::{EndReason, decode_end};
///
/// let (reason, addr) = decode_end(&[4, 10, 0, 0, 1]).unwrap();
/// assert_eq!(reason, EndReason::ExitPolicy);
/// assert_eq!(addr, Some(Ipv4Addr::new(10, 0, 0, 1)));
/// ```
pub fn decode_end(bytes: &[u8]) -> Result<(EndReason, Option<Ipv4Addr>), Error> {
    let reason_byte = *bytes.first().ok_or(Error::InvalidInput)?;
    let reason = EndReason::try_from(reason_byte).map_err(|_| Error::UnknownEndReason)?;

    let addr = if reason == EndReason::ExitPolicy && bytes.len() >= 5 {
        Some(Ipv4Addr::from(<[u8; 4]>::try_from(&bytes[1..5])?))
    } else {
        None
    };

    Ok((reason, addr))
}

/// A framed relay cell: `stream_id`, `command`, length-prefixed payload.
///
/// This framing is internal bookkeeping between the edge module and the
/// circuit layer's send/receive interface; it is not the on-wire cell
/// format of the overlay protocol itself.
pub struct RelayCell<'a> {
    pub stream_id: u16,
    pub command: RelayCommand,
    pub payload: &'a [u8],
}

impl<'a> RelayCell<'a> {
    /// # Test
    ///
    /// ```
    /// use tor_edge_codec::cell::{RelayCell, RelayCommand};
    ///
    /// let mut buf = bytes::BytesMut::with_capacity(64);
    /// RelayCell { stream_id: 7, command: RelayCommand::Sendme, payload: &[] }.encode(&mut buf);
    /// let cell = RelayCell::decode(&buf).unwrap();
    /// assert_eq!(cell.stream_id, 7);
    /// assert_eq!(cell.command, RelayCommand::Sendme);
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.stream_id);
        buf.put_u8(self.command.into());
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(self.payload);
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 5 {
            return Err(Error::InvalidInput);
        }

        let stream_id = u16::from_be_bytes(bytes[0..2].try_into()?);
        let command = RelayCommand::try_from(bytes[2]).map_err(|_| Error::UnknownCommand)?;
        let len = u16::from_be_bytes(bytes[3..5].try_into()?) as usize;
        let payload = bytes.get(5..5 + len).ok_or(Error::InvalidInput)?;

        Ok(Self {
            stream_id,
            command,
            payload,
        })
    }
}
