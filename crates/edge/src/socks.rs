//! SOCKS4/4a/5 negotiation for the entry edge.
//!
//! Parsing is a small state machine rather than a one-shot function: SOCKS5
//! needs a method-negotiation round trip before the actual request arrives,
//! and callers may invoke [`SocksNegotiator::advance`] again and again as
//! more bytes land in the inbound buffer without losing place.

use std::net::{Ipv4Addr, Ipv6Addr};

use codec::EndReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
    /// A synthetic local connection spliced onto the overlay with no SOCKS
    /// client on the other end (see [`SocksRequest::bridge`]). Its reply
    /// path is always a no-op — nothing is listening for a SOCKS reply.
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    Connect,
    /// Tor's SOCKS extension: resolve a hostname without opening a stream.
    Resolve,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: SocksVersion,
    pub command: SocksCommand,
    pub address: String,
    pub port: u16,
    pub has_finished: bool,
    /// A pre-formed reply queued during negotiation (e.g. the SOCKS5
    /// method-selection reply); sent verbatim by the caller, then cleared.
    pub reply: Option<Vec<u8>>,
}

impl SocksRequest {
    /// Build the synthetic request used to splice a non-SOCKS local service
    /// onto the overlay: no reply is ever produced for it.
    pub fn bridge(address: String, port: u16) -> Self {
        Self {
            version: SocksVersion::Bridge,
            command: SocksCommand::Connect,
            address,
            port,
            has_finished: false,
            reply: None,
        }
    }

    /// Queue `bytes` as the next reply to flush, then mark the request
    /// finished if `status` indicates a terminal outcome. A bridge request
    /// never produces a reply regardless of what's passed in.
    pub fn set_reply(&mut self, bytes: Vec<u8>, terminal: bool) {
        if self.version == SocksVersion::Bridge {
            self.has_finished = terminal;
            return;
        }
        self.reply = Some(bytes);
        self.has_finished = terminal;
    }

    pub fn take_reply(&mut self) -> Option<Vec<u8>> {
        self.reply.take()
    }
}

#[derive(Debug)]
pub enum ParseOutcome {
    Done { request: SocksRequest, consumed: usize },
    /// A reply must be written before more bytes can be parsed (SOCKS5
    /// method selection); `consumed` bytes are spent and may be dropped
    /// from the inbound buffer.
    Intermediate { reply: Vec<u8>, consumed: usize },
    NeedMore,
    Error,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    AwaitVersion,
    Socks5AwaitRequest,
}

/// Stateful SOCKS parser. One instance per entry stream.
pub struct SocksNegotiator {
    stage: Stage,
}

impl Default for SocksNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl SocksNegotiator {
    pub fn new() -> Self {
        Self {
            stage: Stage::AwaitVersion,
        }
    }

    /// Try to make progress against `buf`, which holds every byte received
    /// so far that hasn't yet been consumed by a prior call.
    ///
    /// # Test
    ///
    /// ```
    /// use tor_edge_core::socks::{SocksNegotiator, ParseOutcome, SocksCommand};
    ///
    /// let mut neg = SocksNegotiator::new();
    /// // SOCKS4 CONNECT to 1.2.3.4:80, empty user id.
    /// let buf = [4u8, 1, 0, 80, 1, 2, 3, 4, 0];
    /// match neg.advance(&buf) {
    ///     ParseOutcome::Done { request, consumed } => {
    ///         assert_eq!(consumed, buf.len());
    ///         assert_eq!(request.command, SocksCommand::Connect);
    ///         assert_eq!(request.address, "1.2.3.4");
    ///         assert_eq!(request.port, 80);
    ///     }
    ///     other => panic!("unexpected outcome: {other:?}"),
    /// }
    /// ```
    pub fn advance(&mut self, buf: &[u8]) -> ParseOutcome {
        match self.stage {
            Stage::AwaitVersion => {
                if buf.is_empty() {
                    return ParseOutcome::NeedMore;
                }
                match buf[0] {
                    4 => parse_socks4(buf),
                    5 => self.advance_socks5_methods(buf),
                    _ => ParseOutcome::Error,
                }
            }
            Stage::Socks5AwaitRequest => parse_socks5_request(buf),
        }
    }

    fn advance_socks5_methods(&mut self, buf: &[u8]) -> ParseOutcome {
        if buf.len() < 2 {
            return ParseOutcome::NeedMore;
        }
        let nmethods = buf[1] as usize;
        if buf.len() < 2 + nmethods {
            return ParseOutcome::NeedMore;
        }
        if !buf[2..2 + nmethods].contains(&0x00) {
            // only "no authentication required" is supported.
            return ParseOutcome::Error;
        }
        self.stage = Stage::Socks5AwaitRequest;
        ParseOutcome::Intermediate {
            reply: vec![0x05, 0x00],
            consumed: 2 + nmethods,
        }
    }
}

fn parse_socks4(buf: &[u8]) -> ParseOutcome {
    if buf.len() < 9 {
        return ParseOutcome::NeedMore;
    }

    let command = match buf[1] {
        0x01 => SocksCommand::Connect,
        0xF0 => SocksCommand::Resolve,
        _ => return ParseOutcome::Error,
    };
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = [buf[4], buf[5], buf[6], buf[7]];

    let Some(user_id_end) = buf[8..].iter().position(|&b| b == 0) else {
        return ParseOutcome::NeedMore;
    };
    let user_id_end = 8 + user_id_end;

    // SOCKS4a: 0.0.0.x (x != 0) means the real address trails the user id.
    let is_socks4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;

    let (address, consumed) = if is_socks4a {
        let domain_start = user_id_end + 1;
        let Some(domain_len) = buf[domain_start..].iter().position(|&b| b == 0) else {
            return ParseOutcome::NeedMore;
        };
        let domain_end = domain_start + domain_len;
        let Ok(domain) = std::str::from_utf8(&buf[domain_start..domain_end]) else {
            return ParseOutcome::Error;
        };
        (domain.to_string(), domain_end + 1)
    } else {
        (Ipv4Addr::from(ip).to_string(), user_id_end + 1)
    };

    ParseOutcome::Done {
        request: SocksRequest {
            version: SocksVersion::V4,
            command,
            address,
            port,
            has_finished: false,
            reply: None,
        },
        consumed,
    }
}

fn parse_socks5_request(buf: &[u8]) -> ParseOutcome {
    if buf.len() < 4 {
        return ParseOutcome::NeedMore;
    }

    let command = match buf[1] {
        0x01 => SocksCommand::Connect,
        0xF0 => SocksCommand::Resolve,
        _ => return ParseOutcome::Error,
    };

    let (address, consumed_header, port_offset) = match buf[3] {
        // IPv4
        0x01 => {
            if buf.len() < 10 {
                return ParseOutcome::NeedMore;
            }
            let addr = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            (addr.to_string(), 4, 8)
        }
        // domain name
        0x03 => {
            if buf.len() < 5 {
                return ParseOutcome::NeedMore;
            }
            let len = buf[4] as usize;
            if buf.len() < 5 + len + 2 {
                return ParseOutcome::NeedMore;
            }
            let Ok(domain) = std::str::from_utf8(&buf[5..5 + len]) else {
                return ParseOutcome::Error;
            };
            (domain.to_string(), 4, 5 + len)
        }
        // IPv6
        0x04 => {
            if buf.len() < 22 {
                return ParseOutcome::NeedMore;
            }
            let octets: [u8; 16] = buf[4..20].try_into().unwrap();
            (Ipv6Addr::from(octets).to_string(), 4, 20)
        }
        _ => return ParseOutcome::Error,
    };
    let _ = consumed_header;

    let port = u16::from_be_bytes([buf[port_offset], buf[port_offset + 1]]);
    let consumed = port_offset + 2;

    ParseOutcome::Done {
        request: SocksRequest {
            version: SocksVersion::V5,
            command,
            address,
            port,
            has_finished: false,
            reply: None,
        },
        consumed,
    }
}

/// SOCKS4/4a granted/rejected reply: `VER(0) STATUS PORT(2) IP(4)`.
pub fn socks4_reply(granted: bool, addr: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut out = vec![0x00, if granted { 0x5A } else { 0x5B }];
    out.extend_from_slice(&port.to_be_bytes());
    out.extend_from_slice(&addr.octets());
    out
}

/// Map an [`EndReason`] to the SOCKS5 reply status byte.
pub fn socks5_status_for(reason: EndReason) -> u8 {
    match reason {
        EndReason::Done => 0x00,
        EndReason::ExitPolicy => 0x02,
        EndReason::ConnectRefused => 0x05,
        EndReason::Timeout => 0x06,
        EndReason::ResolveFailed => 0x04,
        EndReason::Misc | EndReason::Destroy => 0x01,
    }
}

/// SOCKS5 reply: `05 STATUS 00 01 ADDR(4) PORT(2)`.
pub fn socks5_reply(status: u8, addr: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut out = vec![0x05, status, 0x00, 0x01];
    out.extend_from_slice(&addr.octets());
    out.extend_from_slice(&port.to_be_bytes());
    out
}

/// SOCKS4/4a `RESOLVE` reply — same layout as [`socks4_reply`] with the
/// resolved address in the IP field.
pub fn socks4_resolved_reply(addr: Option<Ipv4Addr>) -> Vec<u8> {
    socks4_reply(addr.is_some(), addr.unwrap_or(Ipv4Addr::UNSPECIFIED), 0)
}

/// SOCKS5 `RESOLVE` reply — port is always zero.
///
/// # Test
///
/// ```
/// use std::net::Ipv4Addr;
/// use tor_edge_core::socks::socks5_resolved_reply;
///
/// let reply = socks5_resolved_reply(Some(Ipv4Addr::new(1, 2, 3, 4)));
/// assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 1, 2, 3, 4, 0, 0]);
///
/// let reply = socks5_resolved_reply(None);
/// assert_eq!(reply[1], 0x01);
/// ```
pub fn socks5_resolved_reply(addr: Option<Ipv4Addr>) -> Vec<u8> {
    socks5_reply(
        if addr.is_some() { 0x00 } else { 0x01 },
        addr.unwrap_or(Ipv4Addr::UNSPECIFIED),
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks4a_reads_trailing_domain() {
        let mut buf = vec![4u8, 1];
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.push(0); // empty user id
        buf.extend_from_slice(b"example.com");
        buf.push(0);

        let mut neg = SocksNegotiator::new();
        match neg.advance(&buf) {
            ParseOutcome::Done { request, consumed } => {
                assert_eq!(consumed, buf.len());
                assert_eq!(request.address, "example.com");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn socks5_round_trip_needs_method_negotiation_first() {
        let mut neg = SocksNegotiator::new();
        let methods = [5u8, 1, 0x00];
        match neg.advance(&methods) {
            ParseOutcome::Intermediate { reply, consumed } => {
                assert_eq!(reply, vec![0x05, 0x00]);
                assert_eq!(consumed, methods.len());
            }
            other => panic!("unexpected: {other:?}"),
        }

        let mut request_bytes = vec![5u8, 0x01, 0x00, 0x03, 11];
        request_bytes.extend_from_slice(b"example.com");
        request_bytes.extend_from_slice(&80u16.to_be_bytes());
        let expected_consumed = request_bytes.len();

        match neg.advance(&request_bytes) {
            ParseOutcome::Done { request, consumed } => {
                assert_eq!(consumed, expected_consumed);
                assert_eq!(request.address, "example.com");
                assert_eq!(request.port, 80);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_unsupported_socks5_auth_methods() {
        let mut neg = SocksNegotiator::new();
        let methods = [5u8, 1, 0x02]; // username/password only
        assert!(matches!(neg.advance(&methods), ParseOutcome::Error));
    }

    #[test]
    fn bridge_requests_never_produce_a_reply() {
        let mut req = SocksRequest::bridge("10.0.0.1".into(), 443);
        req.set_reply(vec![1, 2, 3], true);
        assert_eq!(req.take_reply(), None);
        assert!(req.has_finished);
    }
}
