//! Crate-local error type. Wire-visible end reasons live in `codec::EndReason`
//! — this enum is for failures that never reach a peer.

pub use codec::EndReason;

#[derive(Debug)]
pub enum Error {
    /// Stream-id space on a circuit was exhausted (2^16 probes, all in use).
    StreamIdSpaceExhausted,
    /// No circuit could ever satisfy this stream (e.g. a pinned exit
    /// rejects the address). Permanent: the caller closes without `END`.
    NoSuitableCircuit,
    /// Malformed inbound relay cell payload; caller must drop silently.
    MalformedCell,
    Codec(codec::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

/// Returned by [`crate::stream::EdgeStream::send_end`] when a second `END`
/// is attempted on a stream that already sent one. Not a hard error —
/// callers log it at `warn` and move on, matching the original behavior
/// of treating the double call as a harmless bug rather than a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyEnded;
