//! Interfaces to the systems this crate consumes but does not own: the
//! circuit layer, the DNS worker pool, the rendezvous (hidden-service)
//! client, and the exit policy / SOCKS address policy. All synchronous —
//! the edge module runs on one reactor turn at a time and treats these as
//! poll-style collaborators, not as something to `.await`.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use codec::RelayCell;

/// A circuit identifier. Opaque to this crate; the circuit layer owns the
/// real representation (path, keys, cell multiplexer).
pub type CircuitId = u64;

#[derive(Debug, Clone)]
pub struct CircuitCriteria {
    pub chosen_exit_name: Option<String>,
    pub rend_query: Option<String>,
    pub address: String,
    pub port: u16,
}

pub trait CircuitLayer {
    /// Send a relay command on the stream's circuit.
    fn send_relay_cell(&mut self, circuit_id: CircuitId, cell: &RelayCell<'_>);

    /// Find the circuit a given stream is currently attached to, if any.
    fn find_circuit_for_stream(&self, stream_id: u16) -> Option<CircuitId>;

    /// Detach a stream from its circuit without sending anything.
    fn detach_stream(&mut self, circuit_id: CircuitId, stream_id: u16);

    /// Find (or build) a circuit meeting `criteria`. `None` means no
    /// circuit is available *right now*; the stream stays in
    /// `CIRCUIT_WAIT` and is retried on the next attach-pending sweep.
    fn request_circuit(&mut self, criteria: &CircuitCriteria) -> Option<CircuitId>;

    /// True once a circuit can be proven to never work for `criteria`
    /// (e.g. a pinned exit's policy permanently rejects the address).
    fn circuit_permanently_unavailable(&self, criteria: &CircuitCriteria) -> bool;

    /// Push the circuit's `timestamp_dirty` back by `seconds`, so new
    /// streams prefer a different circuit while existing ones may stay.
    fn age_circuit_dirty_timestamp(&mut self, circuit_id: CircuitId, seconds: u64);

    fn is_rendezvous_joined(&self, circuit_id: CircuitId) -> bool;

    /// The service id a rendezvous-joined circuit is bound to. Only ever
    /// called when [`CircuitLayer::is_rendezvous_joined`] is true.
    fn rendezvous_service_id(&self, circuit_id: CircuitId) -> Option<String>;

    /// Index of the circuit's tail hop, used as a new exit stream's
    /// `cpath_layer` once a rendezvous bind succeeds.
    fn tail_hop_index(&self, circuit_id: CircuitId) -> usize;

    /// Append `stream_id` to the circuit's `resolving_streams` list while a
    /// DNS submission is outstanding.
    fn enqueue_resolving_stream(&mut self, circuit_id: CircuitId, stream_id: u16);

    /// Stream ids currently attached to `circuit_id` (its `p_streams`),
    /// consulted by [`crate::stream::allocate_stream_id`] so a freshly
    /// chosen id can never collide with one already live on this specific
    /// circuit.
    fn stream_ids_in_use(&self, circuit_id: CircuitId) -> HashSet<u16>;

    /// The circuit's running stream-id cursor (`next_stream_id`), advanced
    /// by [`crate::stream::allocate_stream_id`] and written back with
    /// [`CircuitLayer::set_next_stream_id`].
    fn next_stream_id(&self, circuit_id: CircuitId) -> u16;

    /// Persist the cursor `allocate_stream_id` advanced past while probing
    /// `circuit_id` for a free id.
    fn set_next_stream_id(&mut self, circuit_id: CircuitId, next: u16);

    /// Tear down the whole circuit. Reserved for fatal conditions (stream-id
    /// space exhaustion, rendezvous binding inconsistency) — never called
    /// for an ordinary single-stream failure.
    fn teardown_circuit(&mut self, circuit_id: CircuitId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsOutcome {
    Answer(Ipv4Addr),
    Failure,
    /// The worker pool accepted the submission but hasn't answered yet.
    Pending,
}

pub trait DnsWorkerPool {
    /// Submit `address` for resolution on behalf of `stream_id`. The
    /// `Pending` outcome means the worker pool will asynchronously deliver
    /// a `RESOLVED` relay cell (or drive [`crate::exit::ExitOrchestrator`]
    /// some other way) once it completes.
    fn submit(&mut self, stream_id: u16, address: &str) -> DnsOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorStatus {
    Fresh,
    Stale,
    Missing,
}

#[derive(Debug)]
pub struct BindError;

pub trait RendezvousClient {
    fn lookup_descriptor(&self, service_id: &str) -> DescriptorStatus;

    /// Kick off a background refetch; completion is signaled externally
    /// (the stream sits in `RENDDESC_WAIT` until then).
    fn refetch_descriptor(&mut self, service_id: &str);

    /// Bind an exit-side stream to a listening port inside the hidden
    /// service behind `service_id`.
    fn bind_stream(&mut self, service_id: &str, port: u16) -> Result<(), BindError>;
}

/// Address-policy check for who may use the SOCKS port. Parsing the policy
/// expression itself is out of scope here; only the compiled check is.
pub trait SocksPolicy {
    fn permits(&self, addr: std::net::IpAddr) -> bool;
}

/// Local exit policy: may this exit relay a connection to `(addr, port)`?
/// Parsing the policy / router-list lookups are out of scope here.
pub trait ExitPolicy {
    fn permits(&self, addr: Ipv4Addr, port: u16) -> bool;
}

/// Outcome of a non-blocking outbound TCP connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAttempt {
    Error,
    InProgress,
    Immediate,
}

/// The outbound side of the exit edge: opening a TCP connection to the
/// external destination. Socket lifecycle (buffers, readiness, pollability)
/// belongs to the I/O reactor; this crate only drives the attempt and reacts
/// to its outcome.
pub trait OutboundConnector {
    fn connect(&mut self, stream_id: u16, addr: Ipv4Addr, port: u16) -> ConnectAttempt;
}
