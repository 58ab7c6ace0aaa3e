//! Exit-edge orchestrator: handles inbound `BEGIN`/`RESOLVE` relay cells,
//! validates exit policy, drives DNS resolution and the outbound TCP
//! connect, and replies with `CONNECTED`/`RESOLVED`.
//!
//! Runs entirely on the reactor's turn, same discipline as [`crate::entry`].

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use bytes::BytesMut;
use codec::{BeginTarget, EndReason, RelayCell, RelayCommand, ResolvedAnswer};
use ipnet::Ipv4Net;
use log::{debug, warn};

use crate::collab::{
    CircuitId, CircuitLayer, ConnectAttempt, DnsOutcome, DnsWorkerPool, ExitPolicy,
    OutboundConnector, RendezvousClient,
};
use crate::error::Error;
use crate::stream::{EdgeStream, StreamRole, StreamState};

/// A single entry in the exit redirect table: an address mask and port
/// range, matched in order, first match wins. A `Log` action is observed
/// (e.g. for statistics) but never rewrites the destination; only
/// `Redirect` does.
#[derive(Debug, Clone)]
pub struct RedirectRule {
    pub mask: Ipv4Net,
    pub port_range: RangeInclusive<u16>,
    pub action: RedirectAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectAction {
    Log,
    Redirect { addr: Ipv4Addr, port: u16 },
}

impl RedirectRule {
    fn matches(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.mask.contains(&addr) && self.port_range.contains(&port)
    }
}

/// Ordered redirect rules. `apply` stops at the first matching rule
/// regardless of its action — a `Log` rule that matches still ends the
/// search, it just declines to rewrite.
#[derive(Debug, Clone, Default)]
pub struct RedirectTable {
    rules: Vec<RedirectRule>,
}

impl RedirectTable {
    pub fn new(rules: Vec<RedirectRule>) -> Self {
        Self { rules }
    }

    /// # Test
    ///
    /// ```
    /// use std::ops::RangeInclusive;
    /// use std::net::Ipv4Addr;
    /// use tor_edge_core::exit::{RedirectTable, RedirectRule, RedirectAction};
    ///
    /// let table = RedirectTable::new(vec![RedirectRule {
    ///     mask: "10.0.0.0/8".parse().unwrap(),
    ///     port_range: 1..=65535,
    ///     action: RedirectAction::Redirect { addr: Ipv4Addr::new(1, 1, 1, 1), port: 81 },
    /// }]);
    /// assert_eq!(table.apply(Ipv4Addr::new(10, 1, 2, 3), 80), (Ipv4Addr::new(1, 1, 1, 1), 81));
    /// assert_eq!(table.apply(Ipv4Addr::new(8, 8, 8, 8), 80), (Ipv4Addr::new(8, 8, 8, 8), 80));
    /// ```
    pub fn apply(&self, addr: Ipv4Addr, port: u16) -> (Ipv4Addr, u16) {
        for rule in &self.rules {
            if rule.matches(addr, port) {
                return match rule.action {
                    RedirectAction::Redirect { addr, port } => (addr, port),
                    RedirectAction::Log => (addr, port),
                };
            }
        }
        (addr, port)
    }
}

#[derive(Debug)]
pub enum BeginOutcome {
    /// A rendezvous bind succeeded; the stream is now `CONNECTING` and
    /// awaits an external writable trigger (see [`ExitOrchestrator::writable`]).
    Connecting(EdgeStream),
    /// DNS answered synchronously; call [`ExitOrchestrator::connect`] next.
    Resolved { stream: EdgeStream, addr: Ipv4Addr },
    /// Submitted to the DNS worker and queued on the circuit's
    /// `resolving_streams`; nothing further to do until it completes.
    Pending(EdgeStream),
    /// The DNS worker already answered with failure and has itself sent the
    /// appropriate cell and freed the stream — no stream was even kept.
    HandledByDnsWorker,
    /// Rejected before a stream existed to track (port 0, hibernating exit,
    /// or a rendezvous bind failure). An `END` was already sent where
    /// applicable; the circuit was torn down on a fatal rendezvous failure.
    Rejected,
    /// Cell payload was malformed. Dropped silently — no `END`, to avoid an
    /// amplification oracle.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Refused,
    InProgress,
    Opened,
}

#[derive(Debug)]
pub enum ResolveOutcome {
    Answered,
    Pending,
    HandledByDnsWorker,
    Dropped,
}

pub struct ExitOrchestrator<C, D, R, P, O> {
    circuits: C,
    dns: D,
    rendezvous: R,
    policy: P,
    connector: O,
    redirects: RedirectTable,
    hibernating: bool,
}

impl<C, D, R, P, O> ExitOrchestrator<C, D, R, P, O>
where
    C: CircuitLayer,
    D: DnsWorkerPool,
    R: RendezvousClient,
    P: ExitPolicy,
    O: OutboundConnector,
{
    pub fn new(circuits: C, dns: D, rendezvous: R, policy: P, connector: O) -> Self {
        Self {
            circuits,
            dns,
            rendezvous,
            policy,
            connector,
            redirects: RedirectTable::default(),
            hibernating: false,
        }
    }

    pub fn set_redirects(&mut self, redirects: RedirectTable) {
        self.redirects = redirects;
    }

    pub fn set_hibernating(&mut self, hibernating: bool) {
        self.hibernating = hibernating;
    }

    fn send_end(&mut self, stream: &mut EdgeStream, circuit_id: CircuitId, reason: EndReason, rejected: Option<Ipv4Addr>) {
        match stream.send_end() {
            Ok(()) => {
                let mut payload = BytesMut::new();
                codec::encode_end(&mut payload, reason, rejected);
                self.circuits.send_relay_cell(
                    circuit_id,
                    &RelayCell {
                        stream_id: stream.stream_id,
                        command: RelayCommand::End,
                        payload: &payload,
                    },
                );
            }
            Err(_) => warn!(
                "stream {} already sent END, not sending a second one",
                stream.stream_id
            ),
        }
    }

    fn send_connected(&mut self, stream: &EdgeStream, circuit_id: CircuitId, original_dest: Option<Ipv4Addr>) {
        let addr = if self.circuits.is_rendezvous_joined(circuit_id) {
            None
        } else {
            original_dest
        };
        let mut payload = BytesMut::new();
        codec::encode_connected(&mut payload, addr);
        self.circuits.send_relay_cell(
            circuit_id,
            &RelayCell {
                stream_id: stream.stream_id,
                command: RelayCommand::Connected,
                payload: &payload,
            },
        );
    }

    /// Handle an inbound `BEGIN` relay cell. `stream_id` comes from the
    /// cell header, not from the payload.
    pub fn handle_begin(
        &mut self,
        circuit_id: CircuitId,
        stream_id: u16,
        payload: &[u8],
        now: u64,
    ) -> BeginOutcome {
        let target = match BeginTarget::decode(payload) {
            Ok(target) => target,
            Err(e) => {
                debug!(
                    "dropping malformed BEGIN on stream {stream_id}: {}",
                    Error::from(e)
                );
                return BeginOutcome::Dropped;
            }
        };

        if target.port() == 0 {
            let mut end_payload = BytesMut::new();
            codec::encode_end(&mut end_payload, EndReason::Misc, None);
            self.circuits.send_relay_cell(
                circuit_id,
                &RelayCell {
                    stream_id,
                    command: RelayCommand::End,
                    payload: &end_payload,
                },
            );
            return BeginOutcome::Rejected;
        }

        let address = match &target {
            BeginTarget::General { addr, .. } => addr.clone(),
            BeginTarget::Rendezvous { .. } => String::new(),
        };

        let mut stream = EdgeStream::new(
            stream_id,
            StreamRole::Exit,
            StreamState::ResolveFailed,
            address,
            target.port(),
            now,
        );
        stream.circuit_id = Some(circuit_id);

        if self.circuits.is_rendezvous_joined(circuit_id) {
            let service_id = self.circuits.rendezvous_service_id(circuit_id).unwrap_or_default();
            return match self.rendezvous.bind_stream(&service_id, target.port()) {
                Ok(()) => {
                    stream.cpath_layer = Some(self.circuits.tail_hop_index(circuit_id));
                    stream.state = StreamState::Connecting;
                    BeginOutcome::Connecting(stream)
                }
                Err(_) => {
                    self.send_end(&mut stream, circuit_id, EndReason::ExitPolicy, None);
                    self.circuits.teardown_circuit(circuit_id);
                    BeginOutcome::Rejected
                }
            };
        }

        if self.hibernating {
            self.send_end(&mut stream, circuit_id, EndReason::ExitPolicy, None);
            return BeginOutcome::Rejected;
        }

        match self.dns.submit(stream_id, &stream.address) {
            DnsOutcome::Answer(addr) => BeginOutcome::Resolved { stream, addr },
            DnsOutcome::Failure => BeginOutcome::HandledByDnsWorker,
            DnsOutcome::Pending => {
                self.circuits.enqueue_resolving_stream(circuit_id, stream_id);
                BeginOutcome::Pending(stream)
            }
        }
    }

    /// Resume a `BEGIN`-initiated stream once its deferred DNS submission
    /// completes.
    pub fn begin_dns_completed(
        &mut self,
        stream: &mut EdgeStream,
        circuit_id: CircuitId,
        outcome: DnsOutcome,
    ) -> ConnectOutcome {
        match outcome {
            DnsOutcome::Answer(addr) => self.connect(stream, circuit_id, addr),
            DnsOutcome::Failure => {
                self.send_end(stream, circuit_id, EndReason::ResolveFailed, None);
                stream.mark_closed(false);
                ConnectOutcome::Refused
            }
            DnsOutcome::Pending => ConnectOutcome::InProgress,
        }
    }

    /// Check exit policy (general streams only — rendezvous bypasses it
    /// entirely, never attempted, never logged as rejected), apply the
    /// redirect table, and attempt the non-blocking outbound connect.
    pub fn connect(&mut self, stream: &mut EdgeStream, circuit_id: CircuitId, resolved: Ipv4Addr) -> ConnectOutcome {
        let rendezvous = self.circuits.is_rendezvous_joined(circuit_id);

        if !rendezvous && !self.policy.permits(resolved, stream.port) {
            self.send_end(stream, circuit_id, EndReason::ExitPolicy, Some(resolved));
            self.circuits.detach_stream(circuit_id, stream.stream_id);
            stream.mark_closed(false);
            return ConnectOutcome::Refused;
        }

        let (final_addr, final_port) = self.redirects.apply(resolved, stream.port);

        match self.connector.connect(stream.stream_id, final_addr, final_port) {
            ConnectAttempt::Error => {
                self.send_end(stream, circuit_id, EndReason::ConnectRefused, None);
                self.circuits.detach_stream(circuit_id, stream.stream_id);
                stream.mark_closed(false);
                ConnectOutcome::Refused
            }
            ConnectAttempt::InProgress => {
                stream.state = StreamState::Connecting;
                ConnectOutcome::InProgress
            }
            ConnectAttempt::Immediate => {
                stream.state = StreamState::Open;
                self.send_connected(stream, circuit_id, Some(resolved));
                ConnectOutcome::Opened
            }
        }
    }

    /// External trigger: the outbound socket (TCP connect or rendezvous
    /// bind) became writable. Finishes the `CONNECTING -> OPEN` transition
    /// and sends `CONNECTED`. `original_dest` is `None` for rendezvous
    /// streams and ignored there regardless (never leaked).
    pub fn writable(&mut self, stream: &mut EdgeStream, circuit_id: CircuitId, original_dest: Option<Ipv4Addr>) {
        stream.state = StreamState::Open;
        self.send_connected(stream, circuit_id, original_dest);
    }

    /// Handle an inbound `RESOLVE` relay cell: a placeholder exit stream
    /// purely for DNS bookkeeping, never connected to anything.
    pub fn handle_resolve(&mut self, circuit_id: CircuitId, stream_id: u16, payload: &[u8]) -> ResolveOutcome {
        let Ok(address) = std::str::from_utf8(payload) else {
            debug!(
                "{}: dropping malformed RESOLVE on stream {stream_id}, bad utf8",
                Error::MalformedCell
            );
            return ResolveOutcome::Dropped;
        };
        let address = address.trim_end_matches('\0');
        if address.is_empty() {
            debug!("{}: dropping empty RESOLVE on stream {stream_id}", Error::MalformedCell);
            return ResolveOutcome::Dropped;
        }

        match self.dns.submit(stream_id, address) {
            DnsOutcome::Answer(addr) => {
                self.send_resolved(circuit_id, stream_id, ResolvedAnswer::Ipv4(addr));
                ResolveOutcome::Answered
            }
            DnsOutcome::Failure => ResolveOutcome::HandledByDnsWorker,
            DnsOutcome::Pending => {
                self.circuits.enqueue_resolving_stream(circuit_id, stream_id);
                ResolveOutcome::Pending
            }
        }
    }

    /// Resume a `RESOLVE`-initiated placeholder stream once its deferred
    /// DNS submission completes.
    pub fn resolve_completed(&mut self, circuit_id: CircuitId, stream_id: u16, outcome: DnsOutcome) -> ResolveOutcome {
        match outcome {
            DnsOutcome::Answer(addr) => {
                self.send_resolved(circuit_id, stream_id, ResolvedAnswer::Ipv4(addr));
                ResolveOutcome::Answered
            }
            DnsOutcome::Failure => {
                self.send_resolved(circuit_id, stream_id, ResolvedAnswer::Error);
                ResolveOutcome::Answered
            }
            DnsOutcome::Pending => ResolveOutcome::Pending,
        }
    }

    /// Package a chunk of bytes read from the connected outbound socket
    /// into a `DATA` cell, honoring `package_window`. Returns `false`
    /// without sending anything once the window is exhausted.
    pub fn package_data(&mut self, stream: &mut EdgeStream, circuit_id: CircuitId, payload: &[u8]) -> bool {
        if !stream.can_package() {
            return false;
        }
        self.circuits.send_relay_cell(
            circuit_id,
            &RelayCell {
                stream_id: stream.stream_id,
                command: RelayCommand::Data,
                payload,
            },
        );
        stream.decrement_package_window();
        true
    }

    /// A `DATA` cell arrived from the circuit, about to be written to the
    /// outbound socket. Accounts for it against `deliver_window`, sending a
    /// `SENDME` back up the circuit once the window has drained by a full
    /// increment.
    pub fn deliver_data(&mut self, stream: &mut EdgeStream, circuit_id: CircuitId) {
        if stream.decrement_deliver_window() {
            self.circuits.send_relay_cell(
                circuit_id,
                &RelayCell {
                    stream_id: stream.stream_id,
                    command: RelayCommand::Sendme,
                    payload: &[],
                },
            );
        }
    }

    /// A `SENDME` arrived from the circuit: credit back `package_window`.
    pub fn handle_sendme(&mut self, stream: &mut EdgeStream) {
        stream.credit_package_window();
    }

    fn send_resolved(&mut self, circuit_id: CircuitId, stream_id: u16, answer: ResolvedAnswer) {
        let mut payload = BytesMut::new();
        codec::encode_resolved(&mut payload, &[answer]);
        self.circuits.send_relay_cell(
            circuit_id,
            &RelayCell {
                stream_id,
                command: RelayCommand::Resolved,
                payload: &payload,
            },
        );
    }
}
