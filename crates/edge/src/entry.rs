//! Entry-edge (AP) orchestrator: attaches a stream to a circuit, sends
//! `BEGIN`/`RESOLVE`, and sweeps stalled streams for timeout and retry.
//!
//! Runs entirely on the reactor's turn — no locking, `&mut self` all the
//! way down. See [`crate::collab::CircuitLayer`] for what it consumes.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use codec::{BeginTarget, EndReason, RelayCell, RelayCommand};
use log::warn;

use crate::collab::{CircuitCriteria, CircuitId, CircuitLayer, DescriptorStatus, RendezvousClient};
use crate::dns_cache::DnsCache;
use crate::error::Error;
use crate::hostname::{classify_hostname, HostnameClass};
use crate::socks::{
    socks4_reply, socks4_resolved_reply, socks5_reply, socks5_resolved_reply, socks5_status_for,
    SocksCommand, SocksRequest, SocksVersion,
};
use crate::stream::{
    EdgeStream, StreamRole, StreamState, EXPIRE_BEGINNING_INTERVAL, RENDEZVOUS_GIVEUP_INTERVAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached(CircuitId),
    /// No circuit available yet; stay in `CIRCUIT_WAIT` for the next sweep.
    Pending,
    /// No circuit will ever work for this stream (e.g. a pinned exit
    /// rejects the address). Caller closes without sending `END`.
    PermanentFailure,
}

/// Outcome of dispatching a freshly-completed SOCKS request (the
/// `SOCKS_WAIT` transitions of §4.4).
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Normal/`.exit`/onion-with-fresh-descriptor target: stream is in
    /// `CIRCUIT_WAIT`, ready for [`EntryOrchestrator::attach_pending`].
    Attach(EdgeStream),
    /// A hidden-service target whose descriptor was missing or stale; a
    /// refetch was triggered and the stream sits in `RENDDESC_WAIT` until
    /// [`EntryOrchestrator::descriptor_ready`] is called.
    AwaitingDescriptor(EdgeStream),
    /// A `RESOLVE` satisfied straight out of the client DNS cache or a
    /// literal IPv4, without ever touching a circuit. `reply` (if any, a
    /// bridge connection never gets one) must be flushed verbatim, then the
    /// stream released.
    ResolvedImmediately {
        stream: EdgeStream,
        reply: Option<Vec<u8>>,
    },
    /// Rejected before any circuit was involved — a malformed `.exit`
    /// target or a `CONNECT` to port 0. `reply` (if any) must be flushed,
    /// then the connection closed; no `END` is sent since there was never
    /// a peer.
    Rejected { reply: Option<Vec<u8>> },
}

fn reject_reply(version: SocksVersion) -> Option<Vec<u8>> {
    match version {
        SocksVersion::V4 => Some(socks4_reply(false, Ipv4Addr::UNSPECIFIED, 0)),
        SocksVersion::V5 => Some(socks5_reply(
            socks5_status_for(EndReason::Misc),
            Ipv4Addr::UNSPECIFIED,
            0,
        )),
        SocksVersion::Bridge => None,
    }
}

fn resolved_reply(version: SocksVersion, addr: Option<Ipv4Addr>) -> Option<Vec<u8>> {
    match version {
        SocksVersion::V4 => Some(socks4_resolved_reply(addr)),
        SocksVersion::V5 => Some(socks5_resolved_reply(addr)),
        SocksVersion::Bridge => None,
    }
}

pub struct EntryOrchestrator<C> {
    circuits: C,
    pub dns: DnsCache,
    new_circuit_period: u64,
}

impl<C: CircuitLayer> EntryOrchestrator<C> {
    pub fn new(circuits: C, new_circuit_period: u64) -> Self {
        Self {
            circuits,
            dns: DnsCache::new(),
            new_circuit_period,
        }
    }

    /// Satisfy a `RESOLVE` request immediately, without ever touching a
    /// circuit, when the target is a literal IPv4 address or already
    /// cache-hot. Skipped whenever a pinned exit is in play: only that
    /// exit's view of DNS counts, so it still needs a real circuit. Easy
    /// to drop by accident when porting this logic — kept explicit.
    pub fn resolve_shortcut(
        &mut self,
        now: u64,
        address: &str,
        chosen_exit_name: Option<&str>,
    ) -> Option<Ipv4Addr> {
        if chosen_exit_name.is_some() {
            return None;
        }
        let cached = self.dns.lookup(now, address);
        (cached != 0).then(|| Ipv4Addr::from(cached))
    }

    /// Dispatch a freshly-completed SOCKS request: classify the hostname,
    /// split off a pinned exit nickname, try the hidden-service descriptor
    /// cache, and take the `RESOLVE` shortcut when possible. A stream id
    /// isn't known yet — no circuit has been chosen — so the returned
    /// stream carries the placeholder id `0` until
    /// [`EntryOrchestrator::attach`] allocates a real one against the
    /// specific circuit it lands on. `rendezvous` is the collaborator for
    /// the onion-descriptor lookup.
    pub fn dispatch<R: RendezvousClient>(
        &mut self,
        now: u64,
        mut request: SocksRequest,
        rendezvous: &mut R,
    ) -> DispatchOutcome {
        let stream_id = 0;
        let class = classify_hostname(&mut request.address);

        let chosen_exit_name = if class == HostnameClass::Exit {
            match request.address.rsplit_once('.') {
                Some((host, nickname)) if !nickname.is_empty() => {
                    let nickname = nickname.to_string();
                    request.address = host.to_string();
                    Some(nickname)
                }
                _ => {
                    return DispatchOutcome::Rejected {
                        reply: reject_reply(request.version),
                    }
                }
            }
        } else {
            None
        };

        // CONNECT to port 0 is rejected here, before any circuit attach is
        // attempted; a BEGIN with port 0 arriving at the exit is a separate,
        // independently-enforced check (see `exit::ExitOrchestrator`).
        if request.port == 0 && request.command == SocksCommand::Connect {
            return DispatchOutcome::Rejected {
                reply: reject_reply(request.version),
            };
        }

        if request.command == SocksCommand::Resolve {
            if let Some(addr) =
                self.resolve_shortcut(now, &request.address, chosen_exit_name.as_deref())
            {
                let mut stream = EdgeStream::new(
                    stream_id,
                    StreamRole::Entry,
                    StreamState::Closed,
                    request.address.clone(),
                    request.port,
                    now,
                );
                stream.chosen_exit_name = chosen_exit_name;
                let _ = stream.send_end();
                stream.hold_open_until_flushed = true;
                return DispatchOutcome::ResolvedImmediately {
                    stream,
                    reply: resolved_reply(request.version, Some(addr)),
                };
            }
        }

        let mut stream = EdgeStream::new(
            stream_id,
            StreamRole::Entry,
            StreamState::CircuitWait,
            request.address.clone(),
            request.port,
            now,
        );
        stream.chosen_exit_name = chosen_exit_name;
        stream.wants_resolve = request.command == SocksCommand::Resolve;

        if class != HostnameClass::Onion {
            return DispatchOutcome::Attach(stream);
        }

        stream.rend_query = Some(stream.address.clone());
        match rendezvous.lookup_descriptor(&stream.address) {
            DescriptorStatus::Fresh => DispatchOutcome::Attach(stream),
            DescriptorStatus::Stale | DescriptorStatus::Missing => {
                rendezvous.refetch_descriptor(&stream.address);
                stream.state = StreamState::RendDescWait;
                DispatchOutcome::AwaitingDescriptor(stream)
            }
        }
    }

    /// External trigger: a hidden-service descriptor fetch triggered by
    /// [`EntryOrchestrator::dispatch`] completed. Moves the stream from
    /// `RENDDESC_WAIT` into `CIRCUIT_WAIT` so the next attach-pending sweep
    /// picks it up. A no-op if the stream isn't actually waiting on one.
    pub fn descriptor_ready(&self, stream: &mut EdgeStream) {
        if stream.state == StreamState::RendDescWait {
            stream.state = StreamState::CircuitWait;
        }
    }

    /// Send `BEGIN` or `RESOLVE` depending on what the original SOCKS
    /// request asked for, once `stream` has just been attached to a
    /// circuit.
    pub fn send_begin_or_resolve(&mut self, stream: &mut EdgeStream, now: u64) {
        if stream.wants_resolve {
            self.send_resolve(stream, now);
        } else {
            self.send_begin(stream, now);
        }
    }

    /// Allocate a fresh stream id on `circuit_id`, probing the circuit
    /// layer's own `next_stream_id`/in-use bookkeeping (it, not this crate,
    /// tracks every stream currently attached to the circuit). `None` means
    /// the circuit's 2^16-probe budget is exhausted and it must be torn
    /// down, matching `get_unique_stream_id_by_circ`'s "no unused stream
    /// IDs, failing" case.
    fn allocate_stream_id(&mut self, circuit_id: CircuitId) -> Option<u16> {
        let in_use = self.circuits.stream_ids_in_use(circuit_id);
        let mut next = self.circuits.next_stream_id(circuit_id);
        let allocated = crate::stream::allocate_stream_id(&mut next, &in_use);
        self.circuits.set_next_stream_id(circuit_id, next);
        allocated
    }

    /// Attempt to attach `stream` (must be in `CIRCUIT_WAIT`) to a circuit,
    /// allocating its stream id against that specific circuit in the same
    /// step (mirroring `get_unique_stream_id_by_circ` being called right
    /// before `connection_edge_send_command` in the original send_begin/
    /// send_resolve).
    pub fn attach(&mut self, stream: &mut EdgeStream, _now: u64) -> AttachOutcome {
        let criteria = CircuitCriteria {
            chosen_exit_name: stream.chosen_exit_name.clone(),
            rend_query: stream.rend_query.clone(),
            address: stream.address.clone(),
            port: stream.port,
        };

        if let Some(circuit_id) = self.circuits.request_circuit(&criteria) {
            match self.allocate_stream_id(circuit_id) {
                Some(stream_id) => {
                    stream.stream_id = stream_id;
                    stream.circuit_id = Some(circuit_id);
                    return AttachOutcome::Attached(circuit_id);
                }
                None => {
                    warn!("{}: circuit {circuit_id}", Error::StreamIdSpaceExhausted);
                    self.circuits.teardown_circuit(circuit_id);
                    return AttachOutcome::PermanentFailure;
                }
            }
        }

        if self.circuits.circuit_permanently_unavailable(&criteria) {
            warn!(
                "{}: stream {} will never find a usable circuit",
                Error::NoSuitableCircuit,
                stream.stream_id
            );
            return AttachOutcome::PermanentFailure;
        }

        AttachOutcome::Pending
    }

    /// On a new-circuit event, sweep every stream in `CIRCUIT_WAIT` and try
    /// to attach it. Returns the stream ids that permanently failed (the
    /// caller tears those down; no `END` is sent since they never had a
    /// peer).
    pub fn attach_pending<'a>(
        &mut self,
        now: u64,
        streams: impl Iterator<Item = &'a mut EdgeStream>,
    ) -> Vec<u16> {
        let mut failed = Vec::new();
        for stream in streams {
            if stream.state != StreamState::CircuitWait {
                continue;
            }
            match self.attach(stream, now) {
                AttachOutcome::Attached(_) => self.send_begin_or_resolve(stream, now),
                AttachOutcome::PermanentFailure => {
                    stream.mark_closed(false);
                    failed.push(stream.stream_id);
                }
                AttachOutcome::Pending => {}
            }
        }
        failed
    }

    /// Build the payload for `BEGIN`, preferring a cached resolution over
    /// the original hostname so the exit doesn't have to re-resolve.
    pub fn begin_target(&mut self, now: u64, stream: &EdgeStream) -> BeginTarget {
        if stream.rend_query.is_some() {
            return BeginTarget::Rendezvous { port: stream.port };
        }

        let cached = self.dns.lookup(now, &stream.address);
        let addr = if cached != 0 {
            Ipv4Addr::from(cached).to_string()
        } else {
            stream.address.clone()
        };
        BeginTarget::General {
            addr,
            port: stream.port,
        }
    }

    /// Send `BEGIN` on an already-attached stream and move it to
    /// `CONNECT_WAIT`.
    pub fn send_begin(&mut self, stream: &mut EdgeStream, now: u64) {
        let circuit_id = stream.circuit_id.expect("stream must be attached");
        let target = self.begin_target(now, stream);

        let mut payload = BytesMut::new();
        target.encode(&mut payload);

        self.circuits.send_relay_cell(
            circuit_id,
            &RelayCell {
                stream_id: stream.stream_id,
                command: RelayCommand::Begin,
                payload: &payload,
            },
        );
        stream.state = StreamState::ConnectWait;
        stream.timestamp_lastread = now;
    }

    /// Send `RESOLVE` on an already-attached stream and move it to
    /// `RESOLVE_WAIT`.
    pub fn send_resolve(&mut self, stream: &mut EdgeStream, now: u64) {
        let circuit_id = stream.circuit_id.expect("stream must be attached");

        let mut payload = BytesMut::new();
        payload.extend_from_slice(stream.address.as_bytes());
        payload.put_u8(0);

        self.circuits.send_relay_cell(
            circuit_id,
            &RelayCell {
                stream_id: stream.stream_id,
                command: RelayCommand::Resolve,
                payload: &payload,
            },
        );
        stream.state = StreamState::ResolveWait;
        stream.timestamp_lastread = now;
    }

    /// Package a chunk of bytes read from the client socket into a `DATA`
    /// cell, honoring `package_window`. Returns `false` without sending
    /// anything once the window is exhausted — the caller must stop
    /// reading from the client until a `SENDME` arrives.
    pub fn package_data(&mut self, stream: &mut EdgeStream, payload: &[u8]) -> bool {
        if !stream.can_package() {
            return false;
        }
        let circuit_id = stream.circuit_id.expect("stream must be attached");
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
    /// client socket. Accounts for it against `deliver_window`, sending a
    /// `SENDME` back down the circuit once the window has drained by a full
    /// increment.
    pub fn deliver_data(&mut self, stream: &mut EdgeStream) {
        let circuit_id = stream.circuit_id.expect("stream must be attached");
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

    fn send_end(&mut self, stream: &mut EdgeStream, circuit_id: CircuitId, reason: EndReason) {
        match stream.send_end() {
            Ok(()) => {
                let mut payload = BytesMut::new();
                codec::encode_end(&mut payload, reason, None);
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

    /// Periodic sweep (`expire_beginning`): for every AP stream stuck in
    /// `RESOLVE_WAIT`/`CONNECT_WAIT` for at least 15s, either give up
    /// (vanished circuit, or a rendezvous wait past 45s) or retry on a
    /// different circuit.
    pub fn expire_beginning<'a>(
        &mut self,
        now: u64,
        streams: impl Iterator<Item = &'a mut EdgeStream>,
    ) {
        for stream in streams {
            if !matches!(stream.state, StreamState::ResolveWait | StreamState::ConnectWait) {
                continue;
            }
            if now.saturating_sub(stream.timestamp_lastread) < EXPIRE_BEGINNING_INTERVAL {
                continue;
            }

            let Some(circuit_id) = stream.circuit_id else {
                stream.mark_closed(false);
                continue;
            };

            if self.circuits.is_rendezvous_joined(circuit_id) {
                if now.saturating_sub(stream.timestamp_lastread) >= RENDEZVOUS_GIVEUP_INTERVAL {
                    self.send_end(stream, circuit_id, EndReason::Timeout);
                    stream.mark_closed(true);
                }
                continue;
            }

            self.send_end(stream, circuit_id, EndReason::Timeout);
            stream.reset_end_flag();
            stream.state = StreamState::CircuitWait;
            self.circuits.detach_stream(circuit_id, stream.stream_id);
            stream.circuit_id = None;
            self.circuits
                .age_circuit_dirty_timestamp(circuit_id, self.new_circuit_period);
            stream.timestamp_lastread += EXPIRE_BEGINNING_INTERVAL;

            match self.attach(stream, now) {
                AttachOutcome::Attached(_) => self.send_begin_or_resolve(stream, now),
                AttachOutcome::PermanentFailure => stream.mark_closed(false),
                AttachOutcome::Pending => {}
            }
        }
    }
}
