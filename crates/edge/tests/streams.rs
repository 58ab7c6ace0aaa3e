//! End-to-end scenarios driving both orchestrators together through a
//! scripted sequence, the way `service/tests/turn.rs` drives a `Service`
//! through a fake `ServiceHandler`.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use anyhow::Result;
use codec::{BeginTarget, RelayCell, RelayCommand};
use tor_edge_core::collab::{
    BindError, CircuitCriteria, CircuitId, CircuitLayer, ConnectAttempt, DescriptorStatus,
    DnsOutcome, DnsWorkerPool, ExitPolicy, OutboundConnector, RendezvousClient,
};
use tor_edge_core::entry::{AttachOutcome, EntryOrchestrator};
use tor_edge_core::exit::{
    BeginOutcome, ConnectOutcome, ExitOrchestrator, RedirectAction, RedirectRule, RedirectTable,
};
use tor_edge_core::stream::{EdgeStream, StreamRole, StreamState};

type SentLog = Rc<RefCell<Vec<(u16, RelayCommand, Vec<u8>)>>>;

/// A single circuit, standing in for whatever owns path construction and
/// cell multiplexing on the real relay. The orchestrator keeps its own copy
/// of this by value (its `circuits` field is private), so outgoing cells
/// are recorded into a shared log the test retains a handle to.
#[derive(Default)]
struct FakeCircuit {
    sent: SentLog,
    rendezvous: bool,
    service_id: Option<String>,
    available: Option<CircuitId>,
    next_stream_id: u16,
    in_use: std::collections::HashSet<u16>,
}

impl CircuitLayer for FakeCircuit {
    fn send_relay_cell(&mut self, _circuit_id: CircuitId, cell: &RelayCell<'_>) {
        self.sent
            .borrow_mut()
            .push((cell.stream_id, cell.command, cell.payload.to_vec()));
    }

    fn find_circuit_for_stream(&self, _stream_id: u16) -> Option<CircuitId> {
        None
    }

    fn detach_stream(&mut self, _circuit_id: CircuitId, _stream_id: u16) {}

    fn request_circuit(&mut self, _criteria: &CircuitCriteria) -> Option<CircuitId> {
        self.available
    }

    fn circuit_permanently_unavailable(&self, _criteria: &CircuitCriteria) -> bool {
        false
    }

    fn age_circuit_dirty_timestamp(&mut self, _circuit_id: CircuitId, _seconds: u64) {}

    fn is_rendezvous_joined(&self, _circuit_id: CircuitId) -> bool {
        self.rendezvous
    }

    fn rendezvous_service_id(&self, _circuit_id: CircuitId) -> Option<String> {
        self.service_id.clone()
    }

    fn tail_hop_index(&self, _circuit_id: CircuitId) -> usize {
        1
    }

    fn enqueue_resolving_stream(&mut self, _circuit_id: CircuitId, _stream_id: u16) {}

    fn stream_ids_in_use(&self, _circuit_id: CircuitId) -> std::collections::HashSet<u16> {
        self.in_use.clone()
    }

    fn next_stream_id(&self, _circuit_id: CircuitId) -> u16 {
        self.next_stream_id
    }

    fn set_next_stream_id(&mut self, _circuit_id: CircuitId, next: u16) {
        self.in_use.insert(next.wrapping_sub(1));
        self.next_stream_id = next;
    }

    fn teardown_circuit(&mut self, _circuit_id: CircuitId) {}
}

struct FakeDns(DnsOutcome);

impl DnsWorkerPool for FakeDns {
    fn submit(&mut self, _stream_id: u16, _address: &str) -> DnsOutcome {
        self.0
    }
}

struct FakeRendezvous(bool);

impl RendezvousClient for FakeRendezvous {
    fn lookup_descriptor(&self, _service_id: &str) -> DescriptorStatus {
        DescriptorStatus::Fresh
    }

    fn refetch_descriptor(&mut self, _service_id: &str) {}

    fn bind_stream(&mut self, _service_id: &str, _port: u16) -> Result<(), BindError> {
        if self.0 {
            Ok(())
        } else {
            Err(BindError)
        }
    }
}

struct AllowAll;

impl ExitPolicy for AllowAll {
    fn permits(&self, _addr: Ipv4Addr, _port: u16) -> bool {
        true
    }
}

struct RejectEverything;

impl ExitPolicy for RejectEverything {
    fn permits(&self, _addr: Ipv4Addr, _port: u16) -> bool {
        false
    }
}

struct FakeConnector(ConnectAttempt);

impl OutboundConnector for FakeConnector {
    fn connect(&mut self, _stream_id: u16, _addr: Ipv4Addr, _port: u16) -> ConnectAttempt {
        self.0
    }
}

/// A plain `CONNECT example.com:80` that resolves and connects on the first
/// try: entry sends `BEGIN`, exit resolves and opens immediately, and the
/// `CONNECTED` cell carries the resolved address since this isn't a
/// rendezvous stream.
#[test]
fn plain_connect_round_trip() -> Result<()> {
    let entry_sent: SentLog = Rc::new(RefCell::new(Vec::new()));
    let mut entry = EntryOrchestrator::new(
        FakeCircuit { sent: entry_sent.clone(), available: Some(1), ..Default::default() },
        1800,
    );
    // The stream starts with a placeholder id; `attach` allocates the real
    // one against whatever circuit it actually lands on.
    let mut client_stream =
        EdgeStream::new(0, StreamRole::Entry, StreamState::CircuitWait, "example.com".into(), 80, 0);

    assert_eq!(entry.attach(&mut client_stream, 0), AttachOutcome::Attached(1));
    entry.send_begin(&mut client_stream, 0);
    assert_eq!(client_stream.state, StreamState::ConnectWait);

    let (allocated_stream_id, command, begin_payload) = entry_sent.borrow().last().unwrap().clone();
    assert_eq!(command, RelayCommand::Begin);
    assert_eq!(allocated_stream_id, client_stream.stream_id);
    let target = BeginTarget::decode(&begin_payload).unwrap();
    assert_eq!(target, BeginTarget::General { addr: "example.com".into(), port: 80 });

    let exit_sent: SentLog = Rc::new(RefCell::new(Vec::new()));
    let mut exit = ExitOrchestrator::new(
        FakeCircuit { sent: exit_sent.clone(), ..Default::default() },
        FakeDns(DnsOutcome::Answer(Ipv4Addr::new(93, 184, 216, 34))),
        FakeRendezvous(true),
        AllowAll,
        FakeConnector(ConnectAttempt::Immediate),
    );

    match exit.handle_begin(1, allocated_stream_id, &begin_payload, 0) {
        BeginOutcome::Resolved { mut stream, addr } => {
            assert_eq!(exit.connect(&mut stream, 1, addr), ConnectOutcome::Opened);
            assert_eq!(stream.state, StreamState::Open);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let (_, command, payload) = exit_sent.borrow().last().unwrap().clone();
    assert_eq!(command, RelayCommand::Connected);
    assert_eq!(payload, vec![93, 184, 216, 34]);

    Ok(())
}

/// A hidden-service (`.onion`) stream: `BEGIN` carries no address, the exit
/// binds into the rendezvous circuit instead of resolving DNS, and the
/// eventual `CONNECTED` payload stays empty so the client's hop never learns
/// the internal address the hidden service is listening on.
#[test]
fn rendezvous_connect_never_leaks_address() -> Result<()> {
    let sent: SentLog = Rc::new(RefCell::new(Vec::new()));
    let mut exit = ExitOrchestrator::new(
        FakeCircuit {
            sent: sent.clone(),
            rendezvous: true,
            service_id: Some("abcdefghijklmnop".into()),
            ..Default::default()
        },
        FakeDns(DnsOutcome::Pending),
        FakeRendezvous(true),
        RejectEverything,
        FakeConnector(ConnectAttempt::Immediate),
    );

    let mut payload = bytes::BytesMut::new();
    BeginTarget::Rendezvous { port: 443 }.encode(&mut payload);

    match exit.handle_begin(9, 3, &payload, 0) {
        BeginOutcome::Connecting(mut stream) => {
            assert_eq!(stream.state, StreamState::Connecting);
            assert_eq!(stream.cpath_layer, Some(1));
            exit.writable(&mut stream, 9, None);
            assert_eq!(stream.state, StreamState::Open);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let (_, command, payload) = sent.borrow().last().unwrap().clone();
    assert_eq!(command, RelayCommand::Connected);
    assert!(payload.is_empty());

    Ok(())
}

/// Exit policy rejects the destination: no outbound connect is attempted,
/// and the client's hop receives `END(EXITPOLICY)` carrying the address
/// that was rejected.
#[test]
fn exit_policy_rejection_never_reaches_connector() -> Result<()> {
    let sent: SentLog = Rc::new(RefCell::new(Vec::new()));
    let mut exit = ExitOrchestrator::new(
        FakeCircuit { sent: sent.clone(), ..Default::default() },
        FakeDns(DnsOutcome::Pending),
        FakeRendezvous(true),
        RejectEverything,
        FakeConnector(ConnectAttempt::Immediate),
    );
    let mut stream =
        EdgeStream::new(7, StreamRole::Exit, StreamState::ResolveFailed, "blocked.example".into(), 25, 0);

    let outcome = exit.connect(&mut stream, 1, Ipv4Addr::new(198, 51, 100, 7));
    assert_eq!(outcome, ConnectOutcome::Refused);

    let (_, command, payload) = sent.borrow().last().unwrap().clone();
    assert_eq!(command, RelayCommand::End);
    assert_eq!(payload[0], codec::EndReason::ExitPolicy as u8);
    assert_eq!(&payload[1..], &[198, 51, 100, 7]);

    Ok(())
}

/// A literal IPv4 `RESOLVE` is answered straight out of the client's own
/// DNS cache without ever touching a circuit.
#[test]
fn resolve_shortcut_avoids_a_circuit_for_a_cached_name() -> Result<()> {
    let sent: SentLog = Rc::new(RefCell::new(Vec::new()));
    let mut entry = EntryOrchestrator::new(FakeCircuit { sent: sent.clone(), ..Default::default() }, 1800);
    entry.dns.set(0, "cached.example", Ipv4Addr::new(203, 0, 113, 9));

    assert_eq!(
        entry.resolve_shortcut(0, "cached.example", None),
        Some(Ipv4Addr::new(203, 0, 113, 9))
    );
    assert!(sent.borrow().is_empty());

    Ok(())
}

/// A redirect rule rewrites the destination before the outbound connect is
/// attempted, and `CONNECTED` reports the resolved address the client asked
/// for — the redirect only steers where the connector actually dials.
#[test]
fn redirect_table_rewrite_still_opens_the_stream() -> Result<()> {
    let sent: SentLog = Rc::new(RefCell::new(Vec::new()));
    let mut exit = ExitOrchestrator::new(
        FakeCircuit { sent: sent.clone(), ..Default::default() },
        FakeDns(DnsOutcome::Pending),
        FakeRendezvous(true),
        AllowAll,
        FakeConnector(ConnectAttempt::Immediate),
    );
    exit.set_redirects(RedirectTable::new(vec![RedirectRule {
        mask: "192.168.0.0/16".parse().unwrap(),
        port_range: 1..=65535,
        action: RedirectAction::Redirect { addr: Ipv4Addr::new(10, 10, 10, 10), port: 8080 },
    }]));

    let mut stream =
        EdgeStream::new(7, StreamRole::Exit, StreamState::ResolveFailed, "internal.example".into(), 80, 0);
    let outcome = exit.connect(&mut stream, 1, Ipv4Addr::new(192, 168, 5, 5));
    assert_eq!(outcome, ConnectOutcome::Opened);

    let (_, command, payload) = sent.borrow().last().unwrap().clone();
    assert_eq!(command, RelayCommand::Connected);
    assert_eq!(payload, vec![192, 168, 5, 5]);

    Ok(())
}
