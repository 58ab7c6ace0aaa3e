//! The edge stream itself: per-stream state, flow-control windows, and the
//! end-cell bookkeeping shared by both the entry and exit orchestrators.

use std::collections::HashSet;

use codec::EndReason;

use crate::error::AlreadyEnded;

/// Initial flow-control window credited to a fresh stream on both sides.
pub const STREAMWINDOW_START: i32 = 500;

/// Credit restored to a window by a single `SENDME`, and the drop that
/// triggers emitting one (`connection_edge_consider_sending_sendme`).
pub const STREAMWINDOW_INCREMENT: i32 = 50;

/// Seconds a resolved successful client DNS entry and a sweep-eligible
/// stream are compared against; see [`crate::entry`].
pub const EXPIRE_BEGINNING_INTERVAL: u64 = 15;
pub const RENDEZVOUS_GIVEUP_INTERVAL: u64 = 45;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    SocksWait,
    RendDescWait,
    CircuitWait,
    ConnectWait,
    ResolveWait,
    Open,
    /// Exit-side placeholder state before DNS resolution completes; the
    /// default state for a freshly allocated exit stream.
    ResolveFailed,
    Connecting,
    Closed,
}

/// A single application-level byte stream multiplexed onto a circuit.
#[derive(Debug)]
pub struct EdgeStream {
    pub stream_id: u16,
    pub role: StreamRole,
    pub state: StreamState,
    pub address: String,
    pub port: u16,
    pub circuit_id: Option<u64>,
    /// Index of the circuit hop whose key encrypts this stream's cells;
    /// unset for exit-side general streams (the exit itself is the last
    /// hop, nothing further to encrypt toward).
    pub cpath_layer: Option<usize>,
    pub package_window: i32,
    pub deliver_window: i32,
    has_sent_end: bool,
    pub hold_open_until_flushed: bool,
    pub eof_seen: bool,
    pub timestamp_lastread: u64,
    pub chosen_exit_name: Option<String>,
    pub rend_query: Option<String>,
    /// Entry-side only: the original SOCKS command was `RESOLVE`, not
    /// `CONNECT` — once attached, the orchestrator sends `RESOLVE` instead
    /// of `BEGIN`.
    pub wants_resolve: bool,
}

impl EdgeStream {
    pub fn new(
        stream_id: u16,
        role: StreamRole,
        state: StreamState,
        address: String,
        port: u16,
        now: u64,
    ) -> Self {
        Self {
            stream_id,
            role,
            state,
            address,
            port,
            circuit_id: None,
            cpath_layer: None,
            package_window: STREAMWINDOW_START,
            deliver_window: STREAMWINDOW_START,
            has_sent_end: false,
            hold_open_until_flushed: false,
            eof_seen: false,
            timestamp_lastread: now,
            chosen_exit_name: None,
            rend_query: None,
            wants_resolve: false,
        }
    }

    pub fn has_sent_end(&self) -> bool {
        self.has_sent_end
    }

    /// Record that an `END` cell was (about to be) sent. Returns
    /// `Err(AlreadyEnded)` on a second call instead of panicking or
    /// silently ignoring it — callers log that at `warn` and move on.
    ///
    /// # Test
    ///
    /// ```
    /// use tor_edge_core::stream::{EdgeStream, StreamRole, StreamState};
    ///
    /// let mut stream = EdgeStream::new(1, StreamRole::Exit, StreamState::Open, "x".into(), 80, 0);
    /// assert!(stream.send_end().is_ok());
    /// assert!(stream.send_end().is_err());
    /// ```
    pub fn send_end(&mut self) -> Result<(), AlreadyEnded> {
        if self.has_sent_end {
            return Err(AlreadyEnded);
        }
        self.has_sent_end = true;
        Ok(())
    }

    /// Clear the "already ended" flag so a retry attempt (§ timeout sweep)
    /// may legitimately send a second `END` on what is, from the peer's
    /// perspective, actually a fresh attach.
    pub fn reset_end_flag(&mut self) {
        self.has_sent_end = false;
    }

    pub fn mark_closed(&mut self, hold_until_flushed: bool) {
        self.state = StreamState::Closed;
        self.hold_open_until_flushed = hold_until_flushed;
    }

    /// An edge connection that still has unread bytes buffered must not be
    /// torn down on EOF — wait for the reactor to drain it first.
    pub fn should_close_on_eof(&self, has_buffered_input: bool) -> bool {
        self.eof_seen && !has_buffered_input
    }

    pub fn end_reason_on_close(&self) -> EndReason {
        EndReason::Done
    }

    /// Whether the reactor may package another inbound byte chunk into a
    /// `DATA` cell for this stream. False once `package_window` has been
    /// driven to zero and no `SENDME` has arrived to replenish it.
    pub fn can_package(&self) -> bool {
        self.package_window > 0
    }

    /// Account for one `DATA` cell packaged outbound on this stream.
    /// Callers must check [`Self::can_package`] first; this never drives the
    /// window negative regardless.
    ///
    /// # Test
    ///
    /// ```
    /// use tor_edge_core::stream::{EdgeStream, StreamRole, StreamState, STREAMWINDOW_START};
    ///
    /// let mut stream = EdgeStream::new(1, StreamRole::Entry, StreamState::Open, "x".into(), 80, 0);
    /// stream.package_window = 1;
    /// stream.decrement_package_window();
    /// assert_eq!(stream.package_window, 0);
    /// assert!(!stream.can_package());
    /// stream.decrement_package_window();
    /// assert_eq!(stream.package_window, 0);
    /// assert_eq!(STREAMWINDOW_START, 500);
    /// ```
    pub fn decrement_package_window(&mut self) {
        self.package_window = (self.package_window - 1).max(0);
    }

    /// Apply an inbound `SENDME`: restore one increment of `package_window`,
    /// clamped to `STREAMWINDOW_START`.
    pub fn credit_package_window(&mut self) {
        self.package_window = (self.package_window + STREAMWINDOW_INCREMENT).min(STREAMWINDOW_START);
    }

    /// Account for one `DATA` cell delivered on this stream (passed along to
    /// the far side's edge connection). Returns `true` once every
    /// `STREAMWINDOW_INCREMENT` cells, when a `SENDME` should now be sent
    /// back toward the cell's origin — mirroring
    /// `connection_edge_consider_sending_sendme`, which checks this right
    /// after the outbuf flush and immediately credits the window back by
    /// one increment rather than letting it run down to zero.
    ///
    /// # Test
    ///
    /// ```
    /// use tor_edge_core::stream::{EdgeStream, StreamRole, StreamState, STREAMWINDOW_INCREMENT};
    ///
    /// let mut stream = EdgeStream::new(1, StreamRole::Exit, StreamState::Open, "x".into(), 80, 0);
    /// for _ in 0..STREAMWINDOW_INCREMENT - 1 {
    ///     assert!(!stream.decrement_deliver_window());
    /// }
    /// assert!(stream.decrement_deliver_window());
    /// ```
    pub fn decrement_deliver_window(&mut self) -> bool {
        self.deliver_window -= 1;
        if self.deliver_window <= STREAMWINDOW_START - STREAMWINDOW_INCREMENT {
            self.deliver_window += STREAMWINDOW_INCREMENT;
            true
        } else {
            false
        }
    }
}

/// Allocate a fresh stream id on a circuit: linear probe starting at
/// `*next_stream_id`, skipping 0 and anything already in `in_use`. Gives up
/// after `1 << 16` probes — the caller must then treat the circuit as
/// unusable.
///
/// # Test
///
/// ```
/// use std::collections::HashSet;
/// use tor_edge_core::stream::allocate_stream_id;
///
/// let mut next = 1u16;
/// let in_use = HashSet::new();
/// assert_eq!(allocate_stream_id(&mut next, &in_use), Some(1));
/// assert_eq!(next, 2);
/// ```
pub fn allocate_stream_id(next_stream_id: &mut u16, in_use: &HashSet<u16>) -> Option<u16> {
    for _ in 0..(1usize << 16) {
        let candidate = *next_stream_id;
        *next_stream_id = next_stream_id.wrapping_add(1);
        if candidate != 0 && !in_use.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}
