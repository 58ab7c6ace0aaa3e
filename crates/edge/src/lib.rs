//! Edge-stream state machine: SOCKS negotiation, hostname classification,
//! client-side DNS cache, and the entry/exit orchestrators that glue an
//! application byte stream to a circuit.
//!
//! Everything here runs on a single reactor turn at a time (see
//! [`entry`]/[`exit`] docs) — there is no internal locking anywhere in this
//! crate. Circuit crypto, path construction, the DNS worker pool itself and
//! rendezvous lookups are someone else's problem; this crate only consumes
//! them through the traits in [`collab`].

pub mod collab;
pub mod dns_cache;
pub mod entry;
pub mod error;
pub mod exit;
pub mod hostname;
pub mod socks;
pub mod stream;

pub use dns_cache::DnsCache;
pub use error::Error;
pub use exit::ExitOrchestrator;
pub use hostname::HostnameClass;
pub use stream::{EdgeStream, StreamState};
