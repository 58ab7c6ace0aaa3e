//! Client-side DNS cache consulted by the entry-edge orchestrator before
//! attaching a stream to a circuit.
//!
//! Only the entry (client) path ever calls [`DnsCache::set`]. A node that is
//! simultaneously an exit relay and a client must not let answers it
//! resolved on behalf of *other people's* circuits leak into its own
//! client-side cache — this cache has no path for that to happen because
//! nothing on the exit side holds a reference to it. Kept exactly this way
//! rather than unified with any exit-side resolution bookkeeping.

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// How long a successful resolution is trusted before it must be redone.
pub const MAX_DNS_ENTRY_AGE: u64 = 60 * 60;

struct DnsEntry {
    /// Host-order IPv4, or 0 for "known to fail, remembered for failure
    /// counting".
    addr: u32,
    expires: u64,
    n_failures: u32,
}

/// Address-string keyed DNS cache. All operations take an explicit `now`
/// rather than reading the clock themselves, so the reactor controls time
/// and tests can drive it deterministically.
#[derive(Default)]
pub struct DnsCache {
    entries: HashMap<String, DnsEntry>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `address`. Literal IPv4 strings bypass the map entirely.
    /// Returns `0` for "unknown" and for an expired entry, which is deleted
    /// in the same call — matching `client_dns_lookup_entry`, which removes
    /// the stale entry from `client_dns_map` right before returning 0
    /// rather than leaving it for the next `clean()` sweep.
    ///
    /// # Test
    ///
    /// ```
    /// use tor_edge_core::dns_cache::DnsCache;
    ///
    /// let mut cache = DnsCache::new();
    /// assert_eq!(cache.lookup(0, "1.2.3.4"), u32::from(std::net::Ipv4Addr::new(1, 2, 3, 4)));
    /// assert_eq!(cache.lookup(0, "example.com"), 0);
    /// ```
    pub fn lookup(&mut self, now: u64, address: &str) -> u32 {
        if let Ok(literal) = address.parse::<Ipv4Addr>() {
            return u32::from(literal);
        }

        let key = address.to_ascii_lowercase();
        match self.entries.get(&key) {
            Some(entry) if entry.expires < now => {
                self.entries.remove(&key);
                0
            }
            Some(entry) => entry.addr,
            None => 0,
        }
    }

    /// Record a successful resolution. Ignored for literal IPv4 addresses.
    ///
    /// # Test
    ///
    /// ```
    /// use tor_edge_core::dns_cache::DnsCache;
    /// use std::net::Ipv4Addr;
    ///
    /// let mut cache = DnsCache::new();
    /// cache.set(0, "example.com", Ipv4Addr::new(1, 2, 3, 4));
    /// assert_eq!(cache.lookup(0, "example.com"), u32::from(Ipv4Addr::new(1, 2, 3, 4)));
    /// ```
    pub fn set(&mut self, now: u64, address: &str, addr: Ipv4Addr) {
        if address.parse::<Ipv4Addr>().is_ok() {
            return;
        }

        let entry = self
            .entries
            .entry(address.to_ascii_lowercase())
            .or_insert_with(|| DnsEntry {
                addr: 0,
                expires: 0,
                n_failures: 0,
            });
        entry.addr = u32::from(addr);
        entry.expires = now + MAX_DNS_ENTRY_AGE;
        entry.n_failures = 0;
    }

    /// Record a resolution failure and return the running failure count.
    pub fn incr_failures(&mut self, now: u64, address: &str) -> u32 {
        let entry = self
            .entries
            .entry(address.to_ascii_lowercase())
            .or_insert_with(|| DnsEntry {
                addr: 0,
                expires: now + MAX_DNS_ENTRY_AGE,
                n_failures: 0,
            });
        entry.n_failures += 1;
        entry.n_failures
    }

    /// Drop every entry that has expired as of `now`.
    pub fn clean(&mut self, now: u64) {
        self.entries.retain(|_, entry| entry.expires >= now);
    }
}
