//! Classifies a SOCKS target hostname as plain, pinned-exit, or hidden
//! service, mutating the address string in place the way the caller expects
//! to keep working with it afterward.

/// Hidden-service identifiers are fixed-length base32 strings (v2 onion
/// addresses). The rendezvous module owns the real alphabet/length; this
/// crate only needs enough of a check to reject garbage before it reaches
/// the rendezvous lookup.
const ONION_ID_LEN: usize = 16;

fn is_base32_onion_char(c: char) -> bool {
    matches!(c, 'a'..='z' | '2'..='7')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostnameClass {
    Normal,
    /// `.exit` suffix was stripped; `address` now holds the remainder for
    /// the caller to split on its own final dot into host + exit nickname.
    Exit,
    /// `.onion` suffix was stripped and the address lowercased in place.
    Onion,
}

/// Classify `address` in place.
///
/// # Test
///
/// ```
/// use tor_edge_core::hostname::{classify_hostname, HostnameClass};
///
/// let mut addr = "www.example.com.myexit.exit".to_string();
/// assert_eq!(classify_hostname(&mut addr), HostnameClass::Exit);
/// assert_eq!(addr, "www.example.com.myexit");
///
/// let (host, nickname) = addr.rsplit_once('.').unwrap();
/// assert_eq!(host, "www.example.com");
/// assert_eq!(nickname, "myexit");
/// ```
///
/// ```
/// use tor_edge_core::hostname::{classify_hostname, HostnameClass};
///
/// let mut addr = "abcdefghijklmnop.onion".to_string();
/// assert_eq!(classify_hostname(&mut addr), HostnameClass::Onion);
/// assert_eq!(addr, "abcdefghijklmnop");
/// ```
///
/// A malformed `.onion` label restores the dot and falls back to `Normal`:
///
/// ```
/// use tor_edge_core::hostname::{classify_hostname, HostnameClass};
///
/// let mut addr = "not-a-valid-id.onion".to_string();
/// assert_eq!(classify_hostname(&mut addr), HostnameClass::Normal);
/// assert_eq!(addr, "not-a-valid-id.onion");
/// ```
pub fn classify_hostname(address: &mut String) -> HostnameClass {
    // Only the final dot-segment is inspected, so `.exit`/`.onion` are
    // recognized case-insensitively without touching the case of anything
    // that comes before the last dot.
    if let Some(stripped) = strip_suffix_case_insensitive(address, ".exit") {
        *address = stripped;
        return HostnameClass::Exit;
    }

    if let Some(label) = strip_suffix_case_insensitive(address, ".onion") {
        let lowered = label.to_ascii_lowercase();
        if lowered.len() == ONION_ID_LEN && lowered.chars().all(is_base32_onion_char) {
            // Unlike `.exit`, a valid `.onion` lowercases the whole address,
            // not just the trailing label stripped off here.
            *address = lowered;
            return HostnameClass::Onion;
        }
        // malformed: leave `address` untouched, dot and all.
        return HostnameClass::Normal;
    }

    HostnameClass::Normal
}

/// Strip `suffix` from `address` if present, matched case-insensitively.
/// Does not alter the case of the remainder — callers decide whether to
/// lowercase it.
fn strip_suffix_case_insensitive(address: &str, suffix: &str) -> Option<String> {
    if address.len() < suffix.len() {
        return None;
    }
    let tail = &address[address.len() - suffix.len()..];
    if tail.eq_ignore_ascii_case(suffix) {
        Some(address[..address.len() - suffix.len()].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reapplying_exit_classification_yields_normal() {
        let mut addr = "foo.bar.exit".to_string();
        assert_eq!(classify_hostname(&mut addr), HostnameClass::Exit);
        assert_eq!(addr, "foo.bar");
        assert_eq!(classify_hostname(&mut addr), HostnameClass::Normal);
    }

    #[test]
    fn plain_host_is_normal() {
        let mut addr = "example.com".to_string();
        assert_eq!(classify_hostname(&mut addr), HostnameClass::Normal);
        assert_eq!(addr, "example.com");
    }

    #[test]
    fn onion_classification_lowercases() {
        let mut addr = "ABCDEFGHIJKLMNOP.ONION".to_string();
        assert_eq!(classify_hostname(&mut addr), HostnameClass::Onion);
        assert_eq!(addr, "abcdefghijklmnop");
    }

    #[test]
    fn bare_suffix_matches_with_empty_remainder() {
        let mut addr = ".exit".to_string();
        assert_eq!(classify_hostname(&mut addr), HostnameClass::Exit);
        assert_eq!(addr, "");
    }
}
