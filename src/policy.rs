//! Compiles the config file's policy-rule lists into the ordered,
//! first-match-wins checks the `edge` crate's collaborator traits expect.
//! Address-policy *parsing* belongs here, at the ambient-stack boundary —
//! the `edge` crate only ever consumes the compiled result (see its
//! `collab::{SocksPolicy, ExitPolicy}` traits).

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;

use anyhow::{anyhow, Result};
use edge::collab::{ExitPolicy, SocksPolicy};
use edge::exit::{RedirectAction, RedirectRule, RedirectTable};
use ipnet::Ipv4Net;

use crate::config::{PolicyAction, PolicyRule};

struct CompiledRule {
    network: Ipv4Net,
    ports: RangeInclusive<u16>,
    accept: bool,
}

/// An ordered, first-match-wins address policy compiled from config.
/// Used both as the SOCKS-port gatekeeper (ports forced to 1-65535, see
/// [`AddressPolicy::permits_socks_client`]) and as the exit policy.
pub struct AddressPolicy {
    rules: Vec<CompiledRule>,
    /// What an unmatched address gets. Tor-style policies default-reject;
    /// an explicit trailing `accept *:*` rule is how an operator opts in to
    /// permissive behavior instead.
    default_accept: bool,
}

impl AddressPolicy {
    pub fn compile(rules: &[PolicyRule]) -> Result<Self> {
        let compiled = rules
            .iter()
            .map(|rule| {
                let network: Ipv4Net = rule
                    .network
                    .parse()
                    .map_err(|e| anyhow!("invalid policy network {:?}: {e}", rule.network))?;
                if rule.port_min == 0 || rule.port_min > rule.port_max {
                    return Err(anyhow!(
                        "invalid policy port range {}-{}",
                        rule.port_min,
                        rule.port_max
                    ));
                }
                Ok(CompiledRule {
                    network,
                    ports: rule.port_min..=rule.port_max,
                    accept: rule.action == PolicyAction::Accept,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules: compiled,
            default_accept: false,
        })
    }

    fn permits_v4(&self, addr: Ipv4Addr, port: u16) -> bool {
        for rule in &self.rules {
            if rule.network.contains(&addr) && rule.ports.contains(&port) {
                return rule.accept;
            }
        }
        self.default_accept
    }

    /// `SocksPolicy` evaluates only the client's address; ports are ignored
    /// and forced to the full 1-65535 range per spec.
    pub fn permits_socks_client(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.permits_v4(v4, 1),
            IpAddr::V6(_) => self.default_accept,
        }
    }
}

impl ExitPolicy for AddressPolicy {
    fn permits(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.permits_v4(addr, port)
    }
}

/// Wraps [`AddressPolicy::permits_socks_client`] so a single compiled policy
/// can be handed to `edge` as a `SocksPolicy` trait object.
pub struct SocksGate(pub AddressPolicy);

impl SocksPolicy for SocksGate {
    fn permits(&self, addr: IpAddr) -> bool {
        self.0.permits_socks_client(addr)
    }
}

/// Compile the config's redirect-table entries in declaration order.
pub fn compile_redirect_table(rules: &[PolicyRule]) -> Result<RedirectTable> {
    let compiled = rules
        .iter()
        .map(|rule| {
            let mask: Ipv4Net = rule
                .network
                .parse()
                .map_err(|e| anyhow!("invalid redirect network {:?}: {e}", rule.network))?;
            let action = match rule.redirect_to {
                Some((addr, port)) => RedirectAction::Redirect { addr, port },
                None => RedirectAction::Log,
            };
            Ok(RedirectRule {
                mask,
                port_range: rule.port_min..=rule.port_max,
                action,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RedirectTable::new(compiled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyAction;

    fn rule(action: PolicyAction, network: &str) -> PolicyRule {
        PolicyRule {
            action,
            network: network.to_string(),
            port_min: 1,
            port_max: 65535,
            redirect_to: None,
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = AddressPolicy::compile(&[
            rule(PolicyAction::Reject, "10.0.0.0/8"),
            rule(PolicyAction::Accept, "0.0.0.0/0"),
        ])
        .unwrap();
        assert!(!policy.permits(Ipv4Addr::new(10, 1, 2, 3), 80));
        assert!(policy.permits(Ipv4Addr::new(8, 8, 8, 8), 80));
    }

    #[test]
    fn unmatched_address_defaults_to_reject() {
        let policy = AddressPolicy::compile(&[rule(PolicyAction::Accept, "8.8.8.8/32")]).unwrap();
        assert!(!policy.permits(Ipv4Addr::new(1, 1, 1, 1), 80));
    }

    #[test]
    fn redirect_table_only_rewrites_redirect_rules() {
        let table = compile_redirect_table(&[PolicyRule {
            action: PolicyAction::Accept,
            network: "10.0.0.0/8".to_string(),
            port_min: 1,
            port_max: 65535,
            redirect_to: Some((Ipv4Addr::new(1, 1, 1, 1), 81)),
        }])
        .unwrap();
        assert_eq!(
            table.apply(Ipv4Addr::new(10, 0, 0, 5), 80),
            (Ipv4Addr::new(1, 1, 1, 1), 81)
        );
    }
}
