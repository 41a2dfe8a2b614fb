//! `NO_PROXY`-style rule matching: used to decide whether a
//! direct connection should bypass an HTTP/SOCKS proxy for a given
//! host/port. A pure function with no I/O, precisely specified so its
//! behavior does not depend on the surrounding launcher, which is itself
//! out of scope.

use std::net::IpAddr;
use std::str::FromStr;

/// One parsed entry from a comma-, pipe-, or whitespace-separated `NO_PROXY`
/// list.
/// Unknown syntax is silently ignored at parse time rather than rejected,
/// matching common `NO_PROXY` implementations' tolerance for garbage input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    /// Suffix match against the hostname, e.g. `.example.com` or `example.com`.
    HostnameSuffix(String),
    /// Exact IP address match.
    ExactIp(IpAddr),
    /// CIDR block match.
    Cidr { network: IpAddr, prefix_len: u8 },
    /// `*` disables proxying for everything.
    MatchAll,
}

#[derive(Debug, Clone, Default)]
pub struct NoProxyRules {
    rules: Vec<Rule>,
}

impl NoProxyRules {
    pub fn parse(spec: &str) -> Self {
        let mut rules = Vec::new();
        for raw in spec.split(|c: char| c == ',' || c == '|' || c.is_whitespace()) {
            let token = raw.trim();
            if token.is_empty() {
                continue;
            }
            if token == "*" {
                rules.push(Rule::MatchAll);
                continue;
            }
            if let Some((net, len)) = token.split_once('/') {
                if let (Ok(network), Ok(prefix_len)) = (IpAddr::from_str(net), len.parse::<u8>()) {
                    let max = if network.is_ipv4() { 32 } else { 128 };
                    if prefix_len <= max {
                        rules.push(Rule::Cidr { network, prefix_len });
                        continue;
                    }
                }
                // malformed CIDR: ignore silently
                continue;
            }
            if let Ok(ip) = IpAddr::from_str(token) {
                rules.push(Rule::ExactIp(ip));
                continue;
            }
            // Treat anything else as a hostname suffix. No validation of
            // character set: an invalid "hostname" simply never matches a
            // real target.
            rules.push(Rule::HostnameSuffix(token.trim_start_matches('.').to_ascii_lowercase()));
        }
        Self { rules }
    }

    /// Whether `host` should bypass the proxy. Localhost and loopback
    /// addresses always bypass, regardless of the configured rules.
    pub fn bypasses(&self, host: &str) -> bool {
        if is_loopback_literal(host) {
            return true;
        }
        if let Ok(ip) = IpAddr::from_str(host) {
            if ip.is_loopback() {
                return true;
            }
            return self.rules.iter().any(|r| matches_ip(r, ip));
        }
        let host_lower = host.to_ascii_lowercase();
        self.rules.iter().any(|r| matches_hostname(r, &host_lower))
    }
}

fn is_loopback_literal(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
}

fn matches_ip(rule: &Rule, ip: IpAddr) -> bool {
    match rule {
        Rule::MatchAll => true,
        Rule::ExactIp(candidate) => *candidate == ip,
        Rule::Cidr { network, prefix_len } => ip_in_cidr(ip, *network, *prefix_len),
        Rule::HostnameSuffix(_) => false,
    }
}

fn matches_hostname(rule: &Rule, host_lower: &str) -> bool {
    match rule {
        Rule::MatchAll => true,
        Rule::HostnameSuffix(suffix) => {
            host_lower == suffix || host_lower.ends_with(&format!(".{suffix}"))
        }
        Rule::ExactIp(_) | Rule::Cidr { .. } => false,
    }
}

fn ip_in_cidr(ip: IpAddr, network: IpAddr, prefix_len: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = if prefix_len == 0 {
                0u32
            } else {
                u32::MAX << (32 - prefix_len)
            };
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = if prefix_len == 0 {
                0u128
            } else {
                u128::MAX << (128 - prefix_len)
            };
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_and_loopback_ip_always_bypass_even_with_empty_rules() {
        let rules = NoProxyRules::parse("");
        assert!(rules.bypasses("localhost"));
        assert!(rules.bypasses("127.0.0.1"));
        assert!(rules.bypasses("::1"));
    }

    #[test]
    fn pipe_separated_entries_are_parsed_as_distinct_rules() {
        let rules = NoProxyRules::parse("a.example.com|b.example.com");
        assert!(rules.bypasses("a.example.com"));
        assert!(rules.bypasses("b.example.com"));
        assert!(!rules.bypasses("a.example.com|b.example.com"));
    }

    #[test]
    fn hostname_suffix_matches_subdomains_but_not_unrelated_hosts() {
        let rules = NoProxyRules::parse(".example.com, other.org");
        assert!(rules.bypasses("api.example.com"));
        assert!(rules.bypasses("example.com"));
        assert!(rules.bypasses("other.org"));
        assert!(!rules.bypasses("example.com.evil.net"));
        assert!(!rules.bypasses("notexample.com"));
    }

    #[test]
    fn cidr_block_matches_contained_addresses_only() {
        let rules = NoProxyRules::parse("10.0.0.0/8");
        assert!(rules.bypasses("10.1.2.3"));
        assert!(!rules.bypasses("11.0.0.1"));
    }

    #[test]
    fn exact_ip_rule_matches_only_that_address() {
        let rules = NoProxyRules::parse("192.168.1.5");
        assert!(rules.bypasses("192.168.1.5"));
        assert!(!rules.bypasses("192.168.1.6"));
    }

    #[test]
    fn star_matches_everything() {
        let rules = NoProxyRules::parse("*");
        assert!(rules.bypasses("anything.example"));
        assert!(rules.bypasses("8.8.8.8"));
    }

    #[test]
    fn malformed_entries_are_silently_ignored_not_rejected() {
        let rules = NoProxyRules::parse("10.0.0.0/999, good.example.com");
        assert!(!rules.bypasses("10.0.0.1"));
        assert!(rules.bypasses("good.example.com"));
    }
}
