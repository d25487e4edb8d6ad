//! Tenant resolution
//!
//! Picks the tenant that owns a message from the connecting IP and the
//! recipient set. Resolution is recipient/IP driven rather than
//! sender driven: the relay routes inbound messages for a recipient
//! mailbox or domain to the owning tenant's outbound credentials.

use crate::cidr;
use smtprelay_common::config::{RoutingMethod, Tenant};
use smtprelay_common::RelayError;
use std::net::IpAddr;

/// Outcome of tenant resolution
#[derive(Debug)]
pub struct Resolution<'a> {
    pub tenant: &'a Tenant,
    /// Method that produced the match; `None` marks the degraded
    /// fallback to the lowest-priority-value tenant
    pub matched_by: Option<RoutingMethod>,
}

impl Resolution<'_> {
    pub fn is_fallback(&self) -> bool {
        self.matched_by.is_none()
    }
}

/// Resolve the owning tenant for a transaction.
///
/// Tenants are tried in `routing.priority` order (ascending, stable
/// over definition order) per method, methods in the configured
/// priority order. No match at all degrades to the first tenant in
/// priority order; that is reported, not failed.
pub fn resolve<'a>(
    tenants: &'a [Tenant],
    remote_ip: IpAddr,
    rcpts: &[String],
    priority: &[RoutingMethod],
) -> Result<Resolution<'a>, RelayError> {
    if tenants.is_empty() {
        return Err(RelayError::NoTenants);
    }

    let mut ordered: Vec<&Tenant> = tenants.iter().collect();
    ordered.sort_by_key(|t| t.routing.priority);

    for method in priority {
        for tenant in &ordered {
            if matches_method(tenant, *method, remote_ip, rcpts) {
                return Ok(Resolution {
                    tenant,
                    matched_by: Some(*method),
                });
            }
        }
    }

    Ok(Resolution {
        tenant: ordered[0],
        matched_by: None,
    })
}

fn matches_method(tenant: &Tenant, method: RoutingMethod, remote_ip: IpAddr, rcpts: &[String]) -> bool {
    match method {
        // allowedSenders doubles as a recipient whitelist here; the
        // sender gate against envelope-from happens after resolution.
        RoutingMethod::AllowedSenders => {
            !tenant.allowed_senders.is_empty()
                && rcpts.iter().any(|rcpt| {
                    tenant
                        .allowed_senders
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(rcpt))
                })
        }
        RoutingMethod::SenderDomains => {
            !tenant.routing.sender_domains.is_empty()
                && rcpts.iter().any(|rcpt| match domain_of(rcpt) {
                    Some(domain) => tenant
                        .routing
                        .sender_domains
                        .iter()
                        .any(|d| d.eq_ignore_ascii_case(domain)),
                    None => false,
                })
        }
        RoutingMethod::IpRanges => {
            !tenant.routing.ip_ranges.is_empty()
                && cidr::contains(remote_ip, &tenant.routing.ip_ranges)
        }
    }
}

fn domain_of(address: &str) -> Option<&str> {
    address.rsplit('@').next().filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smtprelay_common::config::{default_routing_priority, Delivery, Policy, Routing, SmtpDelivery};

    fn tenant(name: &str, allowed: &[&str], domains: &[&str], ranges: &[&str], priority: i32) -> Tenant {
        Tenant {
            name: name.to_string(),
            allowed_senders: allowed.iter().map(|s| s.to_string()).collect(),
            routing: Routing {
                ip_ranges: ranges.iter().map(|s| s.to_string()).collect(),
                sender_domains: domains.iter().map(|s| s.to_string()).collect(),
                priority,
            },
            policy: Policy::default(),
            delivery: Delivery::Smtp(SmtpDelivery {
                smtp_server: "upstream".to_string(),
            }),
        }
    }

    fn rcpts(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|s| s.to_string()).collect()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_allowed_senders_beats_domain_match() {
        let tenants = vec![
            tenant("by-domain", &[], &["example.com"], &[], 10),
            tenant("by-rcpt", &["ops@example.com"], &[], &[], 50),
        ];
        let res = resolve(
            &tenants,
            ip("10.0.0.1"),
            &rcpts(&["ops@example.com"]),
            &default_routing_priority(),
        )
        .unwrap();
        assert_eq!(res.tenant.name, "by-rcpt");
        assert_eq!(res.matched_by, Some(RoutingMethod::AllowedSenders));
    }

    #[test]
    fn test_priority_ordering_within_method() {
        let tenants = vec![
            tenant("second", &[], &["example.com"], &[], 20),
            tenant("first", &[], &["example.com"], &[], 10),
        ];
        let res = resolve(
            &tenants,
            ip("10.0.0.1"),
            &rcpts(&["a@example.com"]),
            &default_routing_priority(),
        )
        .unwrap();
        assert_eq!(res.tenant.name, "first");
    }

    #[test]
    fn test_ties_keep_definition_order() {
        let tenants = vec![
            tenant("defined-first", &[], &["example.com"], &[], 100),
            tenant("defined-second", &[], &["example.com"], &[], 100),
        ];
        let res = resolve(
            &tenants,
            ip("10.0.0.1"),
            &rcpts(&["a@example.com"]),
            &default_routing_priority(),
        )
        .unwrap();
        assert_eq!(res.tenant.name, "defined-first");
    }

    #[test]
    fn test_case_insensitive_matches() {
        let tenants = vec![tenant("acme", &["Ops@Example.COM"], &["EXAMPLE.net"], &[], 10)];
        let res = resolve(
            &tenants,
            ip("10.0.0.1"),
            &rcpts(&["OPS@example.com"]),
            &default_routing_priority(),
        )
        .unwrap();
        assert_eq!(res.matched_by, Some(RoutingMethod::AllowedSenders));

        let res = resolve(
            &tenants,
            ip("10.0.0.1"),
            &rcpts(&["someone@example.NET"]),
            &default_routing_priority(),
        )
        .unwrap();
        assert_eq!(res.matched_by, Some(RoutingMethod::SenderDomains));
    }

    #[test]
    fn test_ip_range_match() {
        let tenants = vec![
            tenant("net-a", &[], &["a.example"], &["10.0.0.0/24"], 10),
            tenant("net-b", &[], &["b.example"], &["192.168.0.0/16"], 20),
        ];
        let res = resolve(
            &tenants,
            ip("192.168.3.4"),
            &rcpts(&["nobody@elsewhere.example"]),
            &default_routing_priority(),
        )
        .unwrap();
        assert_eq!(res.tenant.name, "net-b");
        assert_eq!(res.matched_by, Some(RoutingMethod::IpRanges));
    }

    #[test]
    fn test_fallback_to_lowest_priority_value() {
        let tenants = vec![
            tenant("low-prio", &[], &["a.example"], &[], 200),
            tenant("high-prio", &[], &["b.example"], &[], 5),
        ];
        let res = resolve(
            &tenants,
            ip("172.16.0.1"),
            &rcpts(&["x@nomatch.example"]),
            &default_routing_priority(),
        )
        .unwrap();
        assert!(res.is_fallback());
        assert_eq!(res.tenant.name, "high-prio");
    }

    #[test]
    fn test_custom_routing_priority_order() {
        // With ipRanges first, the IP match wins over the recipient match.
        let tenants = vec![
            tenant("by-rcpt", &["ops@example.com"], &[], &[], 10),
            tenant("by-ip", &[], &["ip.example"], &["10.0.0.0/8"], 20),
        ];
        let priority = vec![
            RoutingMethod::IpRanges,
            RoutingMethod::AllowedSenders,
            RoutingMethod::SenderDomains,
        ];
        let res = resolve(&tenants, ip("10.1.2.3"), &rcpts(&["ops@example.com"]), &priority).unwrap();
        assert_eq!(res.tenant.name, "by-ip");
    }

    #[test]
    fn test_deterministic() {
        let tenants = vec![
            tenant("a", &["x@x.example"], &["x.example"], &["10.0.0.0/8"], 10),
            tenant("b", &[], &["y.example"], &[], 20),
        ];
        let recipients = rcpts(&["x@x.example", "z@y.example"]);
        let first = resolve(&tenants, ip("10.0.0.1"), &recipients, &default_routing_priority())
            .unwrap()
            .tenant
            .name
            .clone();
        for _ in 0..10 {
            let again = resolve(&tenants, ip("10.0.0.1"), &recipients, &default_routing_priority())
                .unwrap();
            assert_eq!(again.tenant.name, first);
        }
    }

    #[test]
    fn test_no_tenants_is_an_error() {
        let err = resolve(&[], ip("10.0.0.1"), &rcpts(&["a@b.c"]), &default_routing_priority())
            .unwrap_err();
        assert!(matches!(err, RelayError::NoTenants));
    }
}
