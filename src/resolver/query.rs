//! The structured query name grammar.
//!
//! Names are interpreted right to left: the zone suffix is anchored at the
//! end, qualifiers (`if`/`interface`/`service`) sit between the selector and
//! the base host name. Examples, with suffix `lexa`:
//!
//! ```text
//! web.lexa.                  base host
//! eth0.if.web.lexa.          one interface of a host
//! eth0.interface.web.lexa.   long form of the same
//! http.service.web.lexa.     service-qualified host (reserved)
//! _http._tcp.lexa.           RFC 2782 service lookup
//! http.service.lexa.         short service lookup
//! primary.http.service.lexa. tag-filtered service lookup
//! ```

const INTERFACE_LONG: &str = ".interface.";
const INTERFACE_SHORT: &str = ".if.";
const SERVICE: &str = ".service.";

/// A zone-level service lookup parsed from a SRV query name.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ServiceQuery<'a> {
    /// `_<service>._<proto>.<zone>`
    Rfc2782 { service: &'a str, proto: &'a str },
    /// `[<tag>.]<service>.service.<zone>`
    Named {
        service: &'a str,
        tag: Option<&'a str>,
    },
}

pub fn is_interface_query(name: &str) -> bool {
    name.contains(INTERFACE_LONG) || name.contains(INTERFACE_SHORT)
}

pub fn is_service_query(name: &str) -> bool {
    name.contains(SERVICE)
}

/// The base host portion of a query name: everything right of the last
/// qualifier, or the whole name when no qualifier is present.
pub fn base_hostname(name: &str) -> &str {
    for qualifier in [INTERFACE_LONG, INTERFACE_SHORT, SERVICE] {
        if let Some(position) = name.rfind(qualifier) {
            return &name[position + qualifier.len()..];
        }
    }
    name
}

/// The interface selector of an `if`/`interface` query.
pub fn interface_name(name: &str) -> Option<&str> {
    for qualifier in [INTERFACE_LONG, INTERFACE_SHORT] {
        if let Some(position) = name.find(qualifier) {
            return Some(&name[..position]);
        }
    }
    None
}

/// The service selector of a `service` query.
pub fn service_name(name: &str) -> Option<&str> {
    name.find(SERVICE).map(|position| &name[..position])
}

/// Parse a zone-level service lookup. `zone` carries its trailing dot
/// (`lexa.`). Host-qualified service names are not zone-level lookups and
/// return `None`.
pub fn parse_service_query<'a>(name: &'a str, zone: &str) -> Option<ServiceQuery<'a>> {
    let prefix = name
        .strip_suffix(zone)
        .filter(|prefix| !prefix.is_empty())?;
    let labels: Vec<&str> = prefix.trim_end_matches('.').split('.').collect();

    match labels.as_slice() {
        [service, proto] if is_rfc2782_label(service) && is_rfc2782_label(proto) => {
            Some(ServiceQuery::Rfc2782 {
                service: &service[1..],
                proto: &proto[1..],
            })
        }
        [service, "service"] => Some(ServiceQuery::Named {
            service,
            tag: None,
        }),
        [tag, service, "service"] => Some(ServiceQuery::Named {
            service,
            tag: Some(tag),
        }),
        _ => None,
    }
}

fn is_rfc2782_label(label: &str) -> bool {
    label.len() > 1 && label.starts_with('_')
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::prelude::{assert_eq, *};

    #[test]
    fn base_hostname_strips_qualifiers_right_to_left() {
        assert_eq!(base_hostname("web.lexa."), "web.lexa.");
        assert_eq!(base_hostname("eth0.if.web.lexa."), "web.lexa.");
        assert_eq!(base_hostname("eth0.interface.web.lexa."), "web.lexa.");
        assert_eq!(base_hostname("http.service.web.lexa."), "web.lexa.");
        // Pathological: a host label that itself contains a qualifier string
        // resolves from the rightmost occurrence.
        assert_eq!(base_hostname("a.if.b.if.web.lexa."), "web.lexa.");
    }

    #[test]
    fn interface_selector() {
        assert_eq!(interface_name("eth0.if.web.lexa."), Some("eth0"));
        assert_eq!(interface_name("eth1.interface.web.lexa."), Some("eth1"));
        assert_eq!(interface_name("web.lexa."), None);
    }

    #[test]
    fn service_selector() {
        assert_eq!(service_name("http.service.web.lexa."), Some("http"));
        assert_eq!(service_name("web.lexa."), None);
    }

    #[test]
    fn query_kind_predicates() {
        assert!(is_interface_query("eth0.if.web.lexa."));
        assert!(is_interface_query("eth0.interface.web.lexa."));
        assert!(!is_interface_query("web.lexa."));
        assert!(is_service_query("http.service.web.lexa."));
        assert!(!is_service_query("web.lexa."));
    }

    #[test]
    fn rfc2782_service_queries() {
        assert_eq!(
            parse_service_query("_http._tcp.lexa.", "lexa."),
            Some(ServiceQuery::Rfc2782 {
                service: "http",
                proto: "tcp",
            })
        );
        assert_eq!(
            parse_service_query("_dns._udp.lexa.", "lexa."),
            Some(ServiceQuery::Rfc2782 {
                service: "dns",
                proto: "udp",
            })
        );
    }

    #[test]
    fn named_service_queries() {
        assert_eq!(
            parse_service_query("http.service.lexa.", "lexa."),
            Some(ServiceQuery::Named {
                service: "http",
                tag: None,
            })
        );
        assert_eq!(
            parse_service_query("primary.http.service.lexa.", "lexa."),
            Some(ServiceQuery::Named {
                service: "http",
                tag: Some("primary"),
            })
        );
    }

    #[test]
    fn non_service_names_are_rejected() {
        assert_eq!(parse_service_query("web.lexa.", "lexa."), None);
        assert_eq!(parse_service_query("lexa.", "lexa."), None);
        // Host-qualified service names are not zone-level lookups.
        assert_eq!(parse_service_query("http.service.web.lexa.", "lexa."), None);
        // Underscore labels must name both service and proto.
        assert_eq!(parse_service_query("_http.tcp.lexa.", "lexa."), None);
        assert_eq!(parse_service_query("_._tcp.lexa.", "lexa."), None);
    }
}
