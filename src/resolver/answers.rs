//! Answer construction over the dataset.
//!
//! All emitted records carry TTL 0: the dataset is rebuilt per query and
//! clients must not cache. SRV answers are reshuffled on every response to
//! spread load across targets.

use super::query::{self, ServiceQuery};
use crate::dataset::{Dataset, Host};
use crate::prelude::*;
use hickory_proto::op::Query;
use hickory_proto::rr::rdata::{A, AAAA, SRV};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::seq::SliceRandom;
use std::net::IpAddr;

enum Family {
    V4,
    V6,
}

/// Answer a single question against the dataset. Names outside the zone and
/// unsupported record types yield no records.
pub fn answer_question(dataset: &Dataset, question: &Query, zone: &str) -> Vec<Record> {
    let mut qname = question.name().to_utf8().to_ascii_lowercase();
    if !qname.ends_with('.') {
        qname.push('.');
    }
    if !qname.ends_with(zone) {
        return Vec::new();
    }

    match question.query_type() {
        RecordType::A => address_records(dataset, question.name(), &qname, Family::V4),
        RecordType::AAAA => address_records(dataset, question.name(), &qname, Family::V6),
        RecordType::SRV => service_records(dataset, question.name(), &qname, zone),
        _ => Vec::new(),
    }
}

fn address_records(dataset: &Dataset, owner: &Name, qname: &str, family: Family) -> Vec<Record> {
    let base = query::base_hostname(qname);
    let mut records = Vec::new();

    for host in dataset.hosts.iter().filter(|host| host_matches(host, base)) {
        for ip in select_addresses(host, qname, &family) {
            records.push(address_record(owner, ip));
        }
    }

    records
}

/// The addresses a query name selects from one host, per the grammar: the
/// most recent interface for a bare name, every matching interface for an
/// `if`/`interface` name, nothing for the reserved `service` form.
fn select_addresses(host: &Host, qname: &str, family: &Family) -> Vec<IpAddr> {
    let list = match family {
        Family::V4 => &host.interfaces.ipv4,
        Family::V6 => &host.interfaces.ipv6,
    };

    if query::is_interface_query(qname) {
        let Some(interface) = query::interface_name(qname) else {
            return Vec::new();
        };
        list.iter()
            .filter(|element| element.name == interface)
            .map(|element| element.ip)
            .collect()
    } else if query::is_service_query(qname) {
        // Reserved for a future service-address policy.
        Vec::new()
    } else {
        list.first().map(|element| element.ip).into_iter().collect()
    }
}

fn service_records(dataset: &Dataset, owner: &Name, qname: &str, zone: &str) -> Vec<Record> {
    let Some(service_query) = query::parse_service_query(qname, zone) else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for host in &dataset.hosts {
        for service in &host.services {
            let selected = match &service_query {
                ServiceQuery::Rfc2782 { service: name, proto } => {
                    service.name == *name && service.proto == *proto
                }
                ServiceQuery::Named { service: name, tag } => {
                    service.name == *name
                        && tag.map_or(true, |tag| service.tags.iter().any(|t| t == tag))
                }
            };
            if !selected {
                continue;
            }

            let Some(target) = target_name(host, &service.interface) else {
                continue;
            };
            records.push(Record::from_rdata(
                owner.clone(),
                0,
                RData::SRV(SRV::new(1, 1, service.port, target)),
            ));
        }
    }

    // Reshuffled on every response to approximate client-side load
    // distribution.
    records.shuffle(&mut rand::thread_rng());
    records
}

/// SRV target for a service on a host: the service's pinned interface when it
/// names one the host actually has, the most recent IPv4 interface otherwise.
fn target_name(host: &Host, pinned: &str) -> Option<Name> {
    let interface = if pinned.is_empty() {
        host.interfaces.ipv4.first().map(|element| element.name.as_str())?
    } else if has_interface(host, pinned) {
        pinned
    } else {
        return None;
    };

    match Name::from_utf8(format!("{}.if.{}.", interface, host.name)) {
        Ok(name) => Some(name),
        Err(err) => {
            trace!("Unrepresentable SRV target for {}: {}", host.name, err);
            None
        }
    }
}

fn has_interface(host: &Host, interface: &str) -> bool {
    host.interfaces
        .ipv4
        .iter()
        .chain(&host.interfaces.ipv6)
        .any(|element| element.name == interface)
}

/// Literal match against `<host>.` or shell-style glob where the query acts
/// as the pattern.
fn host_matches(host: &Host, base: &str) -> bool {
    let dotted = format!("{}.", host.name);
    if dotted == base {
        return true;
    }
    glob::Pattern::new(base)
        .map(|pattern| pattern.matches(&dotted))
        .unwrap_or(false)
}

fn address_record(owner: &Name, ip: IpAddr) -> Record {
    let rdata = match ip {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    Record::from_rdata(owner.clone(), 0, rdata)
}
