//! The discovery dataplane: the merged view of local container hosts and
//! peer-advertised services.
//!
//! A [`Dataset`] is rebuilt on every query from two sources: the container
//! manager (interfaces of running containers) and the cache (services pushed
//! over the mesh). Nothing here is persisted.

use crate::cache::Cache;
use crate::config::Config;
use crate::lxd;
use crate::messages::{AgentInfoMessage, Service};
use crate::prelude::*;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use std::net::{IpAddr, Ipv6Addr};

/// Cache key of the directory of advertised agent names.
pub(crate) const ALL_NODES_KEY: &str = "AllNodes";

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InterfaceElement {
    pub name: String,
    pub ip: IpAddr,
}

/// Interface lists, most recently observed first. Addresses that cannot be
/// reached from a peer (loopback, multicast, link-local) never enter them.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Interfaces {
    pub ipv4: Vec<InterfaceElement>,
    pub ipv6: Vec<InterfaceElement>,
}

impl Interfaces {
    /// Prepend, so "pick the first" means "prefer most recent".
    pub fn prepend(&mut self, name: &str, ip: IpAddr) {
        let element = InterfaceElement {
            name: name.to_string(),
            ip,
        };
        match ip {
            IpAddr::V4(_) => self.ipv4.insert(0, element),
            IpAddr::V6(_) => self.ipv6.insert(0, element),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct Host {
    pub name: String,
    pub interfaces: Interfaces,
    pub services: Vec<Service>,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize)]
pub struct Dataset {
    pub hosts: Vec<Host>,
}

/// The upstream pull failed; `partial` still carries everything known from
/// peer advertisements so callers can degrade instead of going dark.
#[derive(Error, Debug)]
#[error("unable to fetch hosts from upstream: {source}")]
pub struct BuildError {
    #[source]
    pub source: lxd::UpstreamError,
    pub partial: Dataset,
}

impl Dataset {
    /// Merge the local container inventory with cached peer advertisements.
    pub async fn build(config: &Config, cache: &Cache) -> Result<Self, BuildError> {
        let mut upstream = Ok(());
        let mut hosts = Vec::new();

        if !config.lxd.socket.is_empty() {
            match lxd::containers_full(&config.lxd.socket).await {
                Ok(containers) => hosts = hosts_from_containers(containers, &config.suffix),
                Err(err) => {
                    error!("Unable to fetch hosts from upstream: {}", err);
                    upstream = Err(err);
                }
            }
        }

        merge_advertised(&mut hosts, cache, &config.suffix);

        let dataset = Dataset { hosts };
        match upstream {
            Ok(()) => Ok(dataset),
            Err(source) => Err(BuildError {
                source,
                partial: dataset,
            }),
        }
    }
}

/// The agent names currently known via mesh advertisements.
pub(crate) fn all_nodes(cache: &Cache) -> Vec<String> {
    cache
        .get(ALL_NODES_KEY)
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .unwrap_or_default()
}

fn hosts_from_containers(containers: Vec<lxd::Container>, suffix: &str) -> Vec<Host> {
    let mut hosts = Vec::new();

    for container in containers {
        // Only pull data from running containers.
        if !container.is_running() {
            continue;
        }

        let mut interfaces = Interfaces::default();
        if let Some(state) = &container.state {
            for (network_name, network) in &state.network {
                for address in &network.addresses {
                    let Ok(ip) = address.address.parse::<IpAddr>() else {
                        continue;
                    };
                    if is_unreachable(ip) {
                        continue;
                    }
                    interfaces.prepend(network_name, ip);
                }
            }
        }

        hosts.push(Host {
            name: format!("{}.{}", container.name, suffix),
            interfaces,
            services: Vec::new(),
        });
    }

    hosts
}

fn merge_advertised(hosts: &mut Vec<Host>, cache: &Cache, suffix: &str) {
    for node in all_nodes(cache) {
        let Some(raw) = cache.get(&node) else {
            // Expired since the directory was written; the next eviction or
            // tick prunes the directory itself.
            continue;
        };
        let message = match AgentInfoMessage::unmarshal(&raw) {
            Ok(message) => message,
            Err(err) => {
                trace!("Dropping malformed advertisement for {}: {}", node, err);
                continue;
            }
        };

        let name = format!("{}.{}", message.name, suffix);
        if let Some(host) = hosts.iter_mut().find(|host| host.name == name) {
            host.services.extend(message.services);
        } else {
            // Purely-advertised hosts carry services only, no addresses.
            hosts.push(Host {
                name,
                interfaces: Interfaces::default(),
                services: message.services,
            });
        }
    }
}

/// Loopback, multicast (any scope) and link-local unicast addresses are
/// useless to remote resolver clients.
fn is_unreachable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_multicast() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_multicast() || is_unicast_link_local(v6),
    }
}

// Ipv6Addr::is_unicast_link_local is unstable on older toolchains; fe80::/10.
fn is_unicast_link_local(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

/// One `{"<name>": "<address>"}` object per element, preserving list order.
struct InterfacePairs<'a>(&'a [InterfaceElement]);

impl Serialize for InterfacePairs<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for element in self.0 {
            let mut single = serde_json::Map::with_capacity(1);
            single.insert(element.name.clone(), element.ip.to_string().into());
            seq.serialize_element(&single)?;
        }
        seq.end()
    }
}

impl Serialize for Interfaces {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("ipv4", &InterfacePairs(&self.ipv4))?;
        map.serialize_entry("ipv6", &InterfacePairs(&self.ipv6))?;
        map.end()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::prelude::{assert_eq, *};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn container(name: &str, status_code: i64, addresses: &[(&str, &str)]) -> lxd::Container {
        let mut network: HashMap<String, lxd::Network> = HashMap::new();
        for (interface, address) in addresses {
            network
                .entry(interface.to_string())
                .or_default()
                .addresses
                .push(lxd::Address {
                    address: address.to_string(),
                });
        }
        lxd::Container {
            name: name.to_string(),
            state: Some(lxd::ContainerState {
                status_code,
                network,
            }),
        }
    }

    fn arbitrary_ip() -> impl Strategy<Value = IpAddr> {
        prop_oneof![
            any::<u32>().prop_map(|bits| IpAddr::V4(Ipv4Addr::from(bits))),
            any::<u128>().prop_map(|bits| IpAddr::V6(Ipv6Addr::from(bits))),
        ]
    }

    #[test]
    fn address_families_are_partitioned() {
        proptest!(|(ips in proptest::collection::vec(arbitrary_ip(), 0..24))| {
            let addresses: Vec<(String, String)> = ips
                .iter()
                .enumerate()
                .map(|(i, ip)| (format!("eth{}", i % 3), ip.to_string()))
                .collect();
            let borrowed: Vec<(&str, &str)> = addresses
                .iter()
                .map(|(name, ip)| (name.as_str(), ip.as_str()))
                .collect();

            let hosts =
                hosts_from_containers(vec![container("web", lxd::STATUS_RUNNING, &borrowed)], "lexa");
            prop_assert_eq!(hosts.len(), 1);

            let interfaces = &hosts[0].interfaces;
            prop_assert!(interfaces.ipv4.iter().all(|e| e.ip.is_ipv4()));
            prop_assert!(interfaces.ipv6.iter().all(|e| e.ip.is_ipv6()));

            for element in interfaces.ipv4.iter().chain(&interfaces.ipv6) {
                prop_assert!(!is_unreachable(element.ip));
            }
        })
    }

    #[test]
    fn link_local_and_loopback_are_excluded() {
        let hosts = hosts_from_containers(
            vec![container(
                "web",
                lxd::STATUS_RUNNING,
                &[
                    ("lo", "127.0.0.1"),
                    ("lo", "::1"),
                    ("eth0", "169.254.12.9"),
                    ("eth0", "fe80::1"),
                    ("eth0", "ff01::1"),
                    ("eth0", "ff02::2"),
                    ("eth0", "224.0.0.251"),
                    ("eth0", "10.0.0.5"),
                    ("eth0", "2001:db8::1"),
                ],
            )],
            "lexa",
        );

        let interfaces = &hosts[0].interfaces;
        assert_eq!(interfaces.ipv4.len(), 1);
        assert_eq!(interfaces.ipv4[0].ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(interfaces.ipv6.len(), 1);
        assert_eq!(interfaces.ipv6[0].ip, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn only_running_containers_contribute() {
        proptest!(|(status in proptest::collection::vec(0_i64..200, 1..16))| {
            let containers: Vec<lxd::Container> = status
                .iter()
                .enumerate()
                .map(|(i, code)| container(&format!("c{i}"), *code, &[("eth0", "10.0.0.5")]))
                .collect();

            let expected = status.iter().filter(|code| **code == lxd::STATUS_RUNNING).count();
            let hosts = hosts_from_containers(containers, "lexa");
            prop_assert_eq!(hosts.len(), expected);
        })
    }

    #[test]
    fn suffix_joins_host_names() {
        let hosts = hosts_from_containers(
            vec![container("web", lxd::STATUS_RUNNING, &[])],
            "lexa",
        );
        assert_eq!(hosts[0].name, "web.lexa");
    }

    #[test]
    fn most_recent_interface_is_first() {
        let mut interfaces = Interfaces::default();
        interfaces.prepend("eth0", "10.0.0.5".parse().unwrap());
        interfaces.prepend("eth1", "10.0.0.6".parse().unwrap());

        assert_eq!(interfaces.ipv4[0].name, "eth1");
        assert_eq!(interfaces.ipv4[1].name, "eth0");
    }

    fn seed_advertisement(cache: &Cache, name: &str, services: Vec<Service>) {
        let nodes: Vec<String> = {
            let mut nodes = all_nodes(cache);
            nodes.push(name.to_string());
            nodes
        };
        cache.set(ALL_NODES_KEY, serde_json::to_vec(&nodes).unwrap(), None);
        let message = AgentInfoMessage {
            name: name.to_string(),
            services,
        };
        cache.set(name, message.marshal().unwrap(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn advertised_services_merge_into_local_hosts() {
        let cache = Cache::new();
        let service = Service {
            name: "http".to_string(),
            port: 8080,
            proto: "tcp".to_string(),
            ..Service::default()
        };
        seed_advertisement(&cache, "web", vec![service.clone()]);
        seed_advertisement(&cache, "ghost", vec![service.clone()]);

        let mut hosts = hosts_from_containers(
            vec![container("web", lxd::STATUS_RUNNING, &[("eth0", "10.0.0.5")])],
            "lexa",
        );
        merge_advertised(&mut hosts, &cache, "lexa");

        assert_eq!(hosts.len(), 2);
        let web = hosts.iter().find(|h| h.name == "web.lexa").unwrap();
        assert_eq!(web.services, vec![service.clone()]);
        assert_eq!(web.interfaces.ipv4.len(), 1);

        let ghost = hosts.iter().find(|h| h.name == "ghost.lexa").unwrap();
        assert_eq!(ghost.services, vec![service]);
        assert!(ghost.interfaces.is_empty());
    }

    #[test]
    fn expired_directory_entries_are_skipped() {
        let cache = Cache::new();
        cache.set(
            ALL_NODES_KEY,
            serde_json::to_vec(&["gone".to_string()]).unwrap(),
            None,
        );

        let mut hosts = Vec::new();
        merge_advertised(&mut hosts, &cache, "lexa");
        assert!(hosts.is_empty());
    }

    #[test]
    fn interfaces_serialize_to_single_pair_objects() {
        let mut interfaces = Interfaces::default();
        interfaces.prepend("eth0", "10.0.0.5".parse().unwrap());
        interfaces.prepend("eth1", "10.0.0.6".parse().unwrap());
        interfaces.prepend("eth0", "2001:db8::1".parse().unwrap());

        let value = serde_json::to_value(&interfaces).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "ipv4": [ { "eth1": "10.0.0.6" }, { "eth0": "10.0.0.5" } ],
                "ipv6": [ { "eth0": "2001:db8::1" } ],
            })
        );
    }
}
