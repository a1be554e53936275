//! Cache bookkeeping for advertisements.
//!
//! Every advertisement writes three slots: the `AllNodes` directory (name
//! added if absent, no expiration), `<name>` → JSON payload, and
//! `<overlay-node-id>` → name. The reverse mapping lets an eviction clean all
//! three. Writers run on the node event loop, so directory updates are
//! serialized.

use crate::cache::Cache;
use crate::dataset::{all_nodes, ALL_NODES_KEY};
use crate::messages::{AgentInfoMessage, DecodeError};
use crate::prelude::*;
use std::time::Duration;

pub fn record_advertisement(
    cache: &Cache,
    node_id: &str,
    message: &AgentInfoMessage,
    ttl: Duration,
) -> Result<(), DecodeError> {
    let mut nodes = all_nodes(cache);
    if !nodes.iter().any(|name| name == &message.name) {
        nodes.push(message.name.clone());
        cache.set(ALL_NODES_KEY, serde_json::to_vec(&nodes)?, None);
    }

    cache.set(&message.name, message.marshal()?, Some(ttl));
    cache.set(node_id, message.name.clone().into_bytes(), Some(ttl));
    Ok(())
}

/// Reverse the bookkeeping for an evicted overlay peer: drop its payload,
/// its node-id mapping, and its directory membership.
pub fn forget_peer(cache: &Cache, node_id: &str) {
    let Some(raw) = cache.get(node_id) else {
        cache.delete(node_id);
        return;
    };
    let name = String::from_utf8_lossy(&raw).to_string();

    cache.delete(node_id);
    cache.delete(&name);

    let nodes: Vec<String> = all_nodes(cache)
        .into_iter()
        .filter(|node| node != &name)
        .collect();
    match serde_json::to_vec(&nodes) {
        Ok(raw) => cache.set(ALL_NODES_KEY, raw, None),
        Err(err) => trace!("Unable to rewrite node directory: {}", err),
    }
}

/// Drop directory names whose payload entry has expired. Runs once per tick
/// to keep the directory within one tick of the payload slots.
pub fn prune_directory(cache: &Cache) {
    let nodes = all_nodes(cache);
    let live: Vec<String> = nodes
        .iter()
        .filter(|name| cache.get(name).is_some())
        .cloned()
        .collect();
    if live.len() == nodes.len() {
        return;
    }
    match serde_json::to_vec(&live) {
        Ok(raw) => cache.set(ALL_NODES_KEY, raw, None),
        Err(err) => trace!("Unable to rewrite node directory: {}", err),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::prelude::{assert_eq, *};

    const TTL: Duration = Duration::from_secs(30);

    fn message(name: &str) -> AgentInfoMessage {
        AgentInfoMessage {
            name: name.to_string(),
            services: Vec::new(),
        }
    }

    #[test]
    fn advertisement_fills_all_three_slots() {
        let cache = Cache::new();
        record_advertisement(&cache, "node-1", &message("api"), TTL).unwrap();

        assert_eq!(all_nodes(&cache), ["api"]);
        assert_eq!(
            AgentInfoMessage::unmarshal(&cache.get("api").unwrap()).unwrap(),
            message("api")
        );
        assert_eq!(cache.get("node-1").unwrap(), b"api".to_vec());
    }

    #[test]
    fn refresh_does_not_duplicate_directory_entries() {
        let cache = Cache::new();
        record_advertisement(&cache, "node-1", &message("api"), TTL).unwrap();
        record_advertisement(&cache, "node-1", &message("api"), TTL).unwrap();
        record_advertisement(&cache, "node-2", &message("web"), TTL).unwrap();

        let mut nodes = all_nodes(&cache);
        nodes.sort();
        assert_eq!(nodes, ["api", "web"]);
    }

    #[test]
    fn eviction_cleans_every_slot() {
        let cache = Cache::new();
        record_advertisement(&cache, "node-1", &message("api"), TTL).unwrap();
        record_advertisement(&cache, "node-2", &message("web"), TTL).unwrap();

        forget_peer(&cache, "node-1");

        assert_eq!(all_nodes(&cache), ["web"]);
        assert_eq!(cache.get("api"), None);
        assert_eq!(cache.get("node-1"), None);
        assert!(cache.get("web").is_some());
    }

    #[test]
    fn eviction_of_an_unknown_peer_is_harmless() {
        let cache = Cache::new();
        record_advertisement(&cache, "node-1", &message("api"), TTL).unwrap();

        forget_peer(&cache, "node-9");

        assert_eq!(all_nodes(&cache), ["api"]);
    }

    #[test]
    fn eviction_after_payload_expiry_still_prunes_the_mapping() {
        let cache = Cache::new();
        record_advertisement(&cache, "node-1", &message("api"), Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        // The name and node-id slots have expired; the directory has not.
        assert_eq!(all_nodes(&cache), ["api"]);
        forget_peer(&cache, "node-1");
        assert_eq!(cache.get("node-1"), None);
    }

    #[test]
    fn tick_pruning_drops_expired_names_from_the_directory() {
        let cache = Cache::new();
        record_advertisement(&cache, "node-1", &message("api"), Duration::from_millis(10)).unwrap();
        record_advertisement(&cache, "node-2", &message("web"), TTL).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        prune_directory(&cache);

        assert_eq!(all_nodes(&cache), ["web"]);
    }
}
