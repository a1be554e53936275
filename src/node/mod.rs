//! The peer mesh node.
//!
//! Agents and servers join the same Kademlia overlay. Every node advertises
//! its hostname and configured services to all known peers on a fixed tick;
//! servers additionally record inbound advertisements in the cache, keyed by
//! agent name and by overlay node id, and clean both up when the overlay
//! evicts a peer.

mod advert;
mod behaviour;
mod json_codec;

use self::behaviour::{AgentInfoEvent, Behaviour, BehaviourEvent};
use crate::cache::Cache;
use crate::config::{Config, Role};
use crate::messages::{AgentInfoAck, AgentInfoMessage};
use crate::prelude::*;
use crate::supervisor::SubsystemError;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, identity, kad, request_response, Multiaddr, PeerId, Swarm, SwarmBuilder};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Node {
    swarm: Swarm<Behaviour>,
    config: Arc<Config>,
    cache: Arc<Cache>,
    role: Role,
    bootstrap: Vec<Multiaddr>,
    /// Peer ids observed on bootstrap addresses, to skip redundant dials.
    bootstrap_peers: HashMap<Multiaddr, PeerId>,
}

impl Node {
    /// Construct a node bound to the validated `<role>.p2p` address. The
    /// bind address must be a concrete, non-loopback, non-multicast IPv4
    /// address.
    pub fn new(config: Arc<Config>, cache: Arc<Cache>, role: Role) -> Result<Self, SubsystemError> {
        let addr = config.p2p(role).bind_addr()?;
        Self::bound(config, cache, role, addr)
    }

    fn bound(
        config: Arc<Config>,
        cache: Arc<Cache>,
        role: Role,
        addr: SocketAddr,
    ) -> Result<Self, SubsystemError> {
        let keypair = identity::Keypair::generate_ed25519();

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                Default::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|err| SubsystemError::Overlay(err.to_string()))?
            .with_behaviour(|key| Behaviour::new(key))
            .map_err(|err| SubsystemError::Overlay(err.to_string()))?
            .with_swarm_config(|swarm_config| {
                swarm_config.with_idle_connection_timeout(Duration::from_secs(60))
            })
            .build();

        info!("Peer Id: {}", swarm.local_peer_id());

        let listen: Multiaddr = format!("/ip4/{}/tcp/{}", addr.ip(), addr.port())
            .parse()
            .map_err(|err: libp2p::multiaddr::Error| SubsystemError::Overlay(err.to_string()))?;
        swarm
            .listen_on(listen)
            .map_err(|err| SubsystemError::Overlay(err.to_string()))?;

        let bootstrap = config
            .p2p(role)
            .bootstrap_peers
            .iter()
            .filter_map(|entry| match bootstrap_multiaddr(entry) {
                Some(addr) => Some(addr),
                None => {
                    warn!("Ignoring unparseable bootstrap peer {:?}", entry);
                    None
                }
            })
            .collect();

        Ok(Self {
            swarm,
            config,
            cache,
            role,
            bootstrap,
            bootstrap_peers: HashMap::new(),
        })
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SubsystemError> {
        // Startup pass: reach out to the configured peers and kick off a
        // discovery query before the first tick.
        self.ping_bootstrap_peers();
        self.discover();

        let period = self.config.p2p(self.role).scan_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(),
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }

        info!("P2P node shutdown");
        Ok(())
    }

    fn tick(&mut self) {
        self.cache.purge();
        advert::prune_directory(&self.cache);
        self.ping_bootstrap_peers();
        self.discover();
        self.advertise();
    }

    /// Best-effort reachability ping of every bootstrap peer that is not
    /// currently connected.
    fn ping_bootstrap_peers(&mut self) {
        for addr in self.bootstrap.clone() {
            let connected = self
                .bootstrap_peers
                .get(&addr)
                .is_some_and(|peer| self.swarm.is_connected(peer));
            if connected {
                continue;
            }
            match self.swarm.dial(addr.clone()) {
                Ok(()) => trace!("Pinging bootstrap peer {}", addr),
                Err(err) => trace!("Bootstrap ping to {} failed: {}", addr, err),
            }
        }
    }

    /// Refresh the routing table.
    fn discover(&mut self) {
        if let Err(err) = self.swarm.behaviour_mut().kademlia.bootstrap() {
            trace!("Discovery pass skipped: {}", err);
        }
    }

    /// Push this node's catalog to every currently-known peer. Failures are
    /// logged and retried implicitly on the next tick.
    fn advertise(&mut self) {
        let message = AgentInfoMessage {
            name: self.config.p2p(self.role).hostname(),
            services: self.config.agent.service.clone(),
        };

        let peers: Vec<PeerId> = self.swarm.connected_peers().cloned().collect();
        for peer in peers {
            let request_id = self
                .swarm
                .behaviour_mut()
                .agent_info
                .send_request(&peer, message.clone());
            trace!("Advertising to {} ({:?})", peer, request_id);
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("P2P node listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                let addr = endpoint.get_remote_address();
                if self.bootstrap.contains(addr) {
                    self.bootstrap_peers.insert(addr.clone(), peer_id);
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                // Feed observed addresses into the DHT so peers become
                // routable.
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kademlia(event)) => {
                self.handle_kademlia_event(event);
            }
            SwarmEvent::Behaviour(BehaviourEvent::AgentInfo(event)) => {
                self.handle_agent_info_event(event);
            }
            _ => {}
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        if let kad::Event::RoutingUpdated {
            peer,
            is_new_peer,
            old_peer,
            ..
        } = event
        {
            if is_new_peer {
                info!("Learned about a new peer {}", peer);
            }
            if let Some(evicted) = old_peer {
                self.peer_evicted(evicted);
            }
        }
    }

    fn peer_evicted(&mut self, peer: PeerId) {
        info!("Forgotten a peer {}", peer);
        advert::forget_peer(&self.cache, &peer.to_base58());
    }

    fn handle_agent_info_event(&mut self, event: AgentInfoEvent) {
        match event {
            request_response::Event::Message {
                peer,
                message:
                    request_response::Message::Request {
                        request, channel, ..
                    },
            } => {
                if self.role == Role::Server && peer != *self.swarm.local_peer_id() {
                    let ttl = self.config.p2p(self.role).advertisement_ttl();
                    match advert::record_advertisement(
                        &self.cache,
                        &peer.to_base58(),
                        &request,
                        ttl,
                    ) {
                        Ok(()) => debug!(
                            "{} advertised {} service(s)",
                            request.name,
                            request.services.len()
                        ),
                        Err(err) => trace!("Dropping advertisement from {}: {}", peer, err),
                    }
                }
                let _ = self
                    .swarm
                    .behaviour_mut()
                    .agent_info
                    .send_response(channel, AgentInfoAck::default());
            }
            // Acks carry nothing.
            request_response::Event::Message {
                message: request_response::Message::Response { .. },
                ..
            } => {}
            request_response::Event::OutboundFailure { peer, error, .. } => {
                trace!("Advertisement to {} failed: {:?}", peer, error);
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                trace!("Inbound advertisement from {} failed: {:?}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}

/// Bootstrap peers are configured as `host:port`; full multiaddrs pass
/// through untouched.
fn bootstrap_multiaddr(entry: &str) -> Option<Multiaddr> {
    if let Ok(addr) = entry.parse::<Multiaddr>() {
        return Some(addr);
    }

    let socket = entry.to_socket_addrs().ok()?.next()?;
    let addr = match socket {
        SocketAddr::V4(v4) => format!("/ip4/{}/tcp/{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("/ip6/{}/tcp/{}", v6.ip(), v6.port()),
    };
    addr.parse().ok()
}
