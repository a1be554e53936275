//! Stack of behaviours for the node.
//!
//! Implemented protocols:
//!
//! * `/lexa/kad/1.0.0` (Kademlia peer discovery)
//! * `/ipfs/id/1.0.0` (identify, feeds observed addresses into the DHT)
//! * `/ipfs/ping/1.0.0`
//! * `/lexa/agent-info/1.0.0` (advertisement push, JSON framed)

use super::json_codec::JsonCodec;
use crate::messages::{AgentInfoAck, AgentInfoMessage};
use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, kad, ping, StreamProtocol};
use std::iter;
use std::time::Duration;

const DHT_PROTOCOL: &str = "/lexa/kad/1.0.0";
const AGENT_INFO_PROTOCOL: &str = "/lexa/agent-info/1.0.0";

pub type AgentInfoCodec = JsonCodec<AgentInfoMessage, AgentInfoAck>;
pub type AgentInfoEvent = request_response::Event<AgentInfoMessage, AgentInfoAck>;

#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub agent_info: request_response::Behaviour<AgentInfoCodec>,
}

impl Behaviour {
    pub fn new(keypair: &Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();

        let mut kad_config = kad::Config::default();
        kad_config.set_protocol_names(vec![StreamProtocol::new(DHT_PROTOCOL)]);
        kad_config.set_query_timeout(Duration::from_secs(5));
        let store = MemoryStore::new(peer_id);
        let mut kademlia = kad::Behaviour::with_config(peer_id, store, kad_config);
        // Always serve routing queries; nodes discover each other through us.
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            "/lexa/1.0.0".to_string(),
            keypair.public(),
        ));

        let ping = ping::Behaviour::default();

        let agent_info = request_response::Behaviour::with_codec(
            AgentInfoCodec::default(),
            iter::once((StreamProtocol::new(AGENT_INFO_PROTOCOL), ProtocolSupport::Full)),
            request_response::Config::default(),
        );

        Self {
            kademlia,
            identify,
            ping,
            agent_info,
        }
    }
}
