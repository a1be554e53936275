//! Wire model for the mesh advertisement protocol.
//!
//! A single message type is registered on the overlay: [`AgentInfoMessage`],
//! framed as raw JSON. The codec is symmetric; `unmarshal(marshal(m)) == m`.

use crate::prelude::*;
use smallvec::SmallVec;

/// A service exported by an agent.
///
/// `interface` empty means "any/first interface".
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Service {
    pub name: String,

    pub port: u16,

    /// Transport, `tcp` or `udp` (other values pass through unfiltered).
    #[serde(default)]
    pub proto: String,

    #[serde(default)]
    pub tags: SmallVec<[String; 4]>,

    #[serde(default)]
    pub interface: String,
}

/// Advertisement payload carried over the mesh: the agent's logical name and
/// its exported service catalog.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct AgentInfoMessage {
    pub name: String,

    #[serde(default)]
    pub services: Vec<Service>,
}

/// Acknowledgement for an advertisement push. Carries nothing; its only
/// purpose is to complete the request/response exchange.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct AgentInfoAck {}

#[derive(Error, Debug)]
#[error("unable to unmarshal message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl AgentInfoMessage {
    pub fn marshal(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(buf)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::prelude::{assert_eq, *};
    use smallvec::smallvec;

    fn service_strategy() -> impl Strategy<Value = Service> {
        (
            "[a-z][a-z0-9-]{0,15}",
            any::<u16>(),
            prop_oneof![Just("tcp".to_string()), Just("udp".to_string())],
            proptest::collection::vec("[a-z]{1,8}", 0..4),
            "[a-z0-9]{0,8}",
        )
            .prop_map(|(name, port, proto, tags, interface)| Service {
                name,
                port,
                proto,
                tags: tags.into_iter().collect(),
                interface,
            })
    }

    #[test]
    fn codec_round_trip() {
        proptest!(|(
            name in "[a-z][a-z0-9-]{0,31}",
            services in proptest::collection::vec(service_strategy(), 0..8),
        )| {
            let message = AgentInfoMessage { name, services };
            let buf = message.marshal().unwrap();
            prop_assert_eq!(AgentInfoMessage::unmarshal(&buf).unwrap(), message);
        })
    }

    #[test]
    fn json_field_names_match_wire_format() {
        let message = AgentInfoMessage {
            name: "api".into(),
            services: vec![Service {
                name: "http".into(),
                port: 8080,
                proto: "tcp".into(),
                tags: smallvec!["primary".to_string()],
                interface: "eth0".into(),
            }],
        };

        let value: serde_json::Value =
            serde_json::from_slice(&message.marshal().unwrap()).unwrap();
        assert_eq!(value["name"], "api");
        assert_eq!(value["services"][0]["name"], "http");
        assert_eq!(value["services"][0]["port"], 8080);
        assert_eq!(value["services"][0]["proto"], "tcp");
        assert_eq!(value["services"][0]["tags"][0], "primary");
        assert_eq!(value["services"][0]["interface"], "eth0");
    }

    #[test]
    fn unmarshal_rejects_garbage() {
        assert!(AgentInfoMessage::unmarshal(b"{\"name\": ").is_err());
        assert!(AgentInfoMessage::unmarshal(b"[]").is_err());
    }

    #[test]
    fn missing_optional_fields_default() {
        let message = AgentInfoMessage::unmarshal(br#"{"name":"web"}"#).unwrap();
        assert_eq!(message.name, "web");
        assert!(message.services.is_empty());
    }
}
