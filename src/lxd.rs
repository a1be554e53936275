//! Client for the container manager's Unix-socket control plane.
//!
//! One call is needed: list containers with full state
//! (`GET /1.0/containers?recursion=2`). Responses arrive wrapped in the
//! standard `{"metadata": ...}` envelope.

use crate::prelude::*;
use hyper::{body, Client, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use std::collections::HashMap;

/// Runtime status code for a running container.
pub const STATUS_RUNNING: i64 = 103;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("container manager unreachable: {0}")]
    Transport(#[from] hyper::Error),

    #[error("container manager returned HTTP {0}")]
    Status(StatusCode),

    #[error("malformed container manager payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    metadata: T,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Container {
    pub name: String,

    #[serde(default)]
    pub state: Option<ContainerState>,
}

impl Container {
    pub fn is_running(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.status_code == STATUS_RUNNING)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ContainerState {
    #[serde(default)]
    pub status_code: i64,

    /// Interface name → addresses assigned to it.
    #[serde(default)]
    pub network: HashMap<String, Network>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub addresses: Vec<Address>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Address {
    pub address: String,
}

/// List every container with full state over the control socket.
pub async fn containers_full(socket: &str) -> Result<Vec<Container>, UpstreamError> {
    let client: Client<UnixConnector> = Client::unix();
    let uri: hyper::Uri = Uri::new(socket, "/1.0/containers?recursion=2").into();

    let response = client.get(uri).await?;
    if response.status() != StatusCode::OK {
        return Err(UpstreamError::Status(response.status()));
    }

    let bytes = body::to_bytes(response.into_body()).await?;
    let envelope: Envelope<Vec<Container>> = serde_json::from_slice(&bytes)?;
    Ok(envelope.metadata)
}
