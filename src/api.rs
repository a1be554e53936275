//! HTTPS JSON API.
//!
//! A single route: `GET /` returns the merged dataset as JSON, or 500 when
//! the upstream pull fails. TLS is mandatory; missing material is replaced
//! with a temporary self-signed pair.

use crate::cache::Cache;
use crate::config::Config;
use crate::dataset::Dataset;
use crate::pem::{self, SelfSignedMaterial};
use crate::prelude::*;
use crate::supervisor::SubsystemError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct AppState {
    config: Arc<Config>,
    cache: Arc<Cache>,
}

pub struct HttpServer {
    listener: TcpListener,
    tls: RustlsConfig,
    state: Arc<AppState>,
    _material: Option<SelfSignedMaterial>,
}

impl HttpServer {
    pub async fn new(config: Arc<Config>, cache: Arc<Cache>) -> Result<Self, SubsystemError> {
        let addr = config.https_addr()?;
        let listener =
            bind_listener(addr, config.tls.so_reuse_port).map_err(|source| SubsystemError::Bind {
                listener: "tls",
                addr,
                source,
            })?;
        info!("HTTPS API listening on {}", addr);

        let configured = match (&config.tls.certificate, &config.tls.key) {
            (Some(certificate), Some(key)) if !certificate.is_empty() && !key.is_empty() => {
                Some((PathBuf::from(certificate), PathBuf::from(key)))
            }
            _ => None,
        };
        let (certificate, key, material) = match configured {
            Some((certificate, key)) => (certificate, key, None),
            None => {
                warn!("Creating temporary self-signed certificate and key");
                let material = pem::generate_self_signed()?;
                (
                    material.certificate_path().to_path_buf(),
                    material.key_path().to_path_buf(),
                    Some(material),
                )
            }
        };
        let tls = RustlsConfig::from_pem_file(&certificate, &key).await?;

        if let Some(ca) = &config.tls.mtls.ca_certificate {
            // Parsed but not enforced; clients are not verified.
            debug!("mTLS CA certificate configured: {}", ca);
        }

        Ok(Self {
            listener,
            tls,
            state: Arc::new(AppState { config, cache }),
            _material: material,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SubsystemError> {
        let router = Router::new()
            .route("/", get(root))
            .with_state(Arc::clone(&self.state));

        let handle = Handle::new();
        let watcher = {
            let handle = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                handle.graceful_shutdown(Some(Duration::from_secs(5)));
            })
        };

        let served = axum_server::from_tcp_rustls(self.listener, self.tls)
            .handle(handle)
            .serve(router.into_make_service())
            .await;
        watcher.abort();
        served?;

        trace!("HTTP server shutdown");
        Ok(())
    }
}

async fn root(State(state): State<Arc<AppState>>) -> Result<Json<Dataset>, StatusCode> {
    match Dataset::build(&state.config, &state.cache).await {
        Ok(dataset) => Ok(Json(dataset)),
        Err(err) => {
            error!("Unable to build dataset: {}", err);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Bind the API listener; `SO_REUSEPORT` allows multiple instances via
/// systemd templated units.
fn bind_listener(addr: SocketAddr, reuse_port: bool) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        trace!("SO_REUSEPORT enabled");
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}
