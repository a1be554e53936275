//! DNS responder serving the discovery dataset over plain UDP and
//! DNS-over-TLS (RFC 7858).
//!
//! Only names under the configured suffix zone are answered. Unsupported
//! opcodes and unknown names get an empty reply, never NXDOMAIN; malformed
//! packets are dropped.

mod answers;
mod query;

use crate::cache::Cache;
use crate::config::Config;
use crate::dataset::Dataset;
use crate::pem::{self, SelfSignedMaterial};
use crate::prelude::*;
use crate::supervisor::SubsystemError;
use hickory_proto::op::{Message, MessageType, OpCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const MAX_UDP_PACKET: usize = 4096;

/// Stateless query handler shared by the UDP and DoT servers. The dataset is
/// rebuilt from the container manager and the cache on every request.
pub struct Resolver {
    config: Arc<Config>,
    cache: Arc<Cache>,
}

impl Resolver {
    pub fn new(config: Arc<Config>, cache: Arc<Cache>) -> Self {
        Self { config, cache }
    }

    /// Answer one wire-format message. `None` means the packet was
    /// unparseable and must be dropped without a reply.
    pub async fn handle(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(request) => request,
            Err(err) => {
                trace!("Dropping malformed DNS packet: {}", err);
                return None;
            }
        };

        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(request.op_code());
        response.set_recursion_desired(request.recursion_desired());
        for question in request.queries() {
            response.add_query(question.clone());
        }

        if request.message_type() == MessageType::Query && request.op_code() == OpCode::Query {
            let zone = self.config.zone();
            let dataset = match Dataset::build(&self.config, &self.cache).await {
                Ok(dataset) => dataset,
                // Degraded view: peer-advertised hosts only.
                Err(err) => err.partial,
            };

            for question in request.queries() {
                trace!(
                    "Query for {} {}",
                    question.name(),
                    question.query_type()
                );
                for record in answers::answer_question(&dataset, question, &zone) {
                    response.add_answer(record);
                }
            }
        }

        match response.to_vec() {
            Ok(buf) => Some(buf),
            Err(err) => {
                trace!("Unable to serialize DNS response: {}", err);
                None
            }
        }
    }
}

/// Plain UDP resolver on `dns.{bind,port}`.
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
}

impl DnsServer {
    pub async fn new(config: Arc<Config>, cache: Arc<Cache>) -> Result<Self, SubsystemError> {
        let addr = config.dns_addr()?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| SubsystemError::Bind {
                listener: "dns",
                addr,
                source,
            })?;
        info!("DNS server listening on udp {}", addr);

        Ok(Self {
            socket: Arc::new(socket),
            resolver: Arc::new(Resolver::new(config, cache)),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SubsystemError> {
        let mut buf = vec![0_u8; MAX_UDP_PACKET];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            debug!("DNS receive error: {}", err);
                            continue;
                        }
                    };

                    let packet = buf[..len].to_vec();
                    let socket = Arc::clone(&self.socket);
                    let resolver = Arc::clone(&self.resolver);
                    tokio::spawn(async move {
                        if let Some(reply) = resolver.handle(&packet).await {
                            if let Err(err) = socket.send_to(&reply, peer).await {
                                trace!("DNS reply to {} failed: {}", peer, err);
                            }
                        }
                    });
                }
            }
        }

        trace!("DNS server shutdown");
        Ok(())
    }
}

/// DNS-over-TLS resolver on `dns.tls.{bind,port}`. When no key material is
/// configured a temporary self-signed pair is generated and removed again on
/// shutdown.
pub struct DotServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    resolver: Arc<Resolver>,
    _material: Option<SelfSignedMaterial>,
}

impl DotServer {
    pub async fn new(config: Arc<Config>, cache: Arc<Cache>) -> Result<Self, SubsystemError> {
        let addr = config.dot_addr()?;

        let configured = match (&config.dns.tls.certificate, &config.dns.tls.key) {
            (Some(certificate), Some(key)) if !certificate.is_empty() && !key.is_empty() => {
                Some((PathBuf::from(certificate), PathBuf::from(key)))
            }
            _ => None,
        };
        let (certificate, key, material) = match configured {
            Some((certificate, key)) => (certificate, key, None),
            None => {
                warn!("Creating temporary self-signed DoT DNS certificate and key");
                let material = pem::generate_self_signed()?;
                (
                    material.certificate_path().to_path_buf(),
                    material.key_path().to_path_buf(),
                    Some(material),
                )
            }
        };

        let tls = pem::tls_server_config(&certificate, &key)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SubsystemError::Bind {
                listener: "dns.tls",
                addr,
                source,
            })?;
        info!("DNS server listening on tls {}", addr);

        Ok(Self {
            listener,
            acceptor,
            resolver: Arc::new(Resolver::new(config, cache)),
            _material: material,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SubsystemError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            debug!("DoT accept error: {}", err);
                            continue;
                        }
                    };

                    let acceptor = self.acceptor.clone();
                    let resolver = Arc::clone(&self.resolver);
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        let stream = match acceptor.accept(stream).await {
                            Ok(stream) => stream,
                            Err(err) => {
                                debug!("DoT handshake with {} failed: {}", peer, err);
                                return;
                            }
                        };
                        serve_stream(stream, resolver, shutdown).await;
                    });
                }
            }
        }

        trace!("DoT server shutdown");
        Ok(())
    }
}

/// One DoT connection: 2-octet length-framed messages until EOF or shutdown.
async fn serve_stream<S>(mut stream: S, resolver: Arc<Resolver>, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let len = tokio::select! {
            _ = shutdown.cancelled() => break,
            len = stream.read_u16() => match len {
                Ok(0) | Err(_) => break,
                Ok(len) => len as usize,
            },
        };

        let mut packet = vec![0_u8; len];
        if stream.read_exact(&mut packet).await.is_err() {
            break;
        }

        let Some(reply) = resolver.handle(&packet).await else {
            continue;
        };
        let framed = (reply.len() as u16).to_be_bytes();
        if stream.write_all(&framed).await.is_err() || stream.write_all(&reply).await.is_err() {
            break;
        }
        if stream.flush().await.is_err() {
            break;
        }
    }
}
