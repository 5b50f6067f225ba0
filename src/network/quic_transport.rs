use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use quinn::{Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{NetworkError, NetworkResult};
use super::service::PeerService;
use super::transport::Exchange;
use super::types::{ConnectionConfig, WireMessage, WireResponse};
use crate::peer::{PeerAddress, PeerNode};

#[derive(Debug, Clone, Default)]
pub struct QuicStats {
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub requests_sent: u64,
    pub requests_served: u64,
    pub active_connections: usize,
}

/// QUIC exchange: one bidirectional stream per request, frames are a
/// big-endian u32 length followed by a bincode payload.
pub struct QuicTransport {
    endpoint: Endpoint,
    connections: Arc<DashMap<SocketAddr, Connection>>,
    stats: Arc<parking_lot::RwLock<QuicStats>>,
    config: ConnectionConfig,
}

impl QuicTransport {
    /// Create a QUIC endpoint that both serves and dials, with a self-signed certificate
    pub fn new(config: ConnectionConfig) -> NetworkResult<Self> {
        if config.insecure_skip_verify {
            warn!(
                "TLS certificate verification is disabled; peers are authenticated by content hashes only"
            );
        }

        let mut endpoint = Self::make_server_endpoint(&config)?;
        endpoint.set_default_client_config(Self::make_client_config(&config)?);

        Ok(Self {
            endpoint,
            connections: Arc::new(DashMap::new()),
            stats: Arc::new(parking_lot::RwLock::new(QuicStats::default())),
            config,
        })
    }

    fn transport_config(config: &ConnectionConfig) -> NetworkResult<quinn::TransportConfig> {
        let idle = config
            .max_idle_timeout
            .try_into()
            .map_err(|e| NetworkError::QuicError(format!("idle timeout: {e}")))?;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config
            .max_concurrent_bidi_streams(config.max_concurrent_streams.into())
            .max_idle_timeout(Some(idle))
            .keep_alive_interval(Some(config.keep_alive_interval));
        Ok(transport_config)
    }

    fn make_server_endpoint(config: &ConnectionConfig) -> NetworkResult<Endpoint> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| NetworkError::CertificateError(e.to_string()))?;
        let cert_der = cert.cert.der().to_vec();
        let priv_key = rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|e| NetworkError::CertificateError(e.to_string()))?;

        let mut server_config = ServerConfig::with_single_cert(
            vec![rustls::pki_types::CertificateDer::from(cert_der)],
            priv_key,
        )
        .map_err(|e| NetworkError::CertificateError(e.to_string()))?;
        server_config.transport_config(Arc::new(Self::transport_config(config)?));

        let endpoint = Endpoint::server(server_config, config.bind_addr)?;
        Ok(endpoint)
    }

    /// Client side TLS. With `insecure_skip_verify` any certificate is accepted,
    /// otherwise system roots (falling back to webpki roots) are used.
    fn make_client_config(config: &ConnectionConfig) -> NetworkResult<quinn::ClientConfig> {
        let crypto = if config.insecure_skip_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut root_store = rustls::RootCertStore::empty();

            match rustls_native_certs::load_native_certs() {
                Ok(certs) => {
                    for cert in certs {
                        if let Err(e) = root_store.add(cert) {
                            warn!("Failed to add certificate to root store: {}", e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to load native certificates: {}. Using webpki roots.", e);
                }
            }

            if root_store.is_empty() {
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }

            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| NetworkError::CertificateError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(Self::transport_config(config)?));
        Ok(client_config)
    }

    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        self.endpoint.local_addr().map_err(NetworkError::IoError)
    }

    pub fn stats(&self) -> QuicStats {
        self.stats.read().clone()
    }

    /// Cached connection to `addr`, dialing if there is none or it has closed.
    async fn connection(&self, addr: SocketAddr) -> NetworkResult<Connection> {
        if let Some(conn) = self.connections.get(&addr) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }

        let unreachable = |reason: String| NetworkError::Unreachable {
            peer: addr.to_string(),
            reason,
        };
        let conn = self
            .endpoint
            .connect(addr, "localhost")
            .map_err(|e| unreachable(e.to_string()))?
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        self.connections.insert(addr, conn.clone());
        self.stats.write().active_connections = self.connections.len();
        debug!(%addr, "QUIC connection established");
        Ok(conn)
    }

    async fn write_frame<T: Serialize>(stream: &mut SendStream, value: &T, max: usize) -> NetworkResult<u64> {
        let payload = bincode::serialize(value)?;
        let header = frame_header(payload.len(), max)?;
        stream.write_all(&header).await?;
        stream.write_all(&payload).await?;
        stream.finish()?;
        Ok(payload.len() as u64 + 4)
    }

    async fn read_frame<T: DeserializeOwned>(stream: &mut RecvStream, max: usize) -> NetworkResult<(T, u64)> {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len) as usize;
        if len > max {
            return Err(NetworkError::SerializationError(format!(
                "frame of {len} bytes exceeds limit of {max}"
            )));
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok((bincode::deserialize(&payload)?, len as u64 + 4))
    }

    /// Accept connections and answer every request with `service`.
    pub fn serve(self: &Arc<Self>, service: Arc<PeerService>) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            info!(addr = ?transport.local_addr().ok(), "QUIC peer service listening");
            while let Some(incoming) = transport.endpoint.accept().await {
                let transport = transport.clone();
                let service = service.clone();
                tokio::spawn(async move {
                    let conn = match incoming.await {
                        Ok(conn) => conn,
                        Err(e) => {
                            debug!(error = %e, "Incoming connection failed");
                            return;
                        }
                    };
                    transport.serve_connection(conn, service).await;
                });
            }
        })
    }

    async fn serve_connection(self: Arc<Self>, conn: Connection, service: Arc<PeerService>) {
        let remote = conn.remote_address();
        loop {
            let (mut send, mut recv) = match conn.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(%remote, error = %e, "Connection closed");
                    return;
                }
            };
            let transport = self.clone();
            let service = service.clone();
            tokio::spawn(async move {
                let max = transport.config.max_message_size;
                let result: NetworkResult<()> = async {
                    let (message, read): (WireMessage, u64) = Self::read_frame(&mut recv, max).await?;
                    let response = service.handle(with_observed_address(message, remote)).await;
                    let written = Self::write_frame(&mut send, &response, max).await?;
                    let mut stats = transport.stats.write();
                    stats.total_bytes_received += read;
                    stats.total_bytes_sent += written;
                    stats.requests_served += 1;
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    debug!(%remote, error = %e, "Request failed");
                }
            });
        }
    }

    pub fn close(&self) {
        for entry in self.connections.iter() {
            entry.value().close(0u32.into(), b"closing");
        }
        self.connections.clear();
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

#[async_trait]
impl Exchange for QuicTransport {
    async fn exchange(&self, target: &PeerNode, message: WireMessage) -> NetworkResult<WireResponse> {
        let addr = match &target.address {
            PeerAddress::Quic(addr) => *addr,
            other => return Err(NetworkError::UnsupportedAddress(other.to_string())),
        };

        let conn = self.connection(addr).await?;
        let (mut send, mut recv) = match conn.open_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                self.connections.remove(&addr);
                return Err(NetworkError::Unreachable {
                    peer: addr.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let written = Self::write_frame(&mut send, &message, self.config.max_message_size).await?;
        let (response, read): (WireResponse, u64) =
            Self::read_frame(&mut recv, self.config.max_message_size).await?;

        let mut stats = self.stats.write();
        stats.total_bytes_sent += written;
        stats.total_bytes_received += read;
        stats.requests_sent += 1;
        Ok(response)
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// Certificate verifier that accepts any certificate. Chunk payloads are
// verified by content hash regardless of the channel.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// A heartbeat from a peer bound to an unspecified address is answered at
/// the IP it connected from.
fn with_observed_address(message: WireMessage, remote: SocketAddr) -> WireMessage {
    match message {
        WireMessage::Heartbeat(mut heartbeat) => {
            if let PeerAddress::Quic(addr) = heartbeat.address {
                if addr.ip().is_unspecified() {
                    heartbeat.address = PeerAddress::Quic(SocketAddr::new(remote.ip(), addr.port()));
                }
            }
            WireMessage::Heartbeat(heartbeat)
        }
        other => other,
    }
}

/// Big-endian length prefix for a frame of `len` bytes. Oversized frames
/// fail here rather than at the receiver, where they would look transient.
fn frame_header(len: usize, max: usize) -> NetworkResult<[u8; 4]> {
    if len > max {
        return Err(NetworkError::SerializationError(format!(
            "frame of {len} bytes exceeds limit of {max}"
        )));
    }
    let len = u32::try_from(len).map_err(|_| {
        NetworkError::SerializationError(format!("frame of {len} bytes does not fit a u32 length prefix"))
    })?;
    Ok(len.to_be_bytes())
}
