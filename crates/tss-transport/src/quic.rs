//! QUIC/TLS 1.3 endpoint shared by the dialer and the acceptor.
//!
//! Every party runs a single [`QuicNode`] that both listens for peers and
//! dials them. Both directions use mutual TLS with pinned keys (see
//! [`crate::tls`]); the server resolves the dialer's identity from the
//! certificate it presented.
//!
//! ## Framing
//!
//! Each stream carries length-prefixed frames: `[length:4 LE][data:length]`.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::CertificateDer;

use crate::tls::{self, PinnedClientVerifier, PinnedServerVerifier, TlsIdentity};
use crate::wire::MAX_FRAME_SIZE;
use crate::TransportError;

/// ALPN protocol identifier.
pub const ALPN_TSS_V1: &[u8] = b"tss-p2p/1";

/// SNI sent when dialing. Identity comes from the pinned key, not the name.
pub const SERVER_NAME: &str = "tss-node";

/// Default QUIC idle timeout in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 30_000;

/// Default maximum number of concurrent bidirectional streams.
pub const DEFAULT_MAX_BI_STREAMS: u32 = 16;

/// Configuration for a QUIC node.
#[derive(Clone, Debug)]
pub struct QuicConfig {
    /// Local address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum idle timeout in milliseconds.
    pub idle_timeout_ms: u32,
    /// Maximum concurrent bidirectional streams per connection.
    pub max_bi_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_bi_streams: DEFAULT_MAX_BI_STREAMS,
        }
    }
}

/// A QUIC node that can both listen for and initiate connections.
pub struct QuicNode {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    identity: TlsIdentity,
    idle_timeout_ms: u32,
}

impl QuicNode {
    /// Bind a node that accepts only clients presenting one of `pinned_keys`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if TLS configuration fails and
    /// [`TransportError::Io`] if the socket cannot be bound.
    pub fn new(
        config: QuicConfig,
        identity: TlsIdentity,
        pinned_keys: Vec<Vec<u8>>,
    ) -> Result<Self, TransportError> {
        let server_config = build_server_config(
            &identity,
            pinned_keys,
            config.idle_timeout_ms,
            config.max_bi_streams,
        )?;
        let endpoint = Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        tracing::info!(%local_addr, "QUIC node started");

        Ok(Self {
            endpoint,
            local_addr,
            identity,
            idle_timeout_ms: config.idle_timeout_ms,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next incoming QUIC connection.
    ///
    /// Returns `None` if the endpoint has been closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Dial a peer whose certificate must carry `expected_key`.
    ///
    /// `mismatch` is set if the peer presented a different key.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the connection cannot be established.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        expected_key: &[u8],
        mismatch: Arc<AtomicBool>,
    ) -> Result<Connection, TransportError> {
        let client_config = build_client_config(
            &self.identity,
            PinnedServerVerifier::new(expected_key.to_vec(), mismatch),
            self.idle_timeout_ms,
        )?;
        let connecting = self
            .endpoint
            .connect_with(client_config, addr, SERVER_NAME)
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let connection = connecting
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::debug!(remote = %connection.remote_address(), "QUIC connection established");

        Ok(connection)
    }

    /// The pinned key the remote side authenticated with.
    pub fn peer_public_key(connection: &Connection) -> Result<Vec<u8>, TransportError> {
        let identity = connection
            .peer_identity()
            .ok_or_else(|| TransportError::Tls("peer presented no certificate".to_string()))?;
        let chain = identity
            .downcast::<Vec<CertificateDer<'static>>>()
            .map_err(|_| TransportError::Tls("unexpected peer identity type".to_string()))?;
        let leaf = chain
            .first()
            .ok_or_else(|| TransportError::Tls("empty certificate chain".to_string()))?;
        tls::spki_of(leaf.as_ref())
    }

    /// Write one length-prefixed frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the write fails.
    pub async fn send_frame(stream: &mut SendStream, data: &[u8]) -> Result<(), TransportError> {
        let len = u32::try_from(data.len()).map_err(|_| {
            TransportError::InvalidFrame("frame too large for 4-byte length prefix".to_string())
        })?;
        stream
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    /// Read one length-prefixed frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the read fails and
    /// [`TransportError::InvalidFrame`] if the length exceeds [`MAX_FRAME_SIZE`].
    pub async fn recv_frame(stream: &mut RecvStream) -> Result<Vec<u8>, TransportError> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::InvalidFrame(format!(
                "frame length {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }

        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(buf)
    }

    /// Close the endpoint and every connection on it.
    pub fn close(&self, error_code: u32, reason: &[u8]) {
        self.endpoint
            .close(quinn::VarInt::from_u32(error_code), reason);
    }
}

// ---------------------------------------------------------------------------
// TLS / QUIC config helpers
// ---------------------------------------------------------------------------

fn transport_config(idle_timeout_ms: u32) -> Result<quinn::TransportConfig, TransportError> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(Duration::from_millis(u64::from(idle_timeout_ms)))
            .map_err(|e| TransportError::Tls(format!("idle timeout config failed: {e}")))?,
    ));
    Ok(transport)
}

fn build_server_config(
    identity: &TlsIdentity,
    pinned_keys: Vec<Vec<u8>>,
    idle_timeout_ms: u32,
    max_bi_streams: u32,
) -> Result<ServerConfig, TransportError> {
    let mut tls_config = rustls::ServerConfig::builder_with_provider(tls::provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("server TLS version config failed: {e}")))?
        .with_client_cert_verifier(Arc::new(PinnedClientVerifier::new(pinned_keys)))
        .with_single_cert(identity.cert_chain(), identity.private_key())
        .map_err(|e| TransportError::Tls(format!("server TLS config failed: {e}")))?;
    tls_config.alpn_protocols = vec![ALPN_TSS_V1.to_vec()];

    let mut transport = transport_config(idle_timeout_ms)?;
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(max_bi_streams));

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC server crypto config failed: {e}")))?,
    ));
    server_config.transport_config(Arc::new(transport));
    Ok(server_config)
}

fn build_client_config(
    identity: &TlsIdentity,
    verifier: PinnedServerVerifier,
    idle_timeout_ms: u32,
) -> Result<ClientConfig, TransportError> {
    let mut tls_config = rustls::ClientConfig::builder_with_provider(tls::provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("client TLS version config failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(identity.cert_chain(), identity.private_key())
        .map_err(|e| TransportError::Tls(format!("client TLS config failed: {e}")))?;
    tls_config.alpn_protocols = vec![ALPN_TSS_V1.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC client crypto config failed: {e}")))?,
    ));
    client_config.transport_config(Arc::new(transport_config(idle_timeout_ms)?));
    Ok(client_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn loopback() -> QuicConfig {
        QuicConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..QuicConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = QuicConfig::default();
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(config.max_bi_streams, DEFAULT_MAX_BI_STREAMS);
    }

    #[tokio::test]
    async fn test_pinned_handshake_and_frame() {
        let a = TlsIdentity::generate("a").expect("identity");
        let b = TlsIdentity::generate("b").expect("identity");
        let a_key = a.public_key().expect("spki");
        let b_key = b.public_key().expect("spki");

        let server = QuicNode::new(loopback(), b, vec![a_key.clone()]).expect("server");
        let client = QuicNode::new(loopback(), a, vec![b_key.clone()]).expect("client");
        let server_addr = server.local_addr();

        let accept = tokio::spawn(async move {
            let incoming = server.accept().await.expect("incoming");
            let conn = incoming.await.expect("handshake");
            let peer_key = QuicNode::peer_public_key(&conn).expect("peer key");
            let (_send, mut recv) = conn.accept_bi().await.expect("accept bi");
            let frame = QuicNode::recv_frame(&mut recv).await.expect("frame");
            (peer_key, frame)
        });

        let mismatch = Arc::new(AtomicBool::new(false));
        let conn = client
            .connect(server_addr, &b_key, mismatch.clone())
            .await
            .expect("connect");
        let (mut send, _recv) = conn.open_bi().await.expect("open bi");
        QuicNode::send_frame(&mut send, b"hello").await.expect("send");

        let (peer_key, frame) = accept.await.expect("join");
        assert_eq!(peer_key, a_key);
        assert_eq!(frame, b"hello");
        assert!(!mismatch.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_wrong_pin_fails_handshake() {
        let a = TlsIdentity::generate("a").expect("identity");
        let b = TlsIdentity::generate("b").expect("identity");
        let impostor_key = TlsIdentity::generate("c")
            .expect("identity")
            .public_key()
            .expect("spki");
        let a_key = a.public_key().expect("spki");

        let server = QuicNode::new(loopback(), b, vec![a_key]).expect("server");
        let client = QuicNode::new(loopback(), a, vec![]).expect("client");
        let server_addr = server.local_addr();
        tokio::spawn(async move {
            if let Some(incoming) = server.accept().await {
                let _ = incoming.await;
            }
        });

        let mismatch = Arc::new(AtomicBool::new(false));
        let result = client
            .connect(server_addr, &impostor_key, mismatch.clone())
            .await;
        assert!(result.is_err());
        assert!(mismatch.load(Ordering::Relaxed));
    }
}
