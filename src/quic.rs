//! Optional reliable-stream upgrade: wrap the punched socket as one end of
//! a QUIC connection. The certificate is self-signed and the client skips
//! verification; the punched path carries no trust beyond the session token,
//! and the upgrade keeps that model.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::UdpSocket;

use crate::error::Result;

/// Application protocol tag both ends must agree on.
pub const ALPN: &[u8] = b"punch-tunnel";

const KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Builds a QUIC endpoint over the punched socket. The socket must be
/// exclusively owned (see [`Tunnel::into_socket`](crate::tunnel::Tunnel::into_socket));
/// quinn drives it from here on. The endpoint can accept, dial, or both.
pub fn upgrade_endpoint(socket: UdpSocket) -> Result<Endpoint> {
    let std_socket = socket.into_std()?;
    let mut endpoint = Endpoint::new(
        quinn::EndpointConfig::default(),
        Some(server_config()?),
        std_socket,
        Arc::new(quinn::TokioRuntime),
    )?;
    endpoint.set_default_client_config(client_config()?);
    Ok(endpoint)
}

/// Dials the peer over the punched path.
pub async fn upgrade_client(socket: UdpSocket, remote_addr: SocketAddr) -> Result<Connection> {
    let endpoint = upgrade_endpoint(socket)?;
    let connection = endpoint
        .connect(remote_addr, "localhost")
        .map_err(io::Error::other)?
        .await
        .map_err(io::Error::other)?;
    Ok(connection)
}

/// Waits for the peer's dial on the punched path.
pub async fn upgrade_server(socket: UdpSocket) -> Result<Connection> {
    let endpoint = upgrade_endpoint(socket)?;
    let incoming = endpoint
        .accept()
        .await
        .ok_or_else(|| io::Error::other("endpoint closed"))?;
    let connection = incoming.await.map_err(io::Error::other)?;
    Ok(connection)
}

fn server_config() -> Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(io::Error::other)?;
    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.signing_key.serialize_der()));

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(io::Error::other)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = ServerConfig::with_crypto(Arc::new(
        QuicServerConfig::try_from(crypto).map_err(io::Error::other)?,
    ));
    if let Some(transport) = Arc::get_mut(&mut config.transport) {
        transport.keep_alive_interval(Some(KEEP_ALIVE));
    }
    Ok(config)
}

fn client_config() -> Result<ClientConfig> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(crypto).map_err(io::Error::other)?,
    ));
    config.transport_config(Arc::new({
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(KEEP_ALIVE));
        transport
    }));
    Ok(config)
}

/// The peer is pinned by the punched path and session token, not by a
/// certificate chain, so the self-signed server certificate is accepted
/// as-is.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::socket::bind_udp_port;

    #[tokio::test]
    async fn test_upgrade_round_trip() {
        let server_socket = bind_udp_port(0).unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let client_socket = bind_udp_port(0).unwrap();

        let server = tokio::spawn(async move {
            let connection = upgrade_server(server_socket).await.unwrap();
            let (mut tx, mut rx) = connection.accept_bi().await.unwrap();
            let request = rx.read_to_end(64).await.unwrap();
            tx.write_all(&request).await.unwrap();
            tx.finish().unwrap();
            // hold the connection until the client has read the echo
            connection.closed().await;
        });

        let remote = SocketAddr::from(([127, 0, 0, 1], server_addr.port()));
        let connection = upgrade_client(client_socket, remote).await.unwrap();
        let (mut tx, mut rx) = connection.open_bi().await.unwrap();
        tx.write_all(b"over quic").await.unwrap();
        tx.finish().unwrap();
        let echoed = rx.read_to_end(64).await.unwrap();
        assert_eq!(echoed, b"over quic");

        connection.close(0u32.into(), b"done");
        server.await.unwrap();
    }
}
