//! Session orchestration: classify the local NAT, trade descriptors over
//! the signaling channel, punch, then own the punched socket for the rest
//! of the session.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::protocol::{Message, MessageKind};
use crate::punch;
use crate::resolver::{NatDescriptor, Resolver};
use crate::signal::Signal;
use crate::socket::bind_udp_port;

/// A punched session. Produced by [`Tunnel::connect`]; the socket it owns is
/// bound to the punched local port and the remote address has answered with
/// the session token.
pub struct Tunnel {
    socket: Arc<UdpSocket>,
    signal: Arc<dyn Signal>,
    config: TunnelConfig,
    local_nat: NatDescriptor,
    remote_nat: NatDescriptor,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    cancel: CancellationToken,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Runs a whole session setup: bootstrap bind, classification,
    /// descriptor exchange, handshake.
    pub async fn connect(signal: Arc<dyn Signal>, config: TunnelConfig) -> Result<Tunnel> {
        Self::connect_with(signal, config, CancellationToken::new()).await
    }

    /// Like [`connect`](Self::connect), but tied to a caller-held token so
    /// another task can abort the session mid-setup.
    pub async fn connect_with(
        signal: Arc<dyn Signal>,
        config: TunnelConfig,
        cancel: CancellationToken,
    ) -> Result<Tunnel> {
        let (local_nat, remote_nat, local_port) =
            exchange_descriptors(&*signal, &config, &cancel).await?;

        if local_nat.nat_type.is_symmetric() && remote_nat.nat_type.is_symmetric() {
            return Err(Error::Unsupported);
        }

        let (socket, remote_addr) =
            punch::handshake(&local_nat, &remote_nat, local_port, &config, &cancel).await?;
        let local_addr = socket.local_addr()?;
        log::debug!("hole punch success, local {local_addr}, remote {remote_addr}");

        Ok(Tunnel {
            socket: Arc::new(socket),
            signal,
            config,
            local_nat,
            remote_nat,
            local_addr,
            remote_addr,
            cancel,
            keepalive: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
    pub fn local_descriptor(&self) -> &NatDescriptor {
        &self.local_nat
    }
    pub fn remote_descriptor(&self) -> &NatDescriptor {
        &self.remote_nat
    }
    pub fn signal(&self) -> &Arc<dyn Signal> {
        &self.signal
    }
    /// Token governing every background task of this session.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pings the peer once per keepalive interval so both NATs keep their
    /// mappings. Runs until [`close`](Self::close).
    pub fn spawn_keepalive(&self) {
        let socket = self.socket.clone();
        let ping = Message::ping(self.local_nat.token).encode();
        let remote_addr = self.remote_addr;
        let interval = self.config.keepalive_interval;
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        if let Err(e) = socket.send_to(&ping, remote_addr).await {
                            log::warn!("keepalive send {e:?}");
                        }
                    }
                }
            }
        });
        if let Some(old) = self.keepalive.lock().replace(handle) {
            old.abort();
        }
    }

    /// Sends one Data frame. The payload must fit a single frame; callers
    /// stream larger data through the upgrade instead.
    pub async fn send_data(&self, payload: &[u8]) -> Result<()> {
        let msg = Message::data(self.local_nat.token, payload.to_vec());
        self.socket.send_to(&msg.encode(), self.remote_addr).await?;
        Ok(())
    }

    /// Inbound dispatch: frames from the punched peer, carrying its token,
    /// are decoded and Data payloads handed to `on_data`. Anything else is
    /// dropped. Pings reset the idle clock; a quiet peer ends the loop after
    /// the idle timeout. Cancellation ends it with [`Error::Cancelled`].
    pub async fn serve(&self, mut on_data: impl FnMut(&[u8])) -> Result<()> {
        let mut buf = [0u8; 2048];
        let mut idle = Box::pin(tokio::time::sleep(self.config.idle_timeout));
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = idle.as_mut() => return Ok(()),
                received = tokio::time::timeout(
                    self.config.read_timeout,
                    self.socket.recv_from(&mut buf),
                ) => received,
            };
            let (n, from) = match received {
                Ok(result) => result?,
                Err(_) => continue,
            };
            if from != self.remote_addr {
                log::debug!("dropping datagram from unexpected addr {from}");
                continue;
            }
            let msg = match Message::decode(&buf[..n]) {
                Ok(msg) => msg,
                Err(e) => {
                    log::debug!("dropping datagram from {from}: {e}");
                    continue;
                }
            };
            if msg.token() != self.remote_nat.token {
                log::debug!("dropping datagram with token {}", msg.token());
                continue;
            }
            match msg.kind() {
                MessageKind::Handshake => {
                    log::debug!("late handshake from {from}");
                }
                MessageKind::Ping => {
                    idle
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.config.idle_timeout);
                }
                MessageKind::Data => on_data(msg.payload()),
                MessageKind::Unknown(kind) => {
                    log::debug!("unknown message kind {kind} from {from}");
                }
            }
        }
    }

    /// Cancels background activity. The socket is released once the last
    /// task observes the token, at the latest when the tunnel drops.
    /// Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }

    /// Tears the session down and hands the punched socket to a transport
    /// that wants sole ownership, e.g. the stream upgrade.
    pub async fn into_socket(self) -> Result<(UdpSocket, SocketAddr)> {
        self.cancel.cancel();
        let handle = self.keepalive.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let remote_addr = self.remote_addr;
        let socket = self.socket.clone();
        drop(self);
        let socket = Arc::try_unwrap(socket)
            .map_err(|_| std::io::Error::other("punched socket still shared"))?;
        Ok((socket, remote_addr))
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bootstrap socket → classification → signal exchange. The bootstrap
/// socket is fully released before this returns so the handshake can take
/// its port back.
async fn exchange_descriptors(
    signal: &dyn Signal,
    config: &TunnelConfig,
    cancel: &CancellationToken,
) -> Result<(NatDescriptor, NatDescriptor, u16)> {
    let socket = Arc::new(bind_udp_port(0)?);
    let local_port = socket.local_addr()?.port();

    let resolver = Resolver::new(socket.clone(), config);
    let resolved = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        resolved = resolver.resolve(&config.probes) => resolved,
    };
    resolver.close().await;
    drop(socket);
    let local_nat = resolved?;
    log::debug!(
        "local nat type {:?}, addr {}, token {}",
        local_nat.nat_type,
        local_nat.addr,
        local_nat.token
    );

    signal.send_signal(&local_nat).await?;
    let remote_nat = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        remote = signal.read_signal() => remote?,
    };
    log::debug!(
        "remote nat type {:?}, addr {}, token {}",
        remote_nat.nat_type,
        remote_nat.addr,
        remote_nat.token
    );
    Ok((local_nat, remote_nat, local_port))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::test_util::{probes_for, signal_pair, spawn_responder};

    fn fast_config(probes: Vec<crate::config::Probe>) -> TunnelConfig {
        TunnelConfig::empty()
            .set_probes(probes)
            .set_stun_rto(Duration::from_millis(50))
            .set_stun_max_sends(2)
            .set_send_interval(Duration::from_millis(50))
            .set_keepalive_interval(Duration::from_millis(50))
            .set_handshake_timeout(Duration::from_secs(5))
    }

    fn cone_probes() -> Vec<crate::config::Probe> {
        let primary = spawn_responder(|_| true, 0);
        let secondary = spawn_responder(|_| true, 0);
        probes_for(primary, secondary)
    }

    fn symmetric_probes() -> Vec<crate::config::Probe> {
        let primary = spawn_responder(|_| true, 0);
        let secondary = spawn_responder(|_| true, 9);
        probes_for(primary, secondary)
    }

    #[tokio::test]
    async fn test_connect_pair() {
        let (signal_a, signal_b) = signal_pair();
        let (a, b) = tokio::join!(
            Tunnel::connect(signal_a, fast_config(cone_probes())),
            Tunnel::connect(signal_b, fast_config(cone_probes())),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.remote_addr().to_string(), b.local_descriptor().addr);
        assert_eq!(b.remote_addr().to_string(), a.local_descriptor().addr);
        assert_eq!(a.remote_descriptor().token, b.local_descriptor().token);
    }

    #[tokio::test]
    async fn test_connect_rejects_two_symmetric_peers() {
        let (signal_a, signal_b) = signal_pair();
        let (a, b) = tokio::join!(
            Tunnel::connect(signal_a, fast_config(symmetric_probes())),
            Tunnel::connect(signal_b, fast_config(symmetric_probes())),
        );
        assert!(matches!(a.unwrap_err(), Error::Unsupported));
        assert!(matches!(b.unwrap_err(), Error::Unsupported));
    }

    #[tokio::test]
    async fn test_data_and_keepalive() {
        let (signal_a, signal_b) = signal_pair();
        let (a, b) = tokio::join!(
            Tunnel::connect(signal_a, fast_config(cone_probes())),
            Tunnel::connect(signal_b, fast_config(cone_probes())),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        a.spawn_keepalive();
        a.send_data(b"across the nat").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut tx = Some(tx);
        let serve = b.serve(move |payload| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(payload.to_vec());
            }
        });
        let payload = tokio::select! {
            payload = rx => payload.unwrap(),
            result = serve => panic!("serve ended early: {result:?}"),
        };
        assert_eq!(payload, b"across the nat");
    }

    #[tokio::test]
    async fn test_serve_source_and_token_filter() {
        let (signal_a, signal_b) = signal_pair();
        let (a, b) = tokio::join!(
            Tunnel::connect(signal_a, fast_config(cone_probes())),
            Tunnel::connect(signal_b, fast_config(cone_probes())),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        // same source, foreign token: must not reach the callback
        let foreign = Message::data(crate::protocol::token::Token::generate(), b"evil".to_vec());
        a.socket
            .send_to(&foreign.encode(), b.local_addr())
            .await
            .unwrap();
        // interloper socket, correct token: dropped by the source filter
        let interloper = bind_udp_port(0).unwrap();
        let spoofed = Message::data(a.local_descriptor().token, b"spoof".to_vec());
        interloper
            .send_to(&spoofed.encode(), b.local_addr())
            .await
            .unwrap();
        a.send_data(b"legit").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut tx = Some(tx);
        let serve = b.serve(move |payload| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(payload.to_vec());
            }
        });
        let payload = tokio::select! {
            payload = rx => payload.unwrap(),
            result = serve => panic!("serve ended early: {result:?}"),
        };
        assert_eq!(payload, b"legit");
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (signal_a, signal_b) = signal_pair();
        let (a, b) = tokio::join!(
            Tunnel::connect(signal_a, fast_config(cone_probes())),
            Tunnel::connect(signal_b, fast_config(cone_probes())),
        );
        let a = a.unwrap();
        drop(b);
        a.spawn_keepalive();
        a.close();
        a.close();
        assert!(a.cancellation().is_cancelled());
        // a cancelled tunnel serves nothing
        assert!(matches!(a.serve(|_| {}).await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_mid_connect() {
        let (signal_a, _keep_peer_silent) = signal_pair();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        // peer never sends its descriptor; cancellation unblocks the read
        let err = Tunnel::connect_with(signal_a, fast_config(cone_probes()), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_into_socket() {
        let (signal_a, signal_b) = signal_pair();
        let (a, b) = tokio::join!(
            Tunnel::connect(signal_a, fast_config(cone_probes())),
            Tunnel::connect(signal_b, fast_config(cone_probes())),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        let b_addr = a.remote_addr();
        let (socket, remote_addr) = a.into_socket().await.unwrap();
        assert_eq!(remote_addr, b_addr);
        assert_eq!(socket.local_addr().unwrap().port(), b.remote_addr().port());
    }
}
