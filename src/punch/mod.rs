//! The hole-punching handshake. The NAT-type pair picks one of three
//! strategies; each produces a socket bound to the local port the remote's
//! NAT now permits, plus the address a correctly-tokened reply came from.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::protocol::token::Token;
use crate::protocol::Message;
use crate::resolver::NatDescriptor;
use crate::socket::{bind_udp, bind_udp_port};

// With one side spraying k random ports out of 65535 and the other exposing
// n fresh mappings, a miss needs every choice to avoid every mapping:
// p = 1 - ((65535-n)/65535) * ((65535-n-1)/(65535-1)) * ...
// At n = 1, k = 800 a fixed mapping is hit with only ~1.2%, but the paired
// search against a symmetric peer (n ≈ k ≈ 800) succeeds with ~98%.
pub const DEFAULT_PUNCH_TRIES: usize = 800;

/// Runs the strategy selected by the NAT-type pair under the global
/// deadline. Cancelling `cancel` aborts promptly with [`Error::Cancelled`];
/// every task spawned below is tied to a child token and exits with it.
pub(crate) async fn handshake(
    local: &NatDescriptor,
    remote: &NatDescriptor,
    local_port: u16,
    config: &TunnelConfig,
    cancel: &CancellationToken,
) -> Result<(UdpSocket, SocketAddr)> {
    let stop = cancel.child_token();
    let _guard = stop.clone().drop_guard();

    let strategy = async {
        match (local.nat_type.is_symmetric(), remote.nat_type.is_symmetric()) {
            (false, false) => handshake_non_symmetric(local, remote, local_port, config).await,
            (true, false) => handshake_local_symmetric(local, remote, config, &stop).await,
            (false, true) => {
                handshake_remote_symmetric(local, remote, local_port, config, &stop).await
            }
            (true, true) => Err(Error::Unsupported),
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(config.handshake_timeout, strategy) => {
            result.map_err(|_| Error::HandshakeTimeout)?
        }
    }
}

/// Both ends keep their classification port: each side pings the other's
/// advertised endpoint until a reply crosses its own NAT's fresh mapping.
async fn handshake_non_symmetric(
    local: &NatDescriptor,
    remote: &NatDescriptor,
    local_port: u16,
    config: &TunnelConfig,
) -> Result<(UdpSocket, SocketAddr)> {
    log::debug!("handshake non symmetric");
    let remote_addr = SocketAddr::V4(parse_peer_addr(&remote.addr)?);
    let socket = bind_udp_port(local_port)?;
    let request = Message::handshake(local.token).encode();
    let mut tick = tokio::time::interval(config.send_interval);
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = tick.tick() => {
                socket.send_to(&request, remote_addr).await?;
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = received?;
                let msg = match Message::decode(&buf[..n]) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::debug!("dropping datagram from {from}: {e}");
                        continue;
                    }
                };
                if msg.token() != remote.token {
                    return Err(Error::TokenMismatch(msg.token()));
                }
                return Ok((socket, from));
            }
        }
    }
}

/// The remote maps to a fresh public port per destination, so its advertised
/// port is stale; walk a random permutation of the port space until one send
/// lands in whatever mapping its own handshake traffic opened.
async fn handshake_remote_symmetric(
    local: &NatDescriptor,
    remote: &NatDescriptor,
    local_port: u16,
    config: &TunnelConfig,
    stop: &CancellationToken,
) -> Result<(UdpSocket, SocketAddr)> {
    log::debug!("handshake remote symmetric");
    let remote_addr = parse_peer_addr(&remote.addr)?;
    let socket = Arc::new(bind_udp_port(local_port)?);

    let mut ports: Vec<u16> = (1..=65535).collect();
    ports.shuffle(&mut rand::rng());
    ports.truncate(config.punch_tries);

    let spray_stop = stop.child_token();
    let sender = tokio::spawn(spray(
        socket.clone(),
        *remote_addr.ip(),
        ports,
        Message::handshake(local.token).encode(),
        config.spawn_interval,
        config.send_interval,
        spray_stop.clone(),
    ));

    let mut buf = [0u8; 2048];
    let accepted = loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let msg = match Message::decode(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("dropping datagram from {from}: {e}");
                continue;
            }
        };
        if msg.token() != remote.token {
            log::debug!("dropping datagram from {from} with token {}", msg.token());
            continue;
        }
        break from;
    };

    // wind the sender down so the socket reference count drops to one
    spray_stop.cancel();
    let _ = sender.await;
    let socket = Arc::try_unwrap(socket)
        .map_err(|_| io::Error::other("punch socket still shared after shutdown"))?;
    Ok((socket, accepted))
}

async fn spray(
    socket: Arc<UdpSocket>,
    ip: Ipv4Addr,
    ports: Vec<u16>,
    request: Vec<u8>,
    spawn_interval: Duration,
    send_interval: Duration,
    stop: CancellationToken,
) {
    loop {
        for &port in &ports {
            if stop.is_cancelled() {
                return;
            }
            let dst = SocketAddrV4::new(ip, port);
            if let Err(e) = socket.send_to(&request, dst).await {
                log::debug!("spray {dst}: {e}");
            }
            tokio::time::sleep(spawn_interval).await;
        }
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(send_interval) => {}
        }
    }
}

/// Our own NAT maps per destination, so no single local port works: raise a
/// swarm of short-lived sockets, each pinging the remote's fixed endpoint,
/// and keep the first one a correctly-tokened reply comes back to.
async fn handshake_local_symmetric(
    local: &NatDescriptor,
    remote: &NatDescriptor,
    config: &TunnelConfig,
    stop: &CancellationToken,
) -> Result<(UdpSocket, SocketAddr)> {
    log::debug!("handshake local symmetric");
    let remote_addr = SocketAddr::V4(parse_peer_addr(&remote.addr)?);
    let request = Arc::new(Message::handshake(local.token).encode());
    let selected = Arc::new(AtomicBool::new(false));
    let (winner_tx, mut winner_rx) = mpsc::channel::<SocketAddr>(1);
    let worker_stop = stop.child_token();

    let spawner = {
        let worker_stop = worker_stop.clone();
        let tries = config.punch_tries;
        let spawn_interval = config.spawn_interval;
        let send_interval = config.send_interval;
        let remote_token = remote.token;
        tokio::spawn(async move {
            for _ in 0..tries {
                if worker_stop.is_cancelled() {
                    return;
                }
                tokio::spawn(candidate_worker(
                    remote_addr,
                    request.clone(),
                    remote_token,
                    send_interval,
                    selected.clone(),
                    winner_tx.clone(),
                    worker_stop.clone(),
                ));
                tokio::time::sleep(spawn_interval).await;
            }
        })
    };

    let winning_addr = match winner_rx.recv().await {
        Some(addr) => addr,
        // every worker (and the spawner) is gone without a winner
        None => return Err(Error::HandshakeTimeout),
    };
    worker_stop.cancel();
    spawner.abort();

    // The winner closed its socket before publishing; take the port back
    // with a fresh bind so the caller gets sole ownership.
    let SocketAddr::V4(winning_addr) = winning_addr else {
        return Err(io::Error::other("worker bound a non-ipv4 socket").into());
    };
    let socket = bind_udp(winning_addr)?;
    Ok((socket, remote_addr))
}

/// One candidate: fresh ephemeral socket, 1 Hz handshake toward the remote,
/// read until a correctly-tokened reply or the stop signal. Exactly one
/// worker wins the `selected` flag; everyone else folds.
async fn candidate_worker(
    remote_addr: SocketAddr,
    request: Arc<Vec<u8>>,
    remote_token: Token,
    send_interval: Duration,
    selected: Arc<AtomicBool>,
    winner_tx: mpsc::Sender<SocketAddr>,
    stop: CancellationToken,
) {
    let socket = match bind_udp_port(0) {
        Ok(socket) => socket,
        Err(e) => {
            // one lost try out of the budget
            log::debug!("candidate bind failed: {e}");
            return;
        }
    };
    let mut tick = tokio::time::interval(send_interval);
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tick.tick() => {
                if socket.send_to(&request, remote_addr).await.is_err() {
                    return;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let Ok((n, from)) = received else { return };
                let Ok(msg) = Message::decode(&buf[..n]) else { continue };
                if msg.token() != remote_token {
                    log::debug!("candidate dropping datagram from {from} with token {}", msg.token());
                    continue;
                }
                if selected
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
                let Ok(local_addr) = socket.local_addr() else { return };
                // free the port before the rebind, then stop the swarm
                drop(socket);
                stop.cancel();
                let _ = winner_tx.send(local_addr).await;
                return;
            }
        }
    }
}

fn parse_peer_addr(addr: &str) -> Result<SocketAddrV4> {
    addr.parse().map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bad peer addr {addr}"),
        ))
    })
}
