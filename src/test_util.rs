//! Loopback doubles shared by the async tests.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::config::Probe;
use crate::error::{Error, Result};
use crate::resolver::NatDescriptor;
use crate::signal::Signal;
use crate::socket::bind_udp_port;
use crate::stun::{decode, encode_binding_success, ChangeRequest, BINDING_REQUEST};

/// Loopback stand-in for a STUN server. `answer` decides, per request,
/// whether to reply; `skew` shifts the reported port to fake a
/// destination-dependent mapping.
pub(crate) fn spawn_responder(answer: fn(ChangeRequest) -> bool, skew: u16) -> SocketAddr {
    let server = bind_udp_port(0).unwrap();
    let server_addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().unwrap().port()));
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, from)) = server.recv_from(&mut buf).await {
            let Ok(request) = decode(&buf[..n]) else {
                continue;
            };
            if request.msg_type != BINDING_REQUEST || !answer(request.change) {
                continue;
            }
            let SocketAddr::V4(seen) = from else {
                continue;
            };
            let mapped = SocketAddrV4::new(*seen.ip(), seen.port() + skew);
            let reply = encode_binding_success(request.transaction_id, mapped);
            let _ = server.send_to(&reply, from).await;
        }
    });
    server_addr
}

/// The reference probe table shape, pointed at two loopback responders.
pub(crate) fn probes_for(primary: SocketAddr, secondary: SocketAddr) -> Vec<Probe> {
    vec![
        Probe::new(primary.to_string(), false, false),
        Probe::new(secondary.to_string(), false, false),
        Probe::new(primary.to_string(), true, true),
        Probe::new(primary.to_string(), false, true),
    ]
}

/// In-process signaling: each side's sends become the other side's reads.
pub(crate) struct ChannelSignal {
    tx: mpsc::Sender<NatDescriptor>,
    rx: Mutex<mpsc::Receiver<NatDescriptor>>,
}

pub(crate) fn signal_pair() -> (Arc<ChannelSignal>, Arc<ChannelSignal>) {
    let (ab_tx, ab_rx) = mpsc::channel(1);
    let (ba_tx, ba_rx) = mpsc::channel(1);
    (
        Arc::new(ChannelSignal {
            tx: ab_tx,
            rx: Mutex::new(ba_rx),
        }),
        Arc::new(ChannelSignal {
            tx: ba_tx,
            rx: Mutex::new(ab_rx),
        }),
    )
}

#[async_trait]
impl Signal for ChannelSignal {
    async fn send_signal(&self, descriptor: &NatDescriptor) -> Result<()> {
        self.tx
            .send(descriptor.clone())
            .await
            .map_err(|e| Error::Signal(e.to_string()))
    }

    async fn read_signal(&self) -> Result<NatDescriptor> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Signal("peer hung up".to_string()))
    }
}
