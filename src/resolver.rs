//! NAT classification. Four Binding transactions run in parallel over the
//! bootstrap socket; comparing which of them were answered, and with which
//! mapping, pins down the NAT's filtering class and its public endpoint.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::net::UdpSocket;

use crate::config::{Probe, TunnelConfig};
use crate::error::{Error, Result};
use crate::protocol::token::Token;
use crate::stun::{ChangeRequest, StunClient};

/// NAT filtering classes, weakest to strictest. The numeric encoding goes
/// into signaling descriptors and must stay stable.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum NatType {
    FullCone = 1,
    RestrictedCone = 2,
    PortRestrictedCone = 3,
    Symmetric = 4,
}

impl NatType {
    pub fn is_symmetric(&self) -> bool {
        self == &NatType::Symmetric
    }
    pub fn is_cone(&self) -> bool {
        !self.is_symmetric()
    }
}

impl TryFrom<u8> for NatType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(NatType::FullCone),
            2 => Ok(NatType::RestrictedCone),
            3 => Ok(NatType::PortRestrictedCone),
            4 => Ok(NatType::Symmetric),
            other => Err(other),
        }
    }
}

impl Serialize for NatType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for NatType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        NatType::try_from(value)
            .map_err(|v| serde::de::Error::custom(format_args!("invalid nat_type {v}")))
    }
}

/// What one peer tells the other over the signaling channel.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct NatDescriptor {
    /// Public `ip:port` observed by the primary probe.
    pub addr: String,
    pub nat_type: NatType,
    pub token: Token,
}

impl NatDescriptor {
    /// The signaling wire form: `{"addr":..,"nat_type":1..4,"token":..}`.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Signal(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<NatDescriptor> {
        serde_json::from_str(json).map_err(|e| Error::Signal(e.to_string()))
    }
}

/// Owns the STUN side of the bootstrap socket for the duration of one
/// classification run. Dropping it releases the socket reference and stops
/// the demultiplexing reader.
pub struct Resolver {
    client: StunClient,
}

impl Resolver {
    pub fn new(socket: Arc<UdpSocket>, config: &TunnelConfig) -> Resolver {
        Resolver {
            client: StunClient::new(socket, config.stun_rto, config.stun_max_sends),
        }
    }

    /// Runs the probe table and classifies. Fails only when one of the two
    /// primary probes goes unanswered; CHANGE-REQUEST probes are expected to
    /// time out behind stricter NATs.
    pub async fn resolve(&self, probes: &[Probe]) -> Result<NatDescriptor> {
        let token = Token::generate();
        log::debug!("generated local token {token}");

        let mapped = join_all(probes.iter().map(|probe| self.probe(probe))).await;
        log::debug!("mapped addrs {mapped:?}");

        let nat_type =
            classify(&mapped).ok_or(Error::Resolve("primary stun probes unanswered"))?;
        let addr = mapped[0]
            .ok_or(Error::Resolve("primary stun probes unanswered"))?
            .to_string();
        Ok(NatDescriptor {
            addr,
            nat_type,
            token,
        })
    }

    /// Releases the bootstrap socket reference deterministically; after this
    /// returns, dropping the caller's own handle frees the port for rebinding.
    pub async fn close(self) {
        self.client.shutdown().await;
    }

    async fn probe(&self, probe: &Probe) -> Option<SocketAddrV4> {
        let server = match resolve_v4(&probe.server).await {
            Ok(server) => server,
            Err(e) => {
                log::debug!("probe {} did not resolve: {e}", probe.server);
                return None;
            }
        };
        let change = ChangeRequest {
            ip: probe.change_ip,
            port: probe.change_port,
        };
        match self.client.binding_request(server, change).await {
            Ok(mapped) => Some(mapped),
            Err(e) => {
                log::debug!("probe {} ({change:?}) failed: {e}", probe.server);
                None
            }
        }
    }
}

/// First match wins, in this order:
/// different mappings toward different servers mean the mapping depends on
/// the destination (symmetric); an answer to the change-IP+port probe means
/// filtering is endpoint-independent (full cone); an answer to the
/// change-port probe means filtering is address-restricted; otherwise the
/// NAT filters on address and port.
pub fn classify(mapped: &[Option<SocketAddrV4>]) -> Option<NatType> {
    let first = mapped.first().copied().flatten()?;
    let second = mapped.get(1).copied().flatten()?;
    Some(if first != second {
        NatType::Symmetric
    } else if mapped.get(2).copied().flatten() == Some(first) {
        NatType::FullCone
    } else if mapped.get(3).copied().flatten() == Some(first) {
        NatType::RestrictedCone
    } else {
        NatType::PortRestrictedCone
    })
}

async fn resolve_v4(server: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no ipv4 address"))
}
