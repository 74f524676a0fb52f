//! The RFC 5389 subset the resolver needs: Binding requests with an optional
//! CHANGE-REQUEST attribute, Binding responses carrying XOR-MAPPED-ADDRESS,
//! and a client that multiplexes concurrent transactions over one socket.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_SUCCESS: u16 = 0x0101;

const HEADER_LEN: usize = 20;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const CHANGE_IP: u32 = 0x4;
const CHANGE_PORT: u32 = 0x2;

pub type TransactionId = [u8; 12];

#[derive(Error, Debug)]
pub enum StunError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no answer after {0} sends")]
    Timeout(usize),
    #[error("malformed stun packet")]
    Malformed,
    #[error("response carries no XOR-MAPPED-ADDRESS")]
    NoMappedAddress,
}

/// Which CHANGE-REQUEST flags a Binding request carries.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ChangeRequest {
    pub ip: bool,
    pub port: bool,
}

impl ChangeRequest {
    pub const NONE: ChangeRequest = ChangeRequest {
        ip: false,
        port: false,
    };
    pub const IP_AND_PORT: ChangeRequest = ChangeRequest {
        ip: true,
        port: true,
    };
    pub const PORT: ChangeRequest = ChangeRequest {
        ip: false,
        port: true,
    };

    fn flags(self) -> u32 {
        let mut flags = 0;
        if self.ip {
            flags |= CHANGE_IP;
        }
        if self.port {
            flags |= CHANGE_PORT;
        }
        flags
    }
}

/// A decoded packet, reduced to the fields this crate looks at.
#[derive(Debug, Clone)]
pub struct StunPacket {
    pub msg_type: u16,
    pub transaction_id: TransactionId,
    pub xor_mapped: Option<SocketAddrV4>,
    pub change: ChangeRequest,
}

pub fn encode_binding_request(id: TransactionId, change: ChangeRequest) -> Vec<u8> {
    let attr_len = if change.flags() != 0 { 8 } else { 0 };
    let mut buf = Vec::with_capacity(HEADER_LEN + attr_len);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(attr_len as u16);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(&id);
    if change.flags() != 0 {
        buf.put_u16(ATTR_CHANGE_REQUEST);
        buf.put_u16(4);
        buf.put_u32(change.flags());
    }
    buf
}

pub fn encode_binding_success(id: TransactionId, mapped: SocketAddrV4) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 12);
    buf.put_u16(BINDING_SUCCESS);
    buf.put_u16(12);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(&id);
    buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
    buf.put_u16(8);
    buf.put_u8(0);
    buf.put_u8(0x01); // IPv4
    buf.put_u16(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16);
    buf.put_u32(u32::from(*mapped.ip()) ^ MAGIC_COOKIE);
    buf
}

pub fn decode(bytes: &[u8]) -> Result<StunPacket, StunError> {
    if bytes.len() < HEADER_LEN {
        return Err(StunError::Malformed);
    }
    let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
    let msg_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let cookie = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    if cookie != MAGIC_COOKIE || bytes.len() < HEADER_LEN + msg_len {
        return Err(StunError::Malformed);
    }
    let mut transaction_id = TransactionId::default();
    transaction_id.copy_from_slice(&bytes[8..20]);

    let mut packet = StunPacket {
        msg_type,
        transaction_id,
        xor_mapped: None,
        change: ChangeRequest::NONE,
    };
    let mut offset = HEADER_LEN;
    while offset + 4 <= HEADER_LEN + msg_len {
        let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let attr_len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > bytes.len() {
            return Err(StunError::Malformed);
        }
        let value = &bytes[offset..offset + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS if attr_len >= 8 && value[1] == 0x01 => {
                let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
                let ip = u32::from_be_bytes(value[4..8].try_into().unwrap()) ^ MAGIC_COOKIE;
                packet.xor_mapped = Some(SocketAddrV4::new(Ipv4Addr::from(ip), port));
            }
            ATTR_CHANGE_REQUEST if attr_len >= 4 => {
                let flags = u32::from_be_bytes(value[0..4].try_into().unwrap());
                packet.change = ChangeRequest {
                    ip: flags & CHANGE_IP != 0,
                    port: flags & CHANGE_PORT != 0,
                };
            }
            _ => {}
        }
        // attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }
    Ok(packet)
}

type Pending = Arc<Mutex<HashMap<TransactionId, oneshot::Sender<StunPacket>>>>;

/// Runs any number of concurrent Binding transactions over one socket,
/// demultiplexing responses by transaction id. Non-STUN datagrams arriving
/// on the socket are ignored.
pub struct StunClient {
    socket: Arc<UdpSocket>,
    pending: Pending,
    rto: Duration,
    max_sends: usize,
    reader: JoinHandle<()>,
}

impl StunClient {
    pub fn new(socket: Arc<UdpSocket>, rto: Duration, max_sends: usize) -> StunClient {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(socket.clone(), pending.clone()));
        StunClient {
            socket,
            pending,
            rto,
            max_sends,
            reader,
        }
    }

    /// One Binding transaction: send, retransmit every RTO, return the
    /// server-observed mapping.
    pub async fn binding_request(
        &self,
        server: SocketAddr,
        change: ChangeRequest,
    ) -> Result<SocketAddrV4, StunError> {
        let id: TransactionId = rand::random();
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let request = encode_binding_request(id, change);

        let result = async {
            for _ in 0..self.max_sends {
                self.socket.send_to(&request, server).await?;
                match tokio::time::timeout(self.rto, &mut rx).await {
                    Ok(Ok(packet)) => {
                        return packet.xor_mapped.ok_or(StunError::NoMappedAddress)
                    }
                    Ok(Err(_)) => break,
                    Err(_) => continue,
                }
            }
            Err(StunError::Timeout(self.max_sends))
        }
        .await;
        self.pending.lock().remove(&id);
        result
    }

    /// Stops the demultiplexing reader and waits for it to drop its socket
    /// reference, so the caller can observe sole ownership afterwards.
    pub async fn shutdown(mut self) {
        self.reader.abort();
        let _ = (&mut self.reader).await;
    }
}

impl Drop for StunClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(socket: Arc<UdpSocket>, pending: Pending) {
    let mut buf = [0u8; 512];
    loop {
        let Ok((n, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let packet = match decode(&buf[..n]) {
            Ok(packet) => packet,
            Err(_) => {
                log::debug!("non-stun datagram from {from}");
                continue;
            }
        };
        if packet.msg_type != BINDING_SUCCESS {
            continue;
        }
        if let Some(tx) = pending.lock().remove(&packet.transaction_id) {
            let _ = tx.send(packet);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::socket::bind_udp_port;

    #[test]
    fn test_request_round_trip() {
        let id: TransactionId = rand::random();
        let bytes = encode_binding_request(id, ChangeRequest::IP_AND_PORT);
        let packet = decode(&bytes).unwrap();
        assert_eq!(packet.msg_type, BINDING_REQUEST);
        assert_eq!(packet.transaction_id, id);
        assert_eq!(packet.change, ChangeRequest::IP_AND_PORT);
        assert!(packet.xor_mapped.is_none());

        let plain = encode_binding_request(id, ChangeRequest::NONE);
        assert_eq!(plain.len(), HEADER_LEN);
        assert_eq!(decode(&plain).unwrap().change, ChangeRequest::NONE);
    }

    #[test]
    fn test_success_round_trip() {
        let id: TransactionId = rand::random();
        let mapped: SocketAddrV4 = "203.0.113.7:4242".parse().unwrap();
        let packet = decode(&encode_binding_success(id, mapped)).unwrap();
        assert_eq!(packet.msg_type, BINDING_SUCCESS);
        assert_eq!(packet.xor_mapped, Some(mapped));
    }

    #[test]
    fn test_malformed() {
        assert!(decode(&[0u8; 8]).is_err());
        let mut bad_cookie = encode_binding_request(rand::random(), ChangeRequest::NONE);
        bad_cookie[4] ^= 0xff;
        assert!(decode(&bad_cookie).is_err());
    }

    #[tokio::test]
    async fn test_transaction_over_loopback() {
        let server = bind_udp_port(0).unwrap();
        let server_addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().unwrap().port()));
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let request = decode(&buf[..n]).unwrap();
            let mapped = match from {
                SocketAddr::V4(addr) => addr,
                SocketAddr::V6(_) => unreachable!(),
            };
            let reply = encode_binding_success(request.transaction_id, mapped);
            server.send_to(&reply, from).await.unwrap();
        });

        let socket = Arc::new(bind_udp_port(0).unwrap());
        let local_port = socket.local_addr().unwrap().port();
        let client = StunClient::new(socket, Duration::from_secs(1), 3);
        let mapped = client
            .binding_request(server_addr, ChangeRequest::NONE)
            .await
            .unwrap();
        assert_eq!(mapped.port(), local_port);
    }

    #[tokio::test]
    async fn test_transaction_timeout() {
        // nothing listens on the far side
        let sink = bind_udp_port(0).unwrap();
        let sink_addr = SocketAddr::from(([127, 0, 0, 1], sink.local_addr().unwrap().port()));

        let socket = Arc::new(bind_udp_port(0).unwrap());
        let client = StunClient::new(socket, Duration::from_millis(20), 2);
        let err = client
            .binding_request(sink_addr, ChangeRequest::NONE)
            .await
            .unwrap_err();
        assert!(matches!(err, StunError::Timeout(2)));
    }
}
