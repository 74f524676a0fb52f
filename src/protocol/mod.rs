/*
   0                   1                   2                   3
   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                       magic = 0xE1E1 (LE)                     |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |  version = 1  |               token (4 bytes)
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
                  |     type      |     payload length (LE)       |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                        payload (0..=1000)                     |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  crc32 (IEEE, LE, bytes [0, 12+len))          |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

use bytes::BufMut;
use crc::Crc;
use thiserror::Error;

pub mod token;

use token::Token;

pub const MAGIC: u32 = 0xE1E1;
pub const VERSION: u8 = 1;
/// Bytes before the payload: magic + version + token + type + length.
pub const HEAD_LEN: usize = 12;
pub const CRC_LEN: usize = 4;
pub const MAX_PAYLOAD: usize = 1000;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum MessageKind {
    Handshake,
    Ping,
    Data,
    /// Not understood by this version; handed to the caller untouched.
    Unknown(u8),
}

impl From<u8> for MessageKind {
    fn from(value: u8) -> Self {
        match value {
            1 => MessageKind::Handshake,
            2 => MessageKind::Ping,
            3 => MessageKind::Data,
            other => MessageKind::Unknown(other),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(value: MessageKind) -> Self {
        match value {
            MessageKind::Handshake => 1,
            MessageKind::Ping => 2,
            MessageKind::Data => 3,
            MessageKind::Unknown(other) => other,
        }
    }
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum DecodeError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("magic mismatch: {0:#x}")]
    BadMagic(u32),
    #[error("unsupported version: {0}")]
    BadVersion(u8),
    #[error("payload length {expected} exceeds datagram ({actual} bytes left)")]
    Truncated { expected: usize, actual: usize },
    #[error("crc mismatch")]
    BadCrc,
}

/// One punching-protocol datagram.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    kind: MessageKind,
    token: Token,
    payload: Vec<u8>,
}

impl Message {
    pub fn handshake(token: Token) -> Message {
        Message {
            kind: MessageKind::Handshake,
            token,
            payload: Vec::new(),
        }
    }
    pub fn ping(token: Token) -> Message {
        Message {
            kind: MessageKind::Ping,
            token,
            payload: Vec::new(),
        }
    }
    /// Panics if `payload` exceeds [`MAX_PAYLOAD`]; callers must chunk first.
    pub fn data(token: Token, payload: Vec<u8>) -> Message {
        assert!(
            payload.len() <= MAX_PAYLOAD,
            "payload length {} exceeds {MAX_PAYLOAD}",
            payload.len()
        );
        Message {
            kind: MessageKind::Data,
            token,
            payload,
        }
    }
    pub fn kind(&self) -> MessageKind {
        self.kind
    }
    pub fn token(&self) -> Token {
        self.token
    }
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEAD_LEN + self.payload.len() + CRC_LEN);
        buf.put_u32_le(MAGIC);
        buf.put_u8(VERSION);
        buf.put_slice(self.token.as_bytes());
        buf.put_u8(self.kind.into());
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        let crc = CRC32.checksum(&buf);
        buf.put_u32_le(crc);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
        if bytes.len() < HEAD_LEN {
            return Err(DecodeError::TooShort(bytes.len()));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        let version = bytes[4];
        if version != VERSION {
            return Err(DecodeError::BadVersion(version));
        }
        let token = Token::from_bytes(bytes[5..9].try_into().unwrap());
        let kind = MessageKind::from(bytes[9]);
        let len = u16::from_le_bytes(bytes[10..12].try_into().unwrap()) as usize;
        if bytes.len() < HEAD_LEN + len + CRC_LEN {
            return Err(DecodeError::Truncated {
                expected: len,
                actual: bytes.len() - HEAD_LEN,
            });
        }
        let end = HEAD_LEN + len;
        let crc = u32::from_le_bytes(bytes[end..end + CRC_LEN].try_into().unwrap());
        if CRC32.checksum(&bytes[..end]) != crc {
            return Err(DecodeError::BadCrc);
        }
        Ok(Message {
            kind,
            token,
            payload: bytes[HEAD_LEN..end].to_vec(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::token::Token;
    use super::*;

    fn token() -> Token {
        "aabbccdd".parse().unwrap()
    }

    #[test]
    fn test_round_trip() {
        for msg in [
            Message::handshake(token()),
            Message::ping(token()),
            Message::data(token(), b"hello".to_vec()),
        ] {
            let bytes = msg.encode();
            assert_eq!(Message::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_layout() {
        let bytes = Message::handshake(token()).encode();
        assert_eq!(bytes.len(), HEAD_LEN + CRC_LEN);
        assert_eq!(&bytes[0..4], &0xE1E1u32.to_le_bytes());
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..9], &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(bytes[9], 1);
        assert_eq!(&bytes[10..12], &[0, 0]);
    }

    #[test]
    fn test_unknown_kind_passes_through() {
        let mut bytes = Message::ping(token()).encode();
        bytes[9] = 9;
        let crc = CRC32.checksum(&bytes[..HEAD_LEN]);
        let end = bytes.len();
        bytes[end - 4..].copy_from_slice(&crc.to_le_bytes());
        let msg = Message::decode(&bytes).unwrap();
        assert_eq!(msg.kind(), MessageKind::Unknown(9));
        assert_eq!(u8::from(msg.kind()), 9);
    }

    #[test]
    fn test_decode_errors() {
        let valid = Message::data(token(), b"x".to_vec()).encode();

        assert_eq!(
            Message::decode(&valid[..5]),
            Err(DecodeError::TooShort(5))
        );

        let mut bad_magic = valid.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(
            Message::decode(&bad_magic),
            Err(DecodeError::BadMagic(_))
        ));

        let mut bad_version = valid.clone();
        bad_version[4] = 2;
        assert_eq!(Message::decode(&bad_version), Err(DecodeError::BadVersion(2)));

        let mut bad_len = valid.clone();
        bad_len[10..12].copy_from_slice(&900u16.to_le_bytes());
        assert!(matches!(
            Message::decode(&bad_len),
            Err(DecodeError::Truncated { expected: 900, .. })
        ));

        let mut bad_crc = valid.clone();
        *bad_crc.last_mut().unwrap() ^= 0xff;
        assert_eq!(Message::decode(&bad_crc), Err(DecodeError::BadCrc));

        // corrupted payload fails the checksum too
        let mut bad_payload = valid;
        bad_payload[HEAD_LEN] ^= 0xff;
        assert_eq!(Message::decode(&bad_payload), Err(DecodeError::BadCrc));
    }

    #[test]
    fn test_payload_bounds() {
        let msg = Message::data(token(), vec![7; MAX_PAYLOAD]);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.payload().len(), MAX_PAYLOAD);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_payload_too_long() {
        let _ = Message::data(token(), vec![7; MAX_PAYLOAD + 1]);
    }
}
