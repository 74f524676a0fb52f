use std::io;

use thiserror::Error;

use crate::protocol::token::Token;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to resolve nat: {0}")]
    Resolve(&'static str),
    #[error("handshake deadline exceeded")]
    HandshakeTimeout,
    #[error("token mismatch: {0}")]
    TokenMismatch(Token),
    #[error("both peers behind symmetric nat")]
    Unsupported,
    #[error("signal channel: {0}")]
    Signal(String),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
