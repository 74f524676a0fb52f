use async_trait::async_trait;

use crate::error::Result;
use crate::resolver::NatDescriptor;

/// Out-of-band descriptor exchange between the two peers.
///
/// The transport is up to the caller (copy/paste over a chat, a websocket
/// relay, anything that survives one round-trip in each direction); neither
/// side is required to send before reading. Descriptors are not
/// authenticated: whoever controls the signaling path can redirect a peer,
/// and the punching token only ties datagrams to a session, not to an
/// identity.
#[async_trait]
pub trait Signal: Send + Sync {
    async fn send_signal(&self, descriptor: &NatDescriptor) -> Result<()>;
    async fn read_signal(&self) -> Result<NatDescriptor>;
}
