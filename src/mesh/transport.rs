use crate::core::Message;
use crate::utils::Result;

/// Capability the surrounding mesh must provide. The core never routes
/// messages itself; it only broadcasts requests, sends directed requests and
/// replies, and asks how far away a peer is. Inbound messages reach the core
/// through the channel handed to `FileService::new`.
#[async_trait::async_trait]
pub trait MeshTransport: Send + Sync {
    /// Name of the local node on the mesh.
    fn local_name(&self) -> &str;

    /// Send to every currently-reachable peer. Returns how many peers the
    /// send was attempted to; delivery is best-effort.
    async fn broadcast(&self, msg: Message) -> Result<usize>;

    /// Send to a single named peer.
    async fn send(&self, peer: &str, msg: Message) -> Result<()>;

    /// Route distance to a peer in hops. Used to prefer nearby sources.
    fn distance_to(&self, peer: &str) -> u32;
}
