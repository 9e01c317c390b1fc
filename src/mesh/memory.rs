use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::Message;
use crate::mesh::MeshTransport;
use crate::utils::{MeshError, Result};

const INBOUND_BUFFER: usize = 1024;

/// Process-local mesh. Every joined node sees every other node one hop away.
/// Used by the end-to-end tests and by embedders that colocate several
/// services in one process; real deployments provide their own
/// `MeshTransport`.
pub struct MemoryHub {
    nodes: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    sent: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            sent: AtomicU64::new(0),
        })
    }

    /// Join the hub under `name`, returning the node's transport and the
    /// stream of messages addressed to it.
    pub fn join(self: &Arc<Self>, name: &str) -> (Arc<MemoryMesh>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        self.nodes.lock().insert(name.to_string(), tx);

        let mesh = Arc::new(MemoryMesh {
            name: name.to_string(),
            hub: self.clone(),
        });
        (mesh, rx)
    }

    pub fn leave(&self, name: &str) {
        self.nodes.lock().remove(name);
    }

    /// Total messages pushed through the hub. Handy for asserting that an
    /// operation stayed off the wire.
    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

pub struct MemoryMesh {
    name: String,
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl MeshTransport for MemoryMesh {
    fn local_name(&self) -> &str {
        &self.name
    }

    async fn broadcast(&self, msg: Message) -> Result<usize> {
        let targets: Vec<(String, mpsc::Sender<Message>)> = self
            .hub
            .nodes
            .lock()
            .iter()
            .filter(|(name, _)| name.as_str() != self.name)
            .map(|(name, tx)| (name.clone(), tx.clone()))
            .collect();

        let mut attempted = 0;
        for (name, tx) in targets {
            attempted += 1;
            self.hub.sent.fetch_add(1, Ordering::Relaxed);
            if tx.send(msg.clone()).await.is_err() {
                debug!("broadcast to departed node {} dropped", name);
            }
        }
        Ok(attempted)
    }

    async fn send(&self, peer: &str, msg: Message) -> Result<()> {
        let tx = self
            .hub
            .nodes
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| MeshError::Transport(format!("unknown peer {}", peer)))?;

        self.hub.sent.fetch_add(1, Ordering::Relaxed);
        tx.send(msg)
            .await
            .map_err(|_| MeshError::Transport(format!("peer {} is gone", peer)))
    }

    fn distance_to(&self, _peer: &str) -> u32 {
        1
    }
}
