use log::{debug, warn};
use std::sync::Arc;

use crate::core::{part_count, Message, MessageKind};
use crate::mesh::MeshTransport;
use crate::storage::{HashIndex, Inventory};
use crate::utils::Result;

/// Answers Info, WhoHas and Xfer requests from peers out of the local
/// inventory. Every reply echoes the request TID and names the local node.
pub(crate) struct Uploader {
    inventory: Arc<Inventory>,
    transport: Arc<dyn MeshTransport>,
    hash_index: Arc<HashIndex>,
    part_size: u64,
}

impl Uploader {
    pub fn new(
        inventory: Arc<Inventory>,
        transport: Arc<dyn MeshTransport>,
        hash_index: Arc<HashIndex>,
        part_size: u64,
    ) -> Self {
        Self {
            inventory,
            transport,
            hash_index,
            part_size,
        }
    }

    pub async fn handle(&self, msg: Message) {
        debug!(
            "handling {:?} request for {} from {}",
            msg.kind, msg.filename, msg.from
        );

        let reply = match msg.kind {
            MessageKind::Info => self.handle_info(&msg).await,
            MessageKind::WhoHas => self.handle_whohas(&msg).await,
            MessageKind::Xfer => self.handle_xfer(&msg).await,
            MessageKind::Response => return,
        };

        if let Err(e) = self.transport.send(&msg.from, reply).await {
            warn!("replying to {} failed: {}", msg.from, e);
        }
    }

    /// One match answers with the file's shape, several with the match list,
    /// none with a NACK.
    async fn handle_info(&self, msg: &Message) -> Message {
        let name = self.transport.local_name();

        let matches = match self.inventory.resolve(&msg.filename).await {
            Ok(m) => m,
            Err(e) => {
                debug!("resolving {} failed: {}", msg.filename, e);
                Vec::new()
            }
        };

        match matches.len() {
            0 => Message::nack(name, &msg.filename, msg.tid),
            1 => {
                let file = &matches[0];
                match self.inventory.stat_file(file).await {
                    Ok((size, perm)) => Message::info_ack(
                        name,
                        file,
                        part_count(size, self.part_size),
                        perm,
                        self.hash_index.get(file).await,
                        msg.tid,
                    ),
                    Err(_) => Message::nack(name, &msg.filename, msg.tid),
                }
            }
            _ => Message::glob_ack(name, &msg.filename, matches, msg.tid),
        }
    }

    async fn handle_whohas(&self, msg: &Message) -> Message {
        let name = self.transport.local_name();
        match self.inventory.stat_file(&msg.filename).await {
            Ok((size, _)) if msg.part >= 0 && msg.part < part_count(size, self.part_size) => {
                Message::whohas_ack(name, &msg.filename, msg.part, msg.tid)
            }
            _ => Message::nack(name, &msg.filename, msg.tid),
        }
    }

    async fn handle_xfer(&self, msg: &Message) -> Message {
        let name = self.transport.local_name();
        match self.read_part(msg).await {
            Ok((data, parts, perm)) => Message::xfer_ack(
                name,
                &msg.filename,
                msg.part,
                parts,
                perm,
                data,
                msg.tid,
            ),
            Err(e) => {
                debug!("xfer of {}:{} refused: {}", msg.filename, msg.part, e);
                Message::nack(name, &msg.filename, msg.tid)
            }
        }
    }

    async fn read_part(&self, msg: &Message) -> Result<(Vec<u8>, i64, u32)> {
        let (size, perm) = self.inventory.stat_file(&msg.filename).await?;
        let data = self
            .inventory
            .read_part(&msg.filename, msg.part, self.part_size)
            .await?;
        Ok((data, part_count(size, self.part_size), perm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MeshError;
    use parking_lot::Mutex;
    use tokio::fs;

    /// Transport that records every directed reply instead of sending it.
    struct CaptureMesh {
        sent: Mutex<Vec<(String, Message)>>,
    }

    impl CaptureMesh {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }

        fn last(&self) -> Message {
            self.sent.lock().last().map(|(_, m)| m.clone()).unwrap()
        }
    }

    #[async_trait::async_trait]
    impl MeshTransport for CaptureMesh {
        fn local_name(&self) -> &str {
            "server"
        }

        async fn broadcast(&self, _msg: Message) -> crate::utils::Result<usize> {
            Err(MeshError::Transport("capture only".to_string()))
        }

        async fn send(&self, peer: &str, msg: Message) -> crate::utils::Result<()> {
            self.sent.lock().push((peer.to_string(), msg));
            Ok(())
        }

        fn distance_to(&self, _peer: &str) -> u32 {
            1
        }
    }

    async fn uploader_with(
        files: &[(&str, &[u8])],
    ) -> (tempfile::TempDir, Arc<CaptureMesh>, Uploader) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.unwrap();
            }
            fs::write(&path, content).await.unwrap();
        }

        let inventory = Arc::new(Inventory::new(dir.path().to_path_buf()).await.unwrap());
        let mesh = Arc::new(CaptureMesh::new());
        let uploader = Uploader::new(
            inventory,
            mesh.clone(),
            Arc::new(HashIndex::new(false)),
            4,
        );
        (dir, mesh, uploader)
    }

    #[tokio::test]
    async fn test_info_exact_match() {
        let (_dir, mesh, uploader) = uploader_with(&[("hello.txt", b"abcdefghij")]).await;

        uploader
            .handle(Message::info_request("client", "hello.txt", 7))
            .await;
        let reply = mesh.last();
        assert!(reply.ack);
        assert_eq!(reply.filename, "hello.txt");
        assert_eq!(reply.parts, 3);
        assert_eq!(reply.tid, 7);
        assert_eq!(reply.from, "server");
        assert!(reply.glob.is_empty());
    }

    #[tokio::test]
    async fn test_info_glob_and_miss() {
        let (_dir, mesh, uploader) =
            uploader_with(&[("dir/x", b"xxxxx"), ("dir/y", b"yyy")]).await;

        uploader
            .handle(Message::info_request("client", "dir", 8))
            .await;
        let reply = mesh.last();
        assert!(reply.ack);
        assert_eq!(reply.parts, 0);
        let mut glob = reply.glob.clone();
        glob.sort();
        assert_eq!(glob, vec!["dir/x", "dir/y"]);

        uploader
            .handle(Message::info_request("client", "*.iso", 9))
            .await;
        assert!(!mesh.last().ack);
    }

    #[tokio::test]
    async fn test_xfer_parts_and_refusals() {
        let (_dir, mesh, uploader) =
            uploader_with(&[("f", b"abcdefghij"), ("empty", b"")]).await;

        uploader
            .handle(Message::xfer_request("client", "f", 2, 1))
            .await;
        let reply = mesh.last();
        assert!(reply.ack);
        assert_eq!(reply.data, b"ij");
        assert_eq!(reply.parts, 3);
        assert_eq!(reply.part, 2);

        // out of range
        uploader
            .handle(Message::xfer_request("client", "f", 3, 2))
            .await;
        assert!(!mesh.last().ack);

        // part 0 of an empty file is malformed
        uploader
            .handle(Message::xfer_request("client", "empty", 0, 3))
            .await;
        assert!(!mesh.last().ack);
    }

    #[tokio::test]
    async fn test_whohas() {
        let (_dir, mesh, uploader) = uploader_with(&[("f", b"abcdefghij")]).await;

        uploader
            .handle(Message::whohas_request("client", "f", 1, 4))
            .await;
        assert!(mesh.last().ack);

        uploader
            .handle(Message::whohas_request("client", "f", 9, 5))
            .await;
        assert!(!mesh.last().ack);

        uploader
            .handle(Message::whohas_request("client", "missing", 0, 6))
            .await;
        assert!(!mesh.last().ack);
    }

    #[tokio::test]
    async fn test_info_carries_digest_when_hashing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"abc").await.unwrap();

        let inventory = Arc::new(Inventory::new(dir.path().to_path_buf()).await.unwrap());
        let index = Arc::new(HashIndex::new(true));
        index.rescan(&inventory).await.unwrap();

        let mesh = Arc::new(CaptureMesh::new());
        let uploader = Uploader::new(inventory, mesh.clone(), index, 4);

        uploader
            .handle(Message::info_request("client", "f", 1))
            .await;
        let reply = mesh.last();
        assert!(reply.ack);
        assert_eq!(
            reply.digest.unwrap(),
            crate::storage::HashUtils::hash_data(b"abc")
        );
    }
}
