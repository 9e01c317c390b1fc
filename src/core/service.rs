use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;

use crate::core::{Config, Message, MessageKind, PART_SIZE, TIMEOUT};
use crate::mesh::MeshTransport;
use crate::storage::{is_pattern, HashIndex, Inventory, SCRATCH_PREFIX};
use crate::transfer::collector::Selection;
use crate::transfer::downloader::Downloader;
use crate::transfer::registry::TidRegistry;
use crate::transfer::snoop::snoop;
use crate::transfer::stream::{stream_local, stream_remote};
use crate::transfer::uploader::Uploader;
use crate::transfer::TransferStatus;
use crate::utils::{MeshError, Result};

/// One node's file distribution service: serves the base directory to the
/// mesh and retrieves files from peers on demand. Construct one per process;
/// there is no hidden global state.
pub struct FileService {
    inventory: Arc<Inventory>,
    transport: Arc<dyn MeshTransport>,
    engine: Arc<Downloader>,
    hash_index: Arc<HashIndex>,
    head: Option<String>,
    part_size: u64,
}

impl FileService {
    /// Build a service over `transport`, consuming mesh messages addressed
    /// to this node from `inbound`. The base directory is created if absent
    /// and leftover scratch directories from a previous run are swept away.
    pub async fn new(
        config: Config,
        transport: Arc<dyn MeshTransport>,
        inbound: mpsc::Receiver<Message>,
    ) -> Result<Arc<Self>> {
        Self::build(config, transport, inbound, PART_SIZE, TIMEOUT).await
    }

    #[cfg(test)]
    pub(crate) async fn with_tunables(
        config: Config,
        transport: Arc<dyn MeshTransport>,
        inbound: mpsc::Receiver<Message>,
        part_size: u64,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        Self::build(config, transport, inbound, part_size, timeout).await
    }

    async fn build(
        config: Config,
        transport: Arc<dyn MeshTransport>,
        mut inbound: mpsc::Receiver<Message>,
        part_size: u64,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        info!("new file service on base {:?}", config.base);

        let head = config.head.clone().filter(|h| !h.is_empty());
        let inventory = Arc::new(Inventory::new(config.base.clone()).await?);
        sweep_scratch(&inventory).await;

        let registry = Arc::new(TidRegistry::new());
        let hash_index = Arc::new(HashIndex::new(config.hash));
        if config.hash {
            // first pass runs immediately so Info replies can carry digests
            HashIndex::spawn_scanner(hash_index.clone(), inventory.clone());
        }

        let engine = Arc::new(Downloader::new(
            inventory.clone(),
            transport.clone(),
            registry.clone(),
            hash_index.clone(),
            head.clone(),
            timeout,
        ));
        let uploader = Arc::new(Uploader::new(
            inventory.clone(),
            transport.clone(),
            hash_index.clone(),
            part_size,
        ));

        // Inbound demultiplexer: responses go to their waiting requester,
        // requests are answered in their own task so a slow disk read never
        // stalls the dispatcher.
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                match msg.kind {
                    MessageKind::Response => registry.deliver(msg),
                    _ => {
                        let uploader = uploader.clone();
                        tokio::spawn(async move {
                            uploader.handle(msg).await;
                        });
                    }
                }
            }
            debug!("inbound channel closed, dispatcher exiting");
        });

        Ok(Arc::new(Self {
            inventory,
            transport,
            engine,
            hash_index,
            head,
            part_size,
        }))
    }

    /// Retrieve a file (or every file under a directory or glob) from the
    /// mesh. Returns once transfers are scheduled; completion is
    /// asynchronous and visible through `status`. A file already present
    /// locally is left alone unless a head node is configured.
    pub async fn get(&self, file: &str) -> Result<()> {
        self.engine.clone().get(file).await
    }

    /// Stream a file as part-sized chunks in order without storing it
    /// locally. The stream ends early if any part fails; a request that
    /// resolves to several files is refused.
    pub async fn stream(&self, file: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let exists = self.inventory.stat_file(file).await.is_ok();
        if exists && self.head.is_none() {
            return Ok(stream_local(self.inventory.abs(file)?, self.part_size));
        }

        let inquiry = self.engine.collect_info(file).await?;
        if inquiry.is_empty() {
            return Err(MeshError::NotFound(file.to_string()));
        }

        let local_digest = self.hash_index.get(file).await;
        match inquiry.select(file, local_digest.as_deref(), exists, self.transport.as_ref()) {
            Selection::Local => Ok(stream_local(self.inventory.abs(file)?, self.part_size)),
            Selection::Remote(src) => Ok(stream_remote(self.engine.clone(), src)),
            Selection::Unusable => Err(MeshError::Malformed(format!(
                "cannot stream a glob: {}",
                file
            ))),
        }
    }

    /// Deep snapshot of the in-flight transfers.
    pub async fn status(&self) -> Vec<TransferStatus> {
        self.engine.status().await
    }

    /// Search the whole mesh for a file, directory, or glob. Returns every
    /// matching relative path, local matches included.
    pub async fn info(&self, pattern: &str) -> Vec<String> {
        let mut ret = match self.inventory.resolve(pattern).await {
            Ok(matches) => matches,
            Err(e) => {
                debug!("resolving {} locally failed: {}", pattern, e);
                Vec::new()
            }
        };

        match self.engine.collect_info(pattern).await {
            Ok(inquiry) => {
                for ack in inquiry.messages() {
                    if ack.glob.is_empty() {
                        // an exact match, unless it is the pattern echoed back
                        if !is_pattern(&ack.filename) {
                            ret.push(ack.filename.clone());
                        }
                    } else {
                        ret.extend(ack.glob.iter().cloned());
                    }
                }
            }
            Err(e) => error!("mesh info for {} failed: {}", pattern, e),
        }

        ret
    }

    /// Ask which peer can serve one part of a file. Diagnostic; the fetch
    /// path does not consult it.
    pub async fn whohas(&self, file: &str, part: i64) -> Result<String> {
        self.engine.whohas(file, part).await
    }

    /// Offer a response the surrounding mesh is forwarding on behalf of
    /// other nodes. Parts of files this node is currently acquiring are
    /// cached, cutting redundant fetches.
    pub async fn snoop(&self, msg: &Message) {
        snoop(self.engine.drain(), self.engine.transfers(), msg).await;
    }

    /// The directory this node serves.
    pub fn base(&self) -> &Path {
        self.inventory.base()
    }
}

/// Remove scratch directories orphaned by an earlier run.
async fn sweep_scratch(inventory: &Inventory) {
    let mut entries = match fs::read_dir(inventory.base()).await {
        Ok(entries) => entries,
        Err(_) => return,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(SCRATCH_PREFIX) {
            continue;
        }
        if let Ok(ftype) = entry.file_type().await {
            if ftype.is_dir() {
                info!("removing stale scratch dir {}", name);
                if let Err(e) = fs::remove_dir_all(entry.path()).await {
                    warn!("removing {} failed: {}", name, e);
                }
            }
        }
    }
}
