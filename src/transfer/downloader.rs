use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::core::{Message, MAX_ATTEMPTS, QUEUE_LEN};
use crate::mesh::MeshTransport;
use crate::storage::{HashIndex, Inventory, SCRATCH_PREFIX};
use crate::transfer::collector::{InfoCollector, Selection};
use crate::transfer::registry::TidRegistry;
use crate::utils::{MeshError, Result};

/// One in-flight file acquisition. Owned by the transfers map; tasks hold
/// only the filename key and re-look records up under the lock.
#[derive(Debug)]
pub(crate) struct Transfer {
    /// Scratch directory holding part files, exclusively owned.
    pub dir: PathBuf,
    pub filename: String,
    /// Completed part indices. Grows monotonically; the snoop cache may add
    /// entries, nothing ever removes one.
    pub parts: HashSet<i64>,
    pub num_parts: i64,
    /// Part currently being fetched, -1 when none.
    pub inflight: i64,
    /// Still waiting for an admission slot.
    pub queued: bool,
}

/// Point-in-time copy of one transfer, safe to hand to callers.
#[derive(Debug, Clone)]
pub struct TransferStatus {
    pub filename: String,
    pub num_parts: i64,
    pub completed: Vec<i64>,
    pub inflight: i64,
    pub queued: bool,
}

pub(crate) type TransferTable = RwLock<HashMap<String, Transfer>>;

/// Canonical part file path inside a scratch directory.
pub(crate) fn part_path(dir: &Path, filename: &str, part: i64) -> PathBuf {
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    dir.join(format!("{}.part_{}", base, part))
}

pub(crate) async fn write_part_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o664)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// The transfer engine: locates files on the mesh, pulls their parts in
/// randomized order with bounded concurrency, and assembles them under the
/// base path.
pub(crate) struct Downloader {
    inventory: Arc<Inventory>,
    transport: Arc<dyn MeshTransport>,
    registry: Arc<TidRegistry>,
    hash_index: Arc<HashIndex>,
    transfers: Arc<TransferTable>,
    queue: Arc<Semaphore>,
    drain: Arc<RwLock<()>>,
    rng: Mutex<StdRng>,
    head: Option<String>,
    timeout: Duration,
}

impl Downloader {
    pub fn new(
        inventory: Arc<Inventory>,
        transport: Arc<dyn MeshTransport>,
        registry: Arc<TidRegistry>,
        hash_index: Arc<HashIndex>,
        head: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            inventory,
            transport,
            registry,
            hash_index,
            transfers: Arc::new(RwLock::new(HashMap::new())),
            queue: Arc::new(Semaphore::new(QUEUE_LEN)),
            drain: Arc::new(RwLock::new(())),
            rng: Mutex::new(StdRng::from_entropy()),
            head,
            timeout,
        }
    }

    pub fn transfers(&self) -> &Arc<TransferTable> {
        &self.transfers
    }

    pub fn drain(&self) -> &Arc<RwLock<()>> {
        &self.drain
    }

    pub fn queue(&self) -> &Arc<Semaphore> {
        &self.queue
    }

    /// Retrieve a file from the nearest peer that has it. Returns once the
    /// part fetchers are scheduled; completion is asynchronous and visible
    /// through `status`. Directories and globs fan out into one transfer per
    /// matching file, started in random order.
    pub async fn get(self: Arc<Self>, file: &str) -> Result<()> {
        self.get_boxed(file.to_string()).await
    }

    // Glob ACKs recurse into their entries, so the future has to be boxed.
    fn get_boxed(
        self: Arc<Self>,
        file: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            // A file already on disk needs no transfer, unless a head node
            // is configured and may hold a newer copy.
            let exists = self.inventory.stat_file(&file).await.is_ok();
            if exists && self.head.is_none() {
                return Ok(());
            }

            if self.transfers.read().await.contains_key(&file) {
                return Err(MeshError::InFlight(file));
            }

            let inquiry = self.collect_info(&file).await?;
            if inquiry.is_empty() {
                return Err(MeshError::NotFound(file));
            }

            let mut started: HashSet<String> = HashSet::new();

            for ack in inquiry.messages().to_vec() {
                if ack.glob.is_empty() {
                    if started.contains(&ack.filename) {
                        continue;
                    }
                    let local_digest = self.hash_index.get(&ack.filename).await;
                    match inquiry.select(
                        &ack.filename,
                        local_digest.as_deref(),
                        exists,
                        self.transport.as_ref(),
                    ) {
                        Selection::Local => {
                            info!("local file {} has the correct digest", ack.filename);
                        }
                        Selection::Unusable => {
                            error!("unable to determine where to get {} from", ack.filename);
                        }
                        Selection::Remote(src) => {
                            info!(
                                "found file {} on node {} with {} parts",
                                src.filename, src.from, src.parts
                            );
                            if self.clone().begin_transfer(&src).await? {
                                started.insert(src.filename);
                            }
                        }
                    }
                } else {
                    // fan out over the glob entries in random order to
                    // spread load across the mesh
                    let mut entries = ack.glob.clone();
                    entries.shuffle(&mut *self.rng.lock());

                    for entry in entries {
                        if started.contains(&entry) {
                            continue;
                        }
                        match self.clone().get_boxed(entry.clone()).await {
                            Ok(()) => {
                                started.insert(entry);
                            }
                            Err(MeshError::InFlight(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            Ok(())
        })
    }

    /// Register a transfer for `src` and spawn its part fetcher. Returns
    /// false when someone else registered the same file first.
    async fn begin_transfer(self: Arc<Self>, src: &Message) -> Result<bool> {
        let dir = self
            .inventory
            .base()
            .join(format!("{}{}", SCRATCH_PREFIX, Uuid::new_v4().simple()));
        fs::create_dir_all(&dir).await?;

        {
            let mut transfers = self.transfers.write().await;
            if transfers.contains_key(&src.filename) {
                drop(transfers);
                let _ = fs::remove_dir_all(&dir).await;
                return Ok(false);
            }
            transfers.insert(
                src.filename.clone(),
                Transfer {
                    dir,
                    filename: src.filename.clone(),
                    parts: HashSet::new(),
                    num_parts: src.parts,
                    inflight: -1,
                    queued: true,
                },
            );
        }

        let engine = self.clone();
        let src = src.clone();
        tokio::spawn(async move {
            engine.fetch_parts(src).await;
        });
        Ok(true)
    }

    /// Broadcast an Info request and gather ACKs until every recipient
    /// answered or the wait times out. A silent mesh yields an empty
    /// collector, not an error.
    pub async fn collect_info(&self, file: &str) -> Result<InfoCollector> {
        let (tid, mut rx) = self.registry.allocate();
        let request = Message::info_request(self.transport.local_name(), file, tid.id());
        let recipients = self.transport.broadcast(request).await?;
        debug!("sent info request for {} to {} nodes", file, recipients);

        let mut inquiry = InfoCollector::new(self.head.clone(), self.hash_index.enabled());
        for _ in 0..recipients {
            match timeout(self.timeout, rx.recv()).await {
                Ok(Some(resp)) => {
                    if resp.ack {
                        debug!("got info from {}", resp.from);
                        inquiry.add(resp);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("info request for {} timed out, using what arrived", file);
                    break;
                }
            }
        }

        Ok(inquiry)
    }

    /// Ask the mesh which peer can serve one part of a file. Diagnostic
    /// only; part fetching goes straight to the peer the Info ACK selected.
    pub async fn whohas(&self, file: &str, part: i64) -> Result<String> {
        let (tid, mut rx) = self.registry.allocate();
        let request = Message::whohas_request(self.transport.local_name(), file, part, tid.id());
        let recipients = self.transport.broadcast(request).await?;

        let mut timeouts = 0;
        for _ in 0..recipients {
            match timeout(self.timeout, rx.recv()).await {
                Ok(Some(resp)) => {
                    if resp.ack {
                        debug!("{} has {}:{}", resp.from, file, part);
                        return Ok(resp.from);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    timeouts += 1;
                    if timeouts == MAX_ATTEMPTS {
                        return Err(MeshError::Timeout);
                    }
                }
            }
        }

        Err(MeshError::NotFound(format!("{}:{}", file, part)))
    }

    /// Fetch every part of one registered transfer, then assemble it. The
    /// transfer record and its scratch directory are removed on all exits.
    async fn fetch_parts(self: Arc<Self>, src: Message) {
        if let Err(e) = self.run_transfer(&src).await {
            error!("transfer of {} failed: {}", src.filename, e);
        }
        self.destroy_transfer(&src.filename).await;
    }

    async fn run_transfer(&self, src: &Message) -> Result<()> {
        // corner case: a file with no parts is just created empty
        if src.parts == 0 {
            debug!("file {} has 0 parts, creating empty file", src.filename);
            let target = self.inventory.abs(&src.filename)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::File::create(&target).await?;
            fs::set_permissions(&target, std::fs::Permissions::from_mode(src.perm)).await?;
            return Ok(());
        }

        // randomize the part order so simultaneous fetchers across the mesh
        // spread their requests instead of marching in lockstep
        let mut order: Vec<i64> = (0..src.parts).collect();
        order.shuffle(&mut *self.rng.lock());

        // get in line
        let _permit = self
            .queue
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MeshError::Transport(format!("admission queue closed: {}", e)))?;

        {
            let mut transfers = self.transfers.write().await;
            if let Some(t) = transfers.get_mut(&src.filename) {
                t.queued = false;
            }
        }

        'parts: for p in order {
            for attempt in 0..MAX_ATTEMPTS {
                debug!(
                    "transferring part {}:{} attempt {}",
                    src.filename, p, attempt
                );
                match self.fetch_part(src, p).await {
                    Ok(()) => continue 'parts,
                    Err(e) => {
                        warn!("get part {}:{} failed: {}", src.filename, p, e);
                        if attempt > 0 {
                            // repeated failures usually mean heavy traffic,
                            // wait for things to calm down
                            sleep(self.timeout).await;
                        }
                    }
                }
            }

            // the snoop cache may have filled the part in the meantime
            let satisfied = self
                .transfers
                .read()
                .await
                .get(&src.filename)
                .map(|t| t.parts.contains(&p))
                .unwrap_or(false);
            if !satisfied {
                return Err(MeshError::PartExhausted(
                    src.filename.clone(),
                    p,
                    MAX_ATTEMPTS,
                ));
            }
        }

        info!("got all parts for {}", src.filename);
        self.assemble(src).await
    }

    /// Fetch one part unless it is already complete, and write it to the
    /// scratch directory. The in-flight marker keeps the snoop cache away
    /// from the part while its response is pending.
    async fn fetch_part(&self, src: &Message, part: i64) -> Result<()> {
        {
            let mut transfers = self.transfers.write().await;
            let t = transfers
                .get_mut(&src.filename)
                .ok_or_else(|| MeshError::NotFound(format!("transfer record for {}", src.filename)))?;
            if t.parts.contains(&part) {
                debug!("part {}:{} already satisfied", src.filename, part);
                return Ok(());
            }
            t.inflight = part;
        }

        let fetched = self.xfer(&src.from, &src.filename, part).await;

        let _drain = self.drain.read().await;
        let mut transfers = self.transfers.write().await;
        let t = transfers
            .get_mut(&src.filename)
            .ok_or_else(|| MeshError::NotFound(format!("transfer record for {}", src.filename)))?;
        t.inflight = -1;

        let data = fetched?;
        let path = part_path(&t.dir, &t.filename, part);
        write_part_file(&path, &data).await?;
        t.parts.insert(part);
        Ok(())
    }

    /// Request one part from a specific peer and wait for its response.
    pub async fn xfer(&self, peer: &str, file: &str, part: i64) -> Result<Vec<u8>> {
        let (tid, mut rx) = self.registry.allocate();
        let request = Message::xfer_request(self.transport.local_name(), file, part, tid.id());
        self.transport.send(peer, request).await?;

        match timeout(self.timeout, rx.recv()).await {
            Ok(Some(resp)) => {
                if resp.ack {
                    debug!("got part {}:{} from {}", file, part, resp.from);
                    Ok(resp.data)
                } else {
                    Err(MeshError::Nack(resp.from))
                }
            }
            Ok(None) => Err(MeshError::Timeout),
            Err(_) => Err(MeshError::Timeout),
        }
    }

    /// Concatenate the part files in ascending order into a staging file,
    /// then move it atomically to its target path and apply the declared
    /// permissions.
    async fn assemble(&self, src: &Message) -> Result<()> {
        let (dir, filename) = {
            let transfers = self.transfers.read().await;
            let t = transfers
                .get(&src.filename)
                .ok_or_else(|| MeshError::NotFound(format!("transfer record for {}", src.filename)))?;
            (t.dir.clone(), t.filename.clone())
        };

        let staging = dir.join(format!("cat_{}", Uuid::new_v4().simple()));
        let mut out = fs::File::create(&staging)
            .await
            .map_err(|e| MeshError::AssemblyFailed(e.to_string()))?;

        for part in 0..src.parts {
            let path = part_path(&dir, &filename, part);
            let mut fpart = fs::File::open(&path)
                .await
                .map_err(|e| MeshError::AssemblyFailed(format!("{}: {}", path.display(), e)))?;
            tokio::io::copy(&mut fpart, &mut out)
                .await
                .map_err(|e| MeshError::AssemblyFailed(e.to_string()))?;
        }
        out.flush()
            .await
            .map_err(|e| MeshError::AssemblyFailed(e.to_string()))?;
        drop(out);

        let target = self.inventory.abs(&filename)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MeshError::AssemblyFailed(e.to_string()))?;
        }
        fs::rename(&staging, &target)
            .await
            .map_err(|e| MeshError::AssemblyFailed(e.to_string()))?;

        debug!("changing permissions: {} {:o}", target.display(), src.perm);
        fs::set_permissions(&target, std::fs::Permissions::from_mode(src.perm))
            .await
            .map_err(|e| MeshError::AssemblyFailed(e.to_string()))?;
        Ok(())
    }

    /// Remove a transfer's scratch directory and unregister it. The drain
    /// lock keeps part writers out of the directory while it disappears.
    async fn destroy_transfer(&self, filename: &str) {
        let dir = self
            .transfers
            .read()
            .await
            .get(filename)
            .map(|t| t.dir.clone());
        let dir = match dir {
            Some(d) => d,
            None => {
                error!("could not access transfer record for {}", filename);
                return;
            }
        };

        let _drain = self.drain.write().await;
        if let Err(e) = fs::remove_dir_all(&dir).await {
            error!("removing scratch dir {} failed: {}", dir.display(), e);
        }
        self.transfers.write().await.remove(filename);
    }

    /// Deep snapshot of all live transfers.
    pub async fn status(&self) -> Vec<TransferStatus> {
        let transfers = self.transfers.read().await;
        transfers
            .values()
            .map(|t| {
                let mut completed: Vec<i64> = t.parts.iter().copied().collect();
                completed.sort_unstable();
                TransferStatus {
                    filename: t.filename.clone(),
                    num_parts: t.num_parts,
                    completed,
                    inflight: t.inflight,
                    queued: t.queued,
                }
            })
            .collect()
    }
}
