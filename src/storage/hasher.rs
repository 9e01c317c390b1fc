use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;

use crate::storage::{HashUtils, Inventory};
use crate::utils::Result;

/// How often the base path is rescanned.
pub const HASH_INTERVAL: Duration = Duration::from_secs(60);

/// Content digests of local files, rebuilt periodically in the background.
/// Peers use the digests to decide whether a remote copy should supersede a
/// local one.
pub struct HashIndex {
    enabled: bool,
    hashes: RwLock<HashMap<String, String>>,
}

impl HashIndex {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            hashes: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn get(&self, rel: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.hashes.read().await.get(rel).cloned()
    }

    /// Walk the base path and swap in a fresh digest map. Files that fail to
    /// hash are skipped; readers keep the previous snapshot until the swap.
    pub async fn rescan(&self, inventory: &Inventory) -> Result<()> {
        let files = inventory.walk_files(inventory.base()).await?;
        let mut next = HashMap::with_capacity(files.len());

        for rel in files {
            let abs = match inventory.abs(&rel) {
                Ok(p) => p,
                Err(_) => continue,
            };
            match HashUtils::hash_file(&abs).await {
                Ok(digest) => {
                    next.insert(rel, digest);
                }
                Err(e) => warn!("hashing {} failed: {}", rel, e),
            }
        }

        debug!("hash index rebuilt with {} entries", next.len());
        *self.hashes.write().await = next;
        Ok(())
    }

    /// Rescan immediately, then every `HASH_INTERVAL`.
    pub fn spawn_scanner(index: Arc<Self>, inventory: Arc<Inventory>) {
        tokio::spawn(async move {
            let mut ticker = interval(HASH_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = index.rescan(&inventory).await {
                    warn!("hash rescan failed: {}", e);
                }
            }
        });
    }
}
