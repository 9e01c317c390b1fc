use log::{debug, warn};
use tokio::sync::RwLock;

use crate::core::{Message, MessageKind};
use crate::transfer::downloader::{part_path, write_part_file, TransferTable};

/// Inspect a response the local node is forwarding for someone else. When it
/// carries a part of a file this node is itself acquiring, keep a copy and
/// mark the part complete, saving a fetch. The part currently in flight is
/// left alone so the snoop never races its writer.
pub(crate) async fn snoop(drain: &RwLock<()>, transfers: &TransferTable, msg: &Message) {
    if msg.kind != MessageKind::Response || !msg.ack || msg.data.is_empty() {
        return;
    }

    let _drain = drain.read().await;
    let mut transfers = transfers.write().await;
    let t = match transfers.get_mut(&msg.filename) {
        Some(t) => t,
        None => return,
    };

    if t.inflight == msg.part || t.parts.contains(&msg.part) {
        return;
    }

    let path = part_path(&t.dir, &t.filename, msg.part);
    match write_part_file(&path, &msg.data).await {
        Ok(()) => {
            debug!("snooped part {}:{}", t.filename, msg.part);
            t.parts.insert(msg.part);
        }
        Err(e) => warn!(
            "writing snooped part {}:{} failed: {}",
            t.filename, msg.part, e
        ),
    }
}
