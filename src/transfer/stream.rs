use log::{debug, error};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::core::Message;
use crate::transfer::downloader::Downloader;

/// Stream a local file as part-sized chunks without copying it anywhere.
pub(crate) fn stream_local(path: PathBuf, part_size: u64) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                error!("streaming {} failed: {}", path.display(), e);
                return;
            }
        };

        loop {
            let mut chunk = vec![0u8; part_size as usize];
            let mut filled = 0;
            // reads may come back short of a full part
            while filled < chunk.len() {
                match file.read(&mut chunk[filled..]).await {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        error!("streaming {} failed: {}", path.display(), e);
                        return;
                    }
                }
            }

            if filled == 0 {
                return;
            }
            let done = filled < chunk.len();
            chunk.truncate(filled);
            if tx.send(chunk).await.is_err() || done {
                return;
            }
        }
    });

    rx
}

/// Stream a remote file by requesting its parts in order under one admission
/// slot. Nothing lands on the local disk; any error truncates the stream.
pub(crate) fn stream_remote(engine: Arc<Downloader>, src: Message) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        debug!(
            "streaming {} from node {} with {} parts",
            src.filename, src.from, src.parts
        );

        // get in line
        let _permit = match engine.queue().clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        for part in 0..src.parts {
            match engine.xfer(&src.from, &src.filename, part).await {
                Ok(data) => {
                    if tx.send(data).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("stream of {} failed at part {}: {}", src.filename, part, e);
                    return;
                }
            }
        }
    });

    rx
}
