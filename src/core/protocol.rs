use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::Result;

/// Size of one file part. Fixed per deployment; every node on the mesh must
/// agree on this value, it is never carried in messages.
pub const PART_SIZE: u64 = 10 * 1024 * 1024;

/// How many times a single part is requested before the transfer is abandoned.
pub const MAX_ATTEMPTS: usize = 3;

/// Depth of the admission queue bounding concurrent part transfers per node.
pub const QUEUE_LEN: usize = 3;

/// How long a requester waits for any single response.
pub const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Locate a file, directory, or glob on the mesh.
    Info,
    /// Ask which peers can serve one part of a file. Diagnostic only.
    WhoHas,
    /// Request one part of a file from a specific peer.
    Xfer,
    /// Reply to any of the above, matched to the requester by TID.
    Response,
}

/// The protocol envelope exchanged between nodes. Transports carry it as an
/// opaque value; `encode`/`decode` give a lossless byte representation for
/// transports that need one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Name of the originating node.
    pub from: String,
    pub kind: MessageKind,
    /// Target path, relative to the serving node's base directory.
    pub filename: String,
    /// 0-based part index. Meaningful for Xfer requests and part responses.
    pub part: i64,
    /// Total part count of the file. Meaningful in Info and Xfer responses.
    pub parts: i64,
    /// Unix permission bits of the file.
    pub perm: u32,
    /// Positive or negative acknowledgement on responses.
    pub ack: bool,
    /// Matching relative paths when the request resolved to several files.
    /// Order is preserved round-trip.
    pub glob: Vec<String>,
    /// Hex SHA-256 content digest, when the serving node has one.
    pub digest: Option<String>,
    /// Part payload on successful Xfer responses.
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    /// Transfer identifier, echoed verbatim in every response.
    pub tid: i64,
}

impl Message {
    fn new(from: &str, kind: MessageKind, filename: &str, tid: i64) -> Self {
        Self {
            from: from.to_string(),
            kind,
            filename: filename.to_string(),
            part: 0,
            parts: 0,
            perm: 0,
            ack: false,
            glob: Vec::new(),
            digest: None,
            data: Vec::new(),
            tid,
        }
    }

    pub fn info_request(from: &str, filename: &str, tid: i64) -> Self {
        Self::new(from, MessageKind::Info, filename, tid)
    }

    pub fn whohas_request(from: &str, filename: &str, part: i64, tid: i64) -> Self {
        let mut m = Self::new(from, MessageKind::WhoHas, filename, tid);
        m.part = part;
        m
    }

    pub fn xfer_request(from: &str, filename: &str, part: i64, tid: i64) -> Self {
        let mut m = Self::new(from, MessageKind::Xfer, filename, tid);
        m.part = part;
        m
    }

    /// Info reply for a single matching file.
    pub fn info_ack(
        from: &str,
        filename: &str,
        parts: i64,
        perm: u32,
        digest: Option<String>,
        tid: i64,
    ) -> Self {
        let mut m = Self::new(from, MessageKind::Response, filename, tid);
        m.ack = true;
        m.parts = parts;
        m.perm = perm;
        m.digest = digest;
        m
    }

    /// Info reply when the request resolved to several files.
    pub fn glob_ack(from: &str, filename: &str, glob: Vec<String>, tid: i64) -> Self {
        let mut m = Self::new(from, MessageKind::Response, filename, tid);
        m.ack = true;
        m.glob = glob;
        m
    }

    pub fn whohas_ack(from: &str, filename: &str, part: i64, tid: i64) -> Self {
        let mut m = Self::new(from, MessageKind::Response, filename, tid);
        m.ack = true;
        m.part = part;
        m
    }

    /// Xfer reply carrying one part payload.
    pub fn xfer_ack(
        from: &str,
        filename: &str,
        part: i64,
        parts: i64,
        perm: u32,
        data: Vec<u8>,
        tid: i64,
    ) -> Self {
        let mut m = Self::new(from, MessageKind::Response, filename, tid);
        m.ack = true;
        m.part = part;
        m.parts = parts;
        m.perm = perm;
        m.data = data;
        m
    }

    pub fn nack(from: &str, filename: &str, tid: i64) -> Self {
        Self::new(from, MessageKind::Response, filename, tid)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Number of parts a file of `size` bytes splits into. An empty file has
/// zero parts; the last part may be shorter than `part_size`.
pub fn part_count(size: u64, part_size: u64) -> i64 {
    ((size + part_size - 1) / part_size) as i64
}
