//! Peer-to-peer file distribution over a best-effort message mesh.
//!
//! Every node serves a base directory. Files anywhere on the mesh are
//! located with broadcast Info queries and pulled in fixed-size parts in
//! randomized order, interleaved across peers; parts a node relays for
//! others are opportunistically cached. The mesh itself is a capability the
//! embedder provides through [`MeshTransport`].

pub mod core;
pub mod mesh;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export main types
pub use self::core::{
    Config, FileService, Message, MessageKind, MAX_ATTEMPTS, PART_SIZE, QUEUE_LEN, TIMEOUT,
};
pub use mesh::{MemoryHub, MemoryMesh, MeshTransport};
pub use transfer::TransferStatus;
pub use utils::{
    error::{MeshError, Result},
    setup_logging,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
