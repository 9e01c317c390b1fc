pub mod hash;
pub mod hasher;
pub mod inventory;

pub use hash::HashUtils;
pub use hasher::{HashIndex, HASH_INTERVAL};
pub use inventory::{is_pattern, Inventory, SCRATCH_PREFIX};
