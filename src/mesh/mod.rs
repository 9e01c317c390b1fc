pub mod memory;
pub mod transport;

pub use memory::{MemoryHub, MemoryMesh};
pub use transport::MeshTransport;
