pub mod error;
pub mod logger;

pub use error::{MeshError, Result};
pub use logger::setup_logging;
