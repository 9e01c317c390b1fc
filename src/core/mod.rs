pub mod config;
pub mod protocol;
pub mod service;

pub use config::Config;
pub use protocol::{
    part_count, Message, MessageKind, MAX_ATTEMPTS, PART_SIZE, QUEUE_LEN, TIMEOUT,
};
pub use service::FileService;
