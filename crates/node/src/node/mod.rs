pub mod manager;
pub mod status;

pub use manager::{NodeManager, NodeManagerOptions, DEFAULT_STATUS_INTERVAL};
pub use status::{StatusBoard, Subscription};
