pub mod chain;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod llm;
pub mod node;
pub mod p2p;
pub mod proxy;
pub mod state;
pub mod utils;

pub use cli::Cli;
pub use config::NodeConfig;
pub use error::NodeError;
pub use node::{NodeManager, NodeManagerOptions};
pub use utils::logging::setup_logging;
