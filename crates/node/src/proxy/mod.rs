pub mod handler;
pub mod server;
pub mod usage;

pub use handler::{InferenceRequest, RequestHandler, RequestPolicy};
pub use server::{ProxyServer, REQUEST_ID_HEADER};
pub use usage::{UsageData, UsageSpan, UsageTracker};
