pub mod identity;

pub use identity::{default_state_dir, IdentityStore};
