pub mod config;
pub mod domain;
pub mod hash;
pub mod infrastructure;

pub use config::Config;
pub use hash::{HashError, QuickHash, QuickHashResult};
