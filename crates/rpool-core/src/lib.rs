pub mod config;
pub mod error;
pub mod types;

pub use config::PoolConfig;
pub use error::{PoolError, PoolResult};
