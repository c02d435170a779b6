pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod store;

pub use error::WatchpostError;
