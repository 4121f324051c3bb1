//! Connection pooling for `may_postgres` clients.

pub mod config;
pub mod manager;

pub use config::{DatabaseConfig, PoolSettings};
pub use manager::{ConnectionPool, PooledConnection};
