//! Remote deployment agent
//!
//! Serves ping, compare, download, deploy, bootstrap and history for any
//! number of registered databases. Every call is authenticated with an API
//! key, rate limited per client and written to the audit log; deployments
//! and their migrations are kept in the metadata store.
//!
//! ```rust,no_run
//! use schemaguard::agent;
//! use schemaguard::config::AgentConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     agent::run(&AgentConfig::load()?)?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod auth;
pub mod error;
pub mod protocol;
pub mod rate_limit;
pub mod server;
pub mod service;
pub mod target;

pub use error::AgentError;
pub use rate_limit::RateLimiter;
pub use server::{build_agent, route, run, serve, AgentService, Headers, HttpReply};
pub use service::{Agent, AgentSettings, Reply};
pub use target::{PgTargets, TargetConnector, TargetSession};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
