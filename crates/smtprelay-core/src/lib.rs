//! smtprelay core - multi-tenant SMTP relay engine
//!
//! This crate accepts inbound SMTP connections, resolves the owning
//! tenant per message, enforces tenant policy and rate limits, and
//! dispatches through one of two delivery backends (cloud mailbox API
//! or outbound SMTP relay).

pub mod cidr;
pub mod delivery;
pub mod ratelimit;
pub mod resolver;
pub mod smtp;
pub mod store;

pub use delivery::GraphClient;
pub use ratelimit::RateLimiter;
pub use resolver::{resolve, Resolution};
pub use smtp::SmtpServer;
pub use store::{ConfigStore, LoadedConfig, ReloadHandle};
