//! Request arbitration core for the Walletgate background process.
//!
//! Decides, for every inbound request from a connecting site, whether it
//! may see accounts, submit signing operations or register chain
//! metadata, and serializes those decisions against the out-of-process
//! approval UI.

pub mod arbiter;
pub mod config;
pub mod error;
pub mod model;
pub mod notify;
mod pending;

pub use arbiter::{Arbiter, AUTH_URLS_KEY, DEFAULT_AUTH_ACCOUNTS_KEY};
pub use config::{parse_config_str, ArbiterConfig, ConfigError};
pub use error::ArbiterError;
pub use model::{badge_text, AuthRecord, AuthorizePending, MetadataPending, SigningPending};
pub use notify::{
    InMemorySurface, NotificationChannel, NotificationMode, SurfaceDriver, SurfaceError, SurfaceId,
};
