//! Identity and access control for restricted waveform streams.
//!
//! An [`AccessControlList`] is built once from [`AccessRule`] rows and then
//! only read. Reloads build a fresh list and publish it through a
//! [`Snapshot`], so request handlers always see a complete rule set.

use thiserror::Error;

mod acl;
mod identity;
mod rules;
mod snapshot;
mod users;

pub use acl::{AccessControlList, AccessRule};
pub use identity::{Identity, IdentityProvider};
pub use rules::load_rules;
pub use snapshot::Snapshot;
pub use users::{hash_password, UserDb, UserEntry, UsersFile};

/// Errors raised while loading access rules or user records.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to read users file {path}: {source}")]
    UsersFileRead {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse users file {path}: {source}")]
    UsersFileParse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid access rule {id}: {reason}")]
    InvalidRule { id: i64, reason: String },
}
