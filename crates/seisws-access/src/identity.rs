use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// An authenticated caller as seen by the access control list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: Option<String>,
    pub groups: BTreeSet<String>,
    pub blacklisted: bool,
    /// Provider-specific attributes, carried for logging only.
    pub raw_claims: BTreeMap<String, String>,
}

impl Identity {
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// The name used for request tracking: the address, or the first group.
    pub fn display_name(&self) -> Option<&str> {
        self.email
            .as_deref()
            .or_else(|| self.groups.iter().next().map(String::as_str))
    }
}

/// Resolves credentials presented by a caller to an [`Identity`].
pub trait IdentityProvider: Send + Sync {
    /// Returns `None` when the credentials are unknown or wrong.
    fn authenticate(&self, username: &str, password: &str) -> Option<Identity>;
}
