//! User records loaded from a TOML file.
//!
//! ```toml
//! blacklist = ["mallory"]
//!
//! [[users]]
//! name = "alice"
//! email = "alice@example.org"
//! groups = ["eida"]
//! salt = "3f9a"
//! password_sha256 = "<hex of sha256(salt + ':' + password)>"
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{AccessError, Identity, IdentityProvider};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsersFile {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub email: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub salt: String,
    pub password_sha256: String,
    #[serde(default)]
    pub claims: BTreeMap<String, String>,
}

/// Hex SHA-256 of `salt:password`.
pub fn hash_password(salt: &str, password: &str) -> String {
    hex::encode(Sha256::digest(format!("{salt}:{password}").as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Known users and the blacklist, keyed by login name.
#[derive(Debug, Default)]
pub struct UserDb {
    users: HashMap<String, UserEntry>,
    blacklist: HashSet<String>,
}

impl UserDb {
    pub fn from_users_file(file: UsersFile) -> Self {
        let blacklist: HashSet<String> = file.blacklist.into_iter().collect();
        let mut users = HashMap::with_capacity(file.users.len());
        for user in file.users {
            if blacklist.contains(&user.name) {
                tracing::info!(user = %user.name, "registering blacklisted user");
            }
            if users.insert(user.name.clone(), user).is_some() {
                tracing::warn!("duplicate user entry, keeping the last one");
            }
        }
        Self { users, blacklist }
    }

    pub fn parse(text: &str, path: &str) -> Result<Self, AccessError> {
        let file: UsersFile = toml::from_str(text).map_err(|source| AccessError::UsersFileParse {
            path: path.to_string(),
            source,
        })?;
        Ok(Self::from_users_file(file))
    }

    pub fn from_path(path: &Path) -> Result<Self, AccessError> {
        let shown = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| AccessError::UsersFileRead {
            path: shown.clone(),
            source,
        })?;
        let db = Self::parse(&text, &shown)?;
        tracing::info!(path = %shown, users = db.len(), "users loaded");
        Ok(db)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn blacklist_user(&mut self, name: &str) {
        tracing::info!(user = name, "blacklisting user");
        self.blacklist.insert(name.to_string());
    }

    /// The identity of a known user, without checking credentials.
    pub fn identity(&self, name: &str) -> Option<Identity> {
        let entry = self.users.get(name)?;
        let email = entry
            .email
            .clone()
            .or_else(|| name.contains('@').then(|| name.to_string()));
        let mut raw_claims = entry.claims.clone();
        raw_claims.insert("name".to_string(), name.to_string());

        Some(Identity {
            email,
            groups: entry.groups.iter().cloned().collect(),
            blacklisted: self.blacklist.contains(name),
            raw_claims,
        })
    }
}

impl IdentityProvider for UserDb {
    fn authenticate(&self, username: &str, password: &str) -> Option<Identity> {
        let entry = self.users.get(username)?;
        let presented = hash_password(&entry.salt, password);
        if !constant_time_eq(
            presented.as_bytes(),
            entry.password_sha256.to_ascii_lowercase().as_bytes(),
        ) {
            return None;
        }
        self.identity(username)
    }
}
