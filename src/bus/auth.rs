//! Link credential table.
//!
//! Loaded from configuration at init and immutable on the hot path; hot-add
//! exists for operational credential rotation but is rare.

use std::collections::HashMap;
use std::sync::RwLock;

pub struct CredentialTable {
    inner: RwLock<HashMap<String, String>>,
}

impl CredentialTable {
    pub fn new(credentials: &[(String, String)]) -> Self {
        Self {
            inner: RwLock::new(credentials.iter().cloned().collect()),
        }
    }

    pub fn add(&self, username: &str, password: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(username.to_owned(), password.to_owned());
    }

    /// Constant behavior for unknown users and wrong passwords: both are a
    /// plain rejection, the caller closes the link and does not retry.
    pub fn check(&self, username: &str, password: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(username)
            .is_some_and(|p| p == password)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_matches_loaded_pairs() {
        let table = CredentialTable::new(&[("edge".into(), "pw1".into())]);
        assert!(table.check("edge", "pw1"));
        assert!(!table.check("edge", "pw2"));
        assert!(!table.check("ghost", "pw1"));
    }

    #[test]
    fn hot_add_overwrites() {
        let table = CredentialTable::new(&[]);
        assert!(table.is_empty());
        table.add("svc", "old");
        table.add("svc", "new");
        assert!(!table.check("svc", "old"));
        assert!(table.check("svc", "new"));
        assert_eq!(table.len(), 1);
    }
}
