//! Credential pool for outbound generative calls.
//!
//! The pool is an explicitly constructed value owned by the session; there
//! is no process-global credential state. Rotation is circular and driven by
//! the request executor when a failure is tied to the active key.

/// Environment variable consulted when the user supplies no credentials.
pub const ENV_CREDENTIAL: &str = "GEMINI_API_KEY";

/// A prioritized, rotating list of API credentials.
#[derive(Debug, Clone, Default)]
pub struct CredentialPool {
    credentials: Vec<String>,
    active: usize,
}

impl CredentialPool {
    /// Build a pool from a user-supplied priority list. Blank entries are
    /// discarded; order is preserved.
    pub fn new(credentials: Vec<String>) -> Self {
        let credentials: Vec<String> = credentials
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        Self {
            credentials,
            active: 0,
        }
    }

    /// Build a pool from the user list, falling back to the deployment
    /// default in `GEMINI_API_KEY` when the list is empty.
    pub fn load(user_credentials: Vec<String>) -> Self {
        let pool = Self::new(user_credentials);
        if !pool.is_empty() {
            return pool;
        }
        match std::env::var(ENV_CREDENTIAL) {
            Ok(key) if !key.trim().is_empty() => Self::new(vec![key]),
            _ => Self::default(),
        }
    }

    /// The active credential, or `None` when the pool is empty.
    pub fn current(&self) -> Option<&str> {
        self.credentials.get(self.active).map(String::as_str)
    }

    /// Advance to the next credential, wrapping around. No-op when the pool
    /// holds one credential or fewer.
    pub fn rotate(&mut self) {
        if self.credentials.len() > 1 {
            self.active = (self.active + 1) % self.credentials.len();
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_entries_discarded() {
        let pool = CredentialPool::new(vec![
            "  ".to_string(),
            "key-a".to_string(),
            String::new(),
            "key-b".to_string(),
        ]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.current(), Some("key-a"));
    }

    #[test]
    fn test_rotation_is_circular() {
        let mut pool = CredentialPool::new(vec![
            "key-a".to_string(),
            "key-b".to_string(),
            "key-c".to_string(),
        ]);

        pool.rotate();
        assert_eq!(pool.current(), Some("key-b"));
        pool.rotate();
        assert_eq!(pool.current(), Some("key-c"));
        pool.rotate();
        assert_eq!(pool.current(), Some("key-a"));
    }

    #[test]
    fn test_rotation_noop_on_single_credential() {
        let mut pool = CredentialPool::new(vec!["only".to_string()]);
        pool.rotate();
        assert_eq!(pool.current(), Some("only"));
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = CredentialPool::new(Vec::new());
        assert!(pool.is_empty());
        assert_eq!(pool.current(), None);
        pool.rotate();
        assert_eq!(pool.current(), None);
    }
}
