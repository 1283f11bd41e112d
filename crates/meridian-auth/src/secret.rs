//! Bootstrap-level shared secrets (register and operations tokens)

use sha2::{Digest, Sha256};

/// A configured shared secret, held only as its SHA-256 digest
#[derive(Clone)]
pub struct BootstrapSecret {
    digest: Option<[u8; 32]>,
}

impl BootstrapSecret {
    /// An empty secret matches nothing
    pub fn new(secret: &str) -> Self {
        let digest = if secret.is_empty() {
            None
        } else {
            Some(Sha256::digest(secret.as_bytes()).into())
        };
        Self { digest }
    }

    pub fn is_configured(&self) -> bool {
        self.digest.is_some()
    }

    /// Compare digests without early exit
    pub fn matches(&self, presented: &str) -> bool {
        let Some(expected) = self.digest else {
            return false;
        };
        let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        expected
            .iter()
            .zip(presented.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for BootstrapSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapSecret")
            .field("configured", &self.is_configured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        let secret = BootstrapSecret::new("aabbcc");
        assert!(secret.matches("aabbcc"));
        assert!(!secret.matches("aabbcd"));
        assert!(!secret.matches(""));
    }

    #[test]
    fn test_empty_secret_matches_nothing() {
        let secret = BootstrapSecret::new("");
        assert!(!secret.is_configured());
        assert!(!secret.matches(""));
    }

    #[test]
    fn test_debug_hides_value() {
        let secret = BootstrapSecret::new("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));
    }
}
