//! Deterministic connection identity.

use sha2::{Digest, Sha256};

/// Compute the stable identity of a connection from its `username@host:port`
/// triple. The same triple always yields the same id, so calling `connect`
/// twice with the same config returns the same [`crate::connection::Connection`].
pub fn connection_id(username: &str, host: &str, port: u16) -> String {
    let subject = format!("{username}@{host}:{port}");
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let a = connection_id("root", "example.com", 22);
        let b = connection_id("root", "example.com", 22);
        assert_eq!(a, b);
    }

    #[test]
    fn distinguishes_by_port() {
        let a = connection_id("root", "example.com", 22);
        let b = connection_id("root", "example.com", 2222);
        assert_ne!(a, b);
    }

    #[test]
    fn distinguishes_by_user() {
        let a = connection_id("root", "example.com", 22);
        let b = connection_id("admin", "example.com", 22);
        assert_ne!(a, b);
    }
}
