use serde::Deserialize;
use std::fmt;

/// Wrapper for shared secrets (webhook auth tokens) that never prints its value.
#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    #[cfg(test)]
    pub fn new(s: impl Into<String>) -> Self {
        SecretString(s.into())
    }

    /// Compares against a presented credential without short-circuiting on
    /// the first differing byte.
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }
        expected
            .iter()
            .zip(candidate)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_output() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{}", secret), "<REDACTED, length 7>");
        assert_eq!(format!("{:?}", secret), "<REDACTED, length 7>");
        assert!(secret.matches("hunter2"));
    }

    #[test]
    fn test_matches() {
        let secret = SecretString::new("Bearer abc");
        assert!(secret.matches("Bearer abc"));
        assert!(!secret.matches("Bearer abd"));
        assert!(!secret.matches("Bearer ab"));
        assert!(!secret.matches(""));
    }
}
