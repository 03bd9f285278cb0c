//! Cookies
//!
//! A cookie is a 16-byte random token identifying one direction of a
//! signaling stream. Each peer relationship carries a [`CookiePair`]; the
//! two cookies of a pair must never be equal.

use rand::RngCore;

use crate::error::ValidationError;

/// Cookie length in bytes
pub const COOKIE_LEN: usize = 16;

/// A 16-byte random cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie([u8; COOKIE_LEN]);

impl Cookie {
    /// Generate a random cookie
    pub fn random() -> Self {
        let mut bytes = [0u8; COOKIE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Generate a random cookie guaranteed to differ from `other`
    pub fn random_distinct_from(other: &Cookie) -> Self {
        loop {
            let cookie = Self::random();
            if cookie != *other {
                return cookie;
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let bytes: [u8; COOKIE_LEN] = bytes.try_into().map_err(|_| ValidationError::ByteLength {
            field: "cookie",
            expected: COOKIE_LEN,
            got: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LEN] {
        &self.0
    }
}

impl From<[u8; COOKIE_LEN]> for Cookie {
    fn from(bytes: [u8; COOKIE_LEN]) -> Self {
        Self(bytes)
    }
}

/// Our cookie and the peer's cookie for one relationship
///
/// `theirs` stays unset until the peer's first message pins it.
#[derive(Debug, Clone)]
pub struct CookiePair {
    pub ours: Cookie,
    pub theirs: Option<Cookie>,
}

impl CookiePair {
    /// Create a pair with a fresh random cookie of our own
    pub fn new() -> Self {
        Self {
            ours: Cookie::random(),
            theirs: None,
        }
    }

    /// Create a pair from a known peer cookie, drawing our own distinct one
    pub fn from_theirs(theirs: Cookie) -> Self {
        Self {
            ours: Cookie::random_distinct_from(&theirs),
            theirs: Some(theirs),
        }
    }
}

impl Default for CookiePair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_cookies_differ() {
        // Collisions are possible in principle, not in 16 random bytes
        assert_ne!(Cookie::random(), Cookie::random());
    }

    #[test]
    fn test_from_bytes_length() {
        assert!(Cookie::from_bytes(&[1u8; COOKIE_LEN]).is_ok());
        assert!(matches!(
            Cookie::from_bytes(&[1u8; 15]),
            Err(ValidationError::ByteLength {
                field: "cookie",
                expected: 16,
                got: 15,
            })
        ));
    }

    #[test]
    fn test_pair_from_theirs_is_distinct() {
        let theirs = Cookie::random();
        let pair = CookiePair::from_theirs(theirs.clone());
        assert_ne!(pair.ours, theirs);
        assert_eq!(pair.theirs, Some(theirs));
    }

    #[test]
    fn test_random_distinct_from() {
        let cookie = Cookie::random();
        for _ in 0..8 {
            assert_ne!(Cookie::random_distinct_from(&cookie), cookie);
        }
    }
}
