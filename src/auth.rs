//! Authentication collaborator boundary.
//!
//! The engine never looks at credentials itself: it hands the mechanism name
//! and raw credential blob to an `Authenticator` and suspends that one
//! connection until the verdict arrives. Mechanism filtering happens before
//! this boundary — only mechanisms in the configured set are ever attempted.

use std::collections::HashMap;

use futures_util::future::BoxFuture;

use crate::error::EngineResult;

/// Validates credentials for one mechanism.
///
/// Returns `Ok(Some(identity))` when accepted (the identity becomes the
/// localpart of the bound address), `Ok(None)` when rejected, and `Err` only
/// for backend failures. Implementations may perform I/O; the engine awaits
/// the future without blocking other connections.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        mechanism: &'a str,
        credentials: &'a [u8],
    ) -> BoxFuture<'a, EngineResult<Option<String>>>;
}

/// Split a SASL PLAIN blob (`[authzid] NUL authcid NUL password`) into
/// authentication id and password. Returns `None` on a malformed blob.
pub fn parse_plain(credentials: &[u8]) -> Option<(String, String)> {
    let mut parts = credentials.split(|&b| b == 0);
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;
    if parts.next().is_some() || authcid.is_empty() {
        return None;
    }
    Some((
        String::from_utf8(authcid.to_vec()).ok()?,
        String::from_utf8(password.to_vec()).ok()?,
    ))
}

/// In-memory username/password backend validating SASL PLAIN.
///
/// The default backend for tests and single-process deployments; anything
/// real (database, LDAP) implements `Authenticator` instead.
#[derive(Debug, Default)]
pub struct MemoryAuthenticator {
    users: HashMap<String, String>,
}

impl MemoryAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

impl Authenticator for MemoryAuthenticator {
    fn authenticate<'a>(
        &'a self,
        mechanism: &'a str,
        credentials: &'a [u8],
    ) -> BoxFuture<'a, EngineResult<Option<String>>> {
        Box::pin(async move {
            if mechanism != "PLAIN" {
                return Ok(None);
            }
            let Some((username, password)) = parse_plain(credentials) else {
                return Ok(None);
            };
            match self.users.get(&username) {
                Some(stored) if stored == &password => Ok(Some(username)),
                _ => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_blob(user: &str, password: &str) -> Vec<u8> {
        let mut blob = vec![0u8];
        blob.extend_from_slice(user.as_bytes());
        blob.push(0);
        blob.extend_from_slice(password.as_bytes());
        blob
    }

    // --- parse_plain tests ---

    #[test]
    fn test_parse_plain_with_empty_authzid() {
        let (user, password) = parse_plain(&plain_blob("james", "sekret")).unwrap();
        assert_eq!(user, "james");
        assert_eq!(password, "sekret");
    }

    #[test]
    fn test_parse_plain_with_authzid() {
        let blob = b"admin\0james\0sekret";
        let (user, password) = parse_plain(blob).unwrap();
        assert_eq!(user, "james");
        assert_eq!(password, "sekret");
    }

    #[test]
    fn test_parse_plain_rejects_malformed_blobs() {
        assert!(parse_plain(b"no-separators").is_none());
        assert!(parse_plain(b"\0only-one\0").is_some()); // empty password is valid PLAIN
        assert!(parse_plain(b"\0\0password").is_none()); // empty authcid is not
        assert!(parse_plain(b"a\0b\0c\0d").is_none());
    }

    // --- MemoryAuthenticator tests ---

    #[tokio::test]
    async fn test_memory_authenticator_accepts_valid_credentials() {
        let auth = MemoryAuthenticator::new().with_user("james", "sekret");
        let identity = auth
            .authenticate("PLAIN", &plain_blob("james", "sekret"))
            .await
            .unwrap();
        assert_eq!(identity.as_deref(), Some("james"));
    }

    #[tokio::test]
    async fn test_memory_authenticator_rejects_wrong_password() {
        let auth = MemoryAuthenticator::new().with_user("james", "sekret");
        let identity = auth
            .authenticate("PLAIN", &plain_blob("james", "wrong"))
            .await
            .unwrap();
        assert_eq!(identity, None);
    }

    #[tokio::test]
    async fn test_memory_authenticator_rejects_unknown_user_and_mechanism() {
        let auth = MemoryAuthenticator::new().with_user("james", "sekret");
        assert_eq!(
            auth.authenticate("PLAIN", &plain_blob("nadia", "sekret"))
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            auth.authenticate("SCRAM-SHA-1", &plain_blob("james", "sekret"))
                .await
                .unwrap(),
            None
        );
    }
}
