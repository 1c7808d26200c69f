use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The opaque handle that ties a `start()` to its later `end()` or `cancel()`
///
/// Tokens are the string form of a random (v4) UUID so they are unique for
/// the lifetime of the process, and also across broker instances. Hosts
/// that carry the token around as a string can turn it back into a
/// `ContextToken` with `From<&str>`/`From<String>`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextToken(String);

impl ContextToken {
    pub(crate) fn generate() -> Self {
        ContextToken(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContextToken {
    fn from(s: String) -> Self {
        ContextToken(s)
    }
}
impl From<&str> for ContextToken {
    fn from(s: &str) -> Self {
        ContextToken(s.to_string())
    }
}

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl fmt::Debug for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ContextToken:{}", self.0)
    }
}

#[test]
fn token_two_way() {
    let token = ContextToken::generate();
    let string = token.to_string();
    assert!(Uuid::parse_str(&string).is_ok());
    assert_eq!(ContextToken::from(string.as_str()), token);
    assert_eq!(ContextToken::from(string), token);
}

#[test]
fn tokens_unique() {
    let tokens: std::collections::HashSet<ContextToken> =
        (0..1000).map(|_| ContextToken::generate()).collect();
    assert_eq!(tokens.len(), 1000);
}

#[test]
fn token_serializes_as_plain_string() {
    let token = ContextToken::generate();
    let json = serde_json::to_string(&token).unwrap();
    assert_eq!(json, format!("\"{}\"", token));
    assert_eq!(serde_json::from_str::<ContextToken>(&json).unwrap(), token);
}
