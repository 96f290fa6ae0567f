//! Counter key construction.

use std::fmt;

/// Separator between the parts of a serialized [`RateKey`].
pub const KEY_DELIMITER: char = '/';

/// A key that uniquely identifies a counter.
///
/// Serializes as `prefix/identity/scope`. Callers whose identities or scopes
/// may contain the delimiter must encode them first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey<'a> {
    /// Namespace shared by every key of one limiter
    pub prefix: &'a str,
    /// Who is being limited
    pub identity: &'a str,
    /// What is being limited
    pub scope: &'a str,
}

impl<'a> RateKey<'a> {
    /// Create a new key.
    pub fn new(prefix: &'a str, identity: &'a str, scope: &'a str) -> Self {
        Self {
            prefix,
            identity,
            scope,
        }
    }

    /// The string used to address the backend.
    pub fn to_string_key(&self) -> String {
        let mut key =
            String::with_capacity(self.prefix.len() + self.identity.len() + self.scope.len() + 2);
        key.push_str(self.prefix);
        key.push(KEY_DELIMITER);
        key.push_str(self.identity);
        key.push(KEY_DELIMITER);
        key.push_str(self.scope);
        key
    }
}

impl fmt::Display for RateKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{d}{}{d}{}",
            self.prefix,
            self.identity,
            self.scope,
            d = KEY_DELIMITER
        )
    }
}
