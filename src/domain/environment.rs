//! Target network identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named target network (e.g. `testnet`, `mainnet`).
///
/// The name is embedded in checkpoint and archive file names, so it is
/// restricted to ASCII alphanumerics plus `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Environment(String);

impl Environment {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidEnvironment> {
        let name = name.into();
        if name.is_empty() || name.starts_with('.') {
            return Err(InvalidEnvironment(name));
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(InvalidEnvironment(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Environment {
    type Err = InvalidEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Environment {
    type Error = InvalidEnvironment;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Environment> for String {
    fn from(env: Environment) -> Self {
        env.0
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid environment name '{0}' (use letters, digits, '-', '_' or '.')")]
pub struct InvalidEnvironment(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert_eq!(Environment::new("testnet").unwrap().as_str(), "testnet");
        assert!(Environment::new("hedera-mainnet_2").is_ok());
        assert!(Environment::new("local.dev").is_ok());
    }

    #[test]
    fn test_rejects_path_like_names() {
        assert!(Environment::new("").is_err());
        assert!(Environment::new("../mainnet").is_err());
        assert!(Environment::new("main net").is_err());
        assert!(Environment::new(".hidden").is_err());
    }
}
