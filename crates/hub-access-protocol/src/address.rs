use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("wallet address must not be empty")]
    EmptyWalletAddress,

    #[error("hub id must not be empty")]
    EmptyHubId,

    #[error("unknown access status '{0}'")]
    UnknownStatus(String),
}

/// A wallet identity as sent by the client.
///
/// Equality and hashing use the lowercase key so `0xAbC` and `0xabc` name the
/// same wallet; `as_str` keeps the original casing for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress {
    display: String,
    key: String,
}

impl WalletAddress {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::EmptyWalletAddress);
        }

        Ok(Self {
            display: trimmed.to_string(),
            key: trimmed.to_ascii_lowercase(),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.display
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn matches(&self, other: &str) -> bool {
        self.key.eq_ignore_ascii_case(other.trim())
    }
}

impl PartialEq for WalletAddress {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for WalletAddress {}

impl std::hash::Hash for WalletAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.display
    }
}

pub fn validate_hub_id(raw: &str) -> Result<&str, ProtocolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyHubId);
    }
    Ok(trimmed)
}
