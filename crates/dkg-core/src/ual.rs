//! Uniform Asset Locators and on-chain identifiers
//!
//! A UAL is the stable external name of a Knowledge Asset:
//! `did:dkg:{network}/{contract}/{token_id}` where `network` is either a bare
//! blockchain name (`base`) or a name with chain id (`base:84532`).
//! The textual form is case-sensitive and always lowercase, so parsing a
//! formatted UAL yields the same string back.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scheme prefix shared by every UAL
pub const UAL_SCHEME: &str = "did:dkg";

/// Numeric token id of a Knowledge Asset within its contract
pub type TokenId = u64;

/// A 20-byte account or contract address, stored as lowercase `0x` hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse an address, accepting any hex casing
    pub fn parse(value: &str) -> Result<Self> {
        let hex_part = value
            .strip_prefix("0x")
            .ok_or_else(|| Error::InvalidInput(format!("address '{}' must start with 0x", value)))?;

        if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!(
                "address '{}' must be 40 hex characters after 0x",
                value
            )));
        }

        Ok(Self(format!("0x{}", hex_part.to_ascii_lowercase())))
    }

    /// The all-zero address, used by chains to mark burned or missing tokens
    pub fn zero() -> Self {
        Self(format!("0x{}", "0".repeat(40)))
    }

    pub fn is_zero(&self) -> bool {
        self.0[2..].chars().all(|c| c == '0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Uniform Asset Locator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ual {
    blockchain: String,
    chain_id: Option<u64>,
    contract: Address,
    token_id: TokenId,
}

impl Ual {
    /// Build a UAL for a freshly minted token
    ///
    /// `network` may be `name` or `name:chain_id`.
    pub fn new(network: &str, contract: Address, token_id: TokenId) -> Result<Self> {
        let (blockchain, chain_id) = parse_network(network, network)?;
        Ok(Self {
            blockchain,
            chain_id,
            contract,
            token_id,
        })
    }

    /// Parse the textual form strictly (case-sensitive, no whitespace)
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidUal {
            ual: value.to_string(),
            reason: reason.to_string(),
        };

        if value.is_empty() {
            return Err(invalid("UAL must be a non-empty string"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(invalid("UAL must not contain whitespace"));
        }

        let rest = value
            .strip_prefix(UAL_SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| invalid("expected 'did:dkg:' prefix"))?;

        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 3 {
            return Err(invalid("expected {network}/{contract}/{token_id}"));
        }

        let (blockchain, chain_id) = parse_network(parts[0], value)?;

        if parts[1] != parts[1].to_ascii_lowercase() {
            return Err(invalid("contract address must be lowercase"));
        }
        let contract = Address::parse(parts[1]).map_err(|e| invalid(&e.to_string()))?;

        if parts[2].is_empty() || !parts[2].chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("token id must be a decimal number"));
        }
        let token_id = parts[2]
            .parse::<TokenId>()
            .map_err(|_| invalid("token id out of range"))?;

        Ok(Self {
            blockchain,
            chain_id,
            contract,
            token_id,
        })
    }

    /// Blockchain name without chain id
    pub fn blockchain(&self) -> &str {
        &self.blockchain
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.chain_id
    }

    /// Network segment as written in the UAL
    pub fn network(&self) -> String {
        match self.chain_id {
            Some(id) => format!("{}:{}", self.blockchain, id),
            None => self.blockchain.clone(),
        }
    }

    pub fn contract(&self) -> &Address {
        &self.contract
    }

    pub fn token_id(&self) -> TokenId {
        self.token_id
    }

    /// Check that this UAL belongs to the given network and asset contract
    ///
    /// A UAL without chain id matches any chain id of the same blockchain.
    pub fn validate_for(&self, network: &str, contract: &Address) -> Result<()> {
        let (blockchain, chain_id) = parse_network(network, network)?;

        if self.blockchain != blockchain {
            return Err(Error::InvalidUal {
                ual: self.to_string(),
                reason: format!(
                    "blockchain '{}' does not match configured '{}'",
                    self.blockchain, blockchain
                ),
            });
        }

        if let (Some(ours), Some(expected)) = (self.chain_id, chain_id) {
            if ours != expected {
                return Err(Error::InvalidUal {
                    ual: self.to_string(),
                    reason: format!("chain id {} does not match configured {}", ours, expected),
                });
            }
        }

        if &self.contract != contract {
            return Err(Error::InvalidUal {
                ual: self.to_string(),
                reason: format!("contract {} does not match configured {}", self.contract, contract),
            });
        }

        Ok(())
    }
}

fn parse_network(network: &str, source: &str) -> Result<(String, Option<u64>)> {
    let invalid = |reason: &str| Error::InvalidUal {
        ual: source.to_string(),
        reason: reason.to_string(),
    };

    let mut segments = network.split(':');
    let name = segments.next().unwrap_or_default();
    let chain_id = segments.next();

    if segments.next().is_some() {
        return Err(invalid("network must be 'name' or 'name:chain_id'"));
    }
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(invalid("blockchain name must be lowercase alphanumeric"));
    }

    let chain_id = match chain_id {
        Some(id) if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) => Some(
            id.parse::<u64>()
                .map_err(|_| invalid("chain id out of range"))?,
        ),
        Some(_) => return Err(invalid("chain id must be a decimal number")),
        None => None,
    };

    Ok((name.to_string(), chain_id))
}

impl fmt::Display for Ual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            UAL_SCHEME,
            self.network(),
            self.contract,
            self.token_id
        )
    }
}

impl FromStr for Ual {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Ual {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Ual> for String {
    fn from(ual: Ual) -> Self {
        ual.to_string()
    }
}
