use serde::{Deserialize, Serialize};

/// Default balance granted to generated ganache accounts: 100 ETH in wei.
pub const DEFAULT_ACCOUNT_BALANCE: u128 = 100_000_000_000_000_000_000;

/// A pre-funded account provisioned for a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// `0x`-prefixed 40-hex-character address.
    pub address: String,
    /// Balance in wei at provisioning time.
    pub balance: u128,
    /// Private key as 64 hex characters, when known (ganache only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priv_key: Option<String>,
}

impl Account {
    /// Account with a known address and no private key (geth keystore).
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            balance: 0,
            priv_key: None,
        }
    }

    /// Check the `0x` + 40 lowercase/uppercase hex shape of an address.
    pub fn is_valid_address(address: &str) -> bool {
        address.len() == 42
            && address.starts_with("0x")
            && address[2..].chars().all(|c| c.is_ascii_hexdigit())
    }
}
