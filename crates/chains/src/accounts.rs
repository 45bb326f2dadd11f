//! Account provisioning.
//!
//! Geth accounts live in the chain's keystore and are created (or re-read)
//! with the `geth account` subcommands. Ganache accounts are declared on the
//! command line with private keys derived deterministically, so the same
//! account set appears on every launch.

use crate::error::ChainError;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest as Sha3Digest, Keccak256};
use std::path::Path;
use std::process::Stdio;
use testchain_types::{Account, DEFAULT_ACCOUNT_BALANCE};
use tokio::process::Command;
use tracing::debug;

/// Seed prefix for deterministic ganache keys.
const GANACHE_KEY_SEED: &str = "testchain/ganache/account";

/// Create `count` fresh accounts in an empty geth data directory.
///
/// Index 0 becomes the coinbase. The password file is shared by all
/// accounts so they can be unlocked at launch.
pub async fn create_geth_accounts(
    executable: &Path,
    db_path: &Path,
    password_file: &Path,
    count: u32,
) -> Result<Vec<Account>, ChainError> {
    let mut accounts = Vec::with_capacity(count as usize);
    for index in 0..count {
        let output = Command::new(executable)
            .arg("account")
            .arg("new")
            .arg("--datadir")
            .arg(db_path)
            .arg("--password")
            .arg(password_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(ChainError::StartFailure(format!(
                "geth account new failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let address = parse_addresses(&text).into_iter().next().ok_or_else(|| {
            ChainError::StartFailure(format!("no address in geth account new output: {text}"))
        })?;
        debug!(index, %address, "created geth account");
        accounts.push(Account::from_address(address));
    }
    Ok(accounts)
}

/// Re-read the accounts of an existing geth data directory, in keystore
/// order.
pub async fn list_geth_accounts(
    executable: &Path,
    db_path: &Path,
) -> Result<Vec<Account>, ChainError> {
    let output = Command::new(executable)
        .arg("account")
        .arg("list")
        .arg("--datadir")
        .arg(db_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        return Err(ChainError::StartFailure(format!(
            "geth account list failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_addresses(&text)
        .into_iter()
        .map(Account::from_address)
        .collect())
}

/// Whether a geth data directory already holds keys.
pub fn has_keystore(db_path: &Path) -> bool {
    let keystore = db_path.join("keystore");
    match std::fs::read_dir(keystore) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

/// Deterministic ganache accounts, one per index, with the default balance.
pub fn ganache_accounts(count: u32) -> Vec<Account> {
    (0..count)
        .map(|index| {
            let key = derive_private_key(index);
            let address = address_for_key(&key);
            Account {
                address,
                balance: DEFAULT_ACCOUNT_BALANCE,
                priv_key: Some(hex::encode(key.secret_bytes())),
            }
        })
        .collect()
}

/// Pull `{40-hex}` substrings (geth's keystore listing format) and bare
/// `0x`-prefixed addresses out of geth CLI output, in order of appearance.
fn parse_addresses(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if is_hex40(&text[i + 1..]) && bytes.get(i + 41) == Some(&b'}') => {
                found.push(format!("0x{}", text[i + 1..i + 41].to_lowercase()));
                i += 42;
            }
            b'0' if text[i..].len() >= 42
                && text[i..].starts_with("0x")
                && is_hex40(&text[i + 2..])
                && !bytes.get(i + 42).is_some_and(u8::is_ascii_hexdigit) =>
            {
                found.push(format!("0x{}", text[i + 2..i + 42].to_lowercase()));
                i += 42;
            }
            _ => i += 1,
        }
    }
    found
}

fn is_hex40(s: &str) -> bool {
    s.len() >= 40 && s.as_bytes()[..40].iter().all(u8::is_ascii_hexdigit)
}

fn derive_private_key(index: u32) -> SecretKey {
    // A hash of the fixed seed is a valid scalar for any realistic input,
    // but salt and retry rather than panic on the astronomical exception.
    let mut salt = 0u32;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(GANACHE_KEY_SEED.as_bytes());
        hasher.update(index.to_be_bytes());
        hasher.update(salt.to_be_bytes());
        if let Ok(key) = SecretKey::from_slice(&hasher.finalize()) {
            return key;
        }
        salt += 1;
    }
}

fn address_for_key(key: &SecretKey) -> String {
    let public = PublicKey::from_secret_key(SECP256K1, key);
    let uncompressed = public.serialize_uncompressed();
    let digest = Keccak256::digest(&uncompressed[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_brace_addresses_in_order() {
        let listing = "\
Account #0: {7f0d31ef57cfdd1aba302f5fb44cf84f9f80c08d} keystore:///tmp/chains/1/keystore/UTC--a
Account #1: {91bd4b2b5d675977bd52be0d4a1d383a6f2329ab} keystore:///tmp/chains/1/keystore/UTC--b
";
        let parsed = parse_addresses(listing);
        assert_eq!(
            parsed,
            vec![
                "0x7f0d31ef57cfdd1aba302f5fb44cf84f9f80c08d",
                "0x91bd4b2b5d675977bd52be0d4a1d383a6f2329ab",
            ]
        );
    }

    #[test]
    fn parses_modern_account_new_output() {
        let output = "\
Your new key was generated

Public address of the key:   0x8A3F2E1B09C54Dd27E5a54fEa6FF80ab58D0f1c3
Path of the secret key file: /tmp/chains/1/keystore/UTC--c
";
        let parsed = parse_addresses(output);
        assert_eq!(parsed, vec!["0x8a3f2e1b09c54dd27e5a54fea6ff80ab58d0f1c3"]);
    }

    #[test]
    fn ignores_non_address_noise() {
        assert!(parse_addresses("no accounts here {tooshort} 0x123").is_empty());
        // A 64-hex private key is not an address.
        assert!(parse_addresses(
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
        )
        .is_empty());
    }

    #[test]
    fn ganache_accounts_are_deterministic() {
        let first = ganache_accounts(3);
        let second = ganache_accounts(3);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn ganache_accounts_are_distinct_and_well_formed() {
        let accounts = ganache_accounts(4);
        for account in &accounts {
            assert!(Account::is_valid_address(&account.address), "{}", account.address);
            assert_eq!(account.balance, DEFAULT_ACCOUNT_BALANCE);
            assert_eq!(account.priv_key.as_ref().unwrap().len(), 64);
        }
        let mut addresses: Vec<_> = accounts.iter().map(|a| &a.address).collect();
        addresses.dedup();
        assert_eq!(addresses.len(), 4);
    }

    #[test]
    fn keystore_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_keystore(dir.path()));
        std::fs::create_dir_all(dir.path().join("keystore")).unwrap();
        assert!(!has_keystore(dir.path()));
        std::fs::write(dir.path().join("keystore/UTC--key"), "k").unwrap();
        assert!(has_keystore(dir.path()));
    }
}
