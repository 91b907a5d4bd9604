use std::{collections::BTreeSet, path::Path};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use color_eyre::eyre::{WrapErr, eyre};
use russh::keys::{
    HashAlg, PrivateKey, PublicKey, decode_secret_key, ssh_key::Fingerprint,
};
use tokio::fs;
use tracing::info;

// Base64-encoded alternatives to the key files, for deployments where
// mounting files is inconvenient.
pub(crate) const HOST_KEY_ENV: &str = "BURROW_HOST_KEY_B64";
pub(crate) const AUTHORIZED_KEYS_ENV: &str = "BURROW_AUTHORIZED_KEYS_B64";

// Allowlist of client public keys. Membership is tested by key fingerprint.
pub(crate) struct AuthorizedKeys {
    fingerprints: BTreeSet<Fingerprint>,
}

impl AuthorizedKeys {
    pub(crate) fn parse(contents: &str) -> color_eyre::Result<Self> {
        let mut fingerprints = BTreeSet::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let key = line
                .parse::<PublicKey>()
                .map_err(|error| eyre!("Error parsing authorized key: {error}"))?;
            fingerprints.insert(key.fingerprint(HashAlg::Sha256));
        }
        if fingerprints.is_empty() {
            return Err(eyre!("No authorized keys found"));
        }
        Ok(AuthorizedKeys { fingerprints })
    }

    pub(crate) fn is_authorized(&self, key: &PublicKey) -> bool {
        self.fingerprints.contains(&key.fingerprint(HashAlg::Sha256))
    }

    pub(crate) fn count(&self) -> usize {
        self.fingerprints.len()
    }
}

// Load the server host key, preferring the base64 environment variable over
// the key file.
pub(crate) async fn load_host_key(path: &Path) -> color_eyre::Result<PrivateKey> {
    let contents = match std::env::var(HOST_KEY_ENV) {
        Ok(encoded) => String::from_utf8(
            BASE64
                .decode(encoded.trim())
                .wrap_err("Error decoding host key from environment")?,
        )
        .wrap_err("Host key from environment is not valid UTF-8")?,
        Err(_) => fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("Error reading host key from {}", path.display()))?,
    };
    decode_secret_key(&contents, None).wrap_err("Error decoding host key")
}

pub(crate) async fn load_authorized_keys(path: &Path) -> color_eyre::Result<AuthorizedKeys> {
    let contents = match std::env::var(AUTHORIZED_KEYS_ENV) {
        Ok(encoded) => String::from_utf8(
            BASE64
                .decode(encoded.trim())
                .wrap_err("Error decoding authorized keys from environment")?,
        )
        .wrap_err("Authorized keys from environment are not valid UTF-8")?,
        Err(_) => fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("Error reading authorized keys from {}", path.display()))?,
    };
    let keys = AuthorizedKeys::parse(&contents)?;
    info!(count = keys.count(), "Loaded authorized keys.");
    Ok(keys)
}
