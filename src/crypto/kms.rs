// This file is part of GridSQL.
//
// Copyright (C) 2022 The GridSQL Authors.
//
// GridSQL is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// GridSQL is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with GridSQL. If not, see <https://www.gnu.org/licenses/>.

//! Encrypted on-disk private key store.
//!
//! File layout, inside out: the serialized keypair is prefixed with the
//! double SHA-256 of its bytes, the whole is encrypted under the master key
//! and the result is wrapped in base58-check with a version byte. The loader
//! also accepts the legacy format where the encrypted payload is written to
//! the file as raw bytes.

use crate::{
    base::schema::NodeId,
    crypto::{
        cipher,
        ed25519::{KeyPair, PublicKey, KEYPAIR_BYTES_LEN},
        hash::double_sha256,
    },
    pow::Uint256,
    Error, ErrorKind, Result,
};
use std::fs;
use std::path::Path;

/// Key store format version byte.
pub const KEYSTORE_VERSION: u8 = 0x23;

/// Integrity prefix length (double SHA-256).
const KEY_HASH_LEN: usize = 32;

/// Local node identity material handed to services at construction.
pub struct NodeCredentials {
    /// Local node identifier.
    pub node_id: NodeId,
    /// Local node identity nonce.
    pub nonce: Uint256,
    /// Local signing keypair.
    pub keypair: KeyPair,
}

impl NodeCredentials {
    pub fn new(node_id: NodeId, nonce: Uint256, keypair: KeyPair) -> Self {
        NodeCredentials {
            node_id,
            nonce,
            keypair,
        }
    }

    /// Local node public key.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }
}

/// Save a private key to `path`, encrypted under `master_key`.
pub fn save_private_key(path: &Path, keypair: &KeyPair, master_key: &[u8]) -> Result<()> {
    let key_bytes = keypair.to_bytes();
    let digest = double_sha256(&key_bytes);
    let mut raw = digest.hash_value().to_vec();
    raw.extend_from_slice(&key_bytes);
    let enc = cipher::encrypt(master_key, &raw)?;
    let wrapped = bs58::encode(&enc)
        .with_check_version(KEYSTORE_VERSION)
        .into_string();
    fs::write(path, wrapped).map_err(|err| Error::new_ext(ErrorKind::Other, err))
}

/// Load a private key from `path`, decrypting it with `master_key` and
/// verifying the integrity prefix.
pub fn load_private_key(path: &Path, master_key: &[u8]) -> Result<KeyPair> {
    let content = fs::read(path).map_err(|err| Error::new_ext(ErrorKind::Other, err))?;

    let enc = match std::str::from_utf8(&content) {
        Ok(text) => match bs58::decode(text.trim()).with_check(None).into_vec() {
            Ok(data) => {
                if data.is_empty() {
                    return Err(Error::new_ext(ErrorKind::InvalidKeyFormat, "empty key file"));
                }
                if data[0] != 0 && data[0] != KEYSTORE_VERSION {
                    return Err(Error::new_ext(
                        ErrorKind::InvalidKeyFormat,
                        "unexpected key store version",
                    ));
                }
                data[1..].to_vec()
            }
            Err(err @ bs58::decode::Error::InvalidChecksum { .. }) => {
                return Err(Error::new_ext(ErrorKind::InvalidKeyFormat, err));
            }
            // Be compatible with the legacy raw-binary key format.
            Err(_) => content.clone(),
        },
        Err(_) => content.clone(),
    };

    let dec = cipher::decrypt(master_key, &enc)
        .map_err(|err| Error::new_ext(ErrorKind::InvalidKeyFormat, err.to_string_full()))?;

    if dec.len() != KEY_HASH_LEN + KEYPAIR_BYTES_LEN {
        warn!(
            "wrong private key file size: expected {}, actual {}",
            KEY_HASH_LEN + KEYPAIR_BYTES_LEN,
            dec.len()
        );
        return Err(Error::new_ext(
            ErrorKind::InvalidKeyFormat,
            "wrong private key file size",
        ));
    }

    let computed = double_sha256(&dec[KEY_HASH_LEN..]);
    if computed.hash_value() != &dec[..KEY_HASH_LEN] {
        return Err(Error::new(ErrorKind::HashMismatch));
    }

    KeyPair::from_bytes(&dec[KEY_HASH_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ed25519::tests::ed25519_test_keypair;
    use tempfile::TempDir;

    const MASTER_KEY: &[u8] = b"correct horse battery staple";

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        let keypair = ed25519_test_keypair();

        save_private_key(&path, &keypair, MASTER_KEY).unwrap();
        let loaded = load_private_key(&path, MASTER_KEY).unwrap();

        assert_eq!(loaded.to_bytes(), keypair.to_bytes());
    }

    #[test]
    fn load_wrong_master_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        let keypair = ed25519_test_keypair();
        save_private_key(&path, &keypair, MASTER_KEY).unwrap();

        let err = load_private_key(&path, b"wrong key").unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidKeyFormat);
    }

    #[test]
    fn load_tampered_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        let keypair = ed25519_test_keypair();
        save_private_key(&path, &keypair, MASTER_KEY).unwrap();

        let mut content = fs::read_to_string(&path).unwrap();
        let flipped = if content.ends_with('1') { '2' } else { '1' };
        content.pop();
        content.push(flipped);
        fs::write(&path, content).unwrap();

        let err = load_private_key(&path, MASTER_KEY).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidKeyFormat);
    }

    #[test]
    fn load_legacy_raw_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        let keypair = ed25519_test_keypair();

        let key_bytes = keypair.to_bytes();
        let digest = double_sha256(&key_bytes);
        let mut raw = digest.hash_value().to_vec();
        raw.extend_from_slice(&key_bytes);
        let enc = cipher::encrypt(MASTER_KEY, &raw).unwrap();
        fs::write(&path, enc).unwrap();

        let loaded = load_private_key(&path, MASTER_KEY).unwrap();

        assert_eq!(loaded.to_bytes(), keypair.to_bytes());
    }

    #[test]
    fn load_unexpected_version_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        let keypair = ed25519_test_keypair();

        let key_bytes = keypair.to_bytes();
        let digest = double_sha256(&key_bytes);
        let mut raw = digest.hash_value().to_vec();
        raw.extend_from_slice(&key_bytes);
        let enc = cipher::encrypt(MASTER_KEY, &raw).unwrap();
        let wrapped = bs58::encode(&enc).with_check_version(0x42).into_string();
        fs::write(&path, wrapped).unwrap();

        let err = load_private_key(&path, MASTER_KEY).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidKeyFormat);
    }

    #[test]
    fn load_corrupted_integrity_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        let keypair = ed25519_test_keypair();

        let key_bytes = keypair.to_bytes();
        let mut raw = vec![0u8; KEY_HASH_LEN];
        raw.extend_from_slice(&key_bytes);
        let enc = cipher::encrypt(MASTER_KEY, &raw).unwrap();
        let wrapped = bs58::encode(&enc)
            .with_check_version(KEYSTORE_VERSION)
            .into_string();
        fs::write(&path, wrapped).unwrap();

        let err = load_private_key(&path, MASTER_KEY).unwrap_err();

        assert_eq!(err.kind, ErrorKind::HashMismatch);
    }
}
