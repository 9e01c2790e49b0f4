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

//! Ed25519 digital signature, used for peer-set and genesis block signing.

use crate::{Error, ErrorKind, Result};
use ed25519_dalek::{
    Keypair as KeyPairImpl, PublicKey as PublicKeyImpl, Signer as _, Verifier as _,
};
use rand::rngs::OsRng;
use serde::{self, de::Visitor, Deserialize, Serialize};
use std::convert::TryFrom;

/// Serialized keypair length: secret followed by public bytes.
pub const KEYPAIR_BYTES_LEN: usize = 64;

#[derive(Debug)]
pub struct KeyPair(KeyPairImpl);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    imp: PublicKeyImpl,
}

impl KeyPair {
    pub fn from_bytes(bytes: &[u8]) -> Result<KeyPair> {
        let internal = KeyPairImpl::from_bytes(bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(KeyPair(internal))
    }

    pub fn from_random() -> KeyPair {
        let mut csprng = OsRng {};
        let internal = KeyPairImpl::generate(&mut csprng);
        KeyPair(internal)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let sig = self.0.sign(data).to_bytes().to_vec();
        Ok(sig)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey { imp: self.0.public }
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<PublicKey> {
        let internal = PublicKeyImpl::from_bytes(bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(PublicKey { imp: internal })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.imp.to_bytes().to_vec()
    }

    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        ed25519_dalek::Signature::try_from(sig)
            .and_then(|s| self.imp.verify(data, &s))
            .is_ok()
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'v> Visitor<'v> for BytesVisitor {
            type Value = PublicKey;

            fn expecting(
                &self,
                fmt: &mut std::fmt::Formatter<'_>,
            ) -> std::result::Result<(), std::fmt::Error> {
                write!(fmt, "expecting byte array.")
            }

            fn visit_bytes<E>(self, bytes: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                PublicKey::from_bytes(bytes)
                    .map_err(|_err| serde::de::Error::custom("Invalid public key bytes"))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(&v)
            }
        }
        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};

    // RFC 8032 test vector 1, secret followed by its public key.
    const ED25519_BYTES_HEX: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";
    const ED25519_PUB_SER_BYTES_HEX: &str =
        "c420d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";

    pub fn ed25519_test_keypair() -> KeyPair {
        let bytes = hex::decode(ED25519_BYTES_HEX).unwrap();
        KeyPair::from_bytes(&bytes).unwrap()
    }

    pub fn ed25519_test_public_key() -> PublicKey {
        ed25519_test_keypair().public_key()
    }

    #[test]
    fn ed25519_public_key_serialize() {
        let public = ed25519_test_public_key();

        let buf = rmp_serialize(&public).unwrap();

        assert_eq!(hex::encode(&buf), ED25519_PUB_SER_BYTES_HEX);
    }

    #[test]
    fn ed25519_public_key_deserialize() {
        let expected = ed25519_test_public_key();
        let buf = hex::decode(ED25519_PUB_SER_BYTES_HEX).unwrap();

        let public: PublicKey = rmp_deserialize(&buf).unwrap();

        assert_eq!(public, expected);
    }

    #[test]
    fn ed25519_keypair_bytes_roundtrip() {
        let keypair = ed25519_test_keypair();

        let bytes = keypair.to_bytes();

        assert_eq!(bytes.len(), KEYPAIR_BYTES_LEN);
        assert_eq!(hex::encode(&bytes), ED25519_BYTES_HEX);
    }

    #[test]
    fn ed25519_keypair_random_generation_sign_verify() {
        let keypair = KeyPair::from_random();
        let data = b"replica membership payload";

        let sign = keypair.sign(data).unwrap();

        assert!(keypair.public_key().verify(data, &sign));
        assert!(!keypair.public_key().verify(b"other payload", &sign));
    }
}
