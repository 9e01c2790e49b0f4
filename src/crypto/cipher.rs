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

//! Symmetric encryption used by the private key store.
//!
//! AES-256-GCM-SIV keyed with the SHA-256 of the caller's master key. The
//! single-use nonce is generated on encryption and carried as the payload
//! prefix.

use crate::{Error, ErrorKind, Result};
use aes_gcm_siv::aead::{Aead, NewAead};
use aes_gcm_siv::{Aes256GcmSiv, Key, Nonce};
use rand::{thread_rng, RngCore};
use ring::digest;

/// AES-GCM-SIV nonce size.
const NONCE_SIZE: usize = 12;

fn build_cipher(master_key: &[u8]) -> Aes256GcmSiv {
    let key = digest::digest(&digest::SHA256, master_key);
    Aes256GcmSiv::new(Key::from_slice(key.as_ref()))
}

/// Encrypt `data` under `master_key`.
pub fn encrypt(master_key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = build_cipher(master_key);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let encrypted = cipher
        .encrypt(nonce, data)
        .map_err(|err| Error::new_ext(ErrorKind::Other, err.to_string()))?;
    let mut content = nonce_bytes.to_vec();
    content.extend(encrypted);
    Ok(content)
}

/// Decrypt a payload produced by [`encrypt`] under the same `master_key`.
pub fn decrypt(master_key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(Error::new_ext(
            ErrorKind::MalformedData,
            "encrypted payload truncated",
        ));
    }
    let cipher = build_cipher(master_key);
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
    cipher.decrypt(nonce, &data[NONCE_SIZE..]).map_err(|_| {
        Error::new_ext(ErrorKind::MalformedData, "wrong master key or corrupted data")
    })
}
