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

//! Cryptographic facilities: hashing, signing, symmetric encryption and the
//! on-disk private key store.

pub mod cipher;
pub mod ed25519;
pub mod hash;
pub mod kms;

pub use ed25519::{KeyPair, PublicKey};
pub use hash::{double_sha256, Hash, HashAlgorithm};
pub use kms::NodeCredentials;
