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

//! MessagePack serialization helpers.
//!
//! Every wire and disk encoding of the project goes through these functions,
//! so that signatures and hashes are always computed over the same canonical
//! byte representation.

use crate::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Serialize using MessagePack format (without field names).
///
/// # Error
///
/// If the data cannot be serialized a `MalformedData` error kind is returned.
pub fn rmp_serialize<T>(val: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    rmp_serde::to_vec(val).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Deserialize using MessagePack format.
///
/// # Error
///
/// If the data cannot be deserialized a `MalformedData` error kind is returned.
pub fn rmp_deserialize<'a, T>(buf: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    rmp_serde::from_slice(buf).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Trait implemented by all types that can be serialized with MessagePack format.
pub trait MessagePack<'a>: Sized + Serialize + Deserialize<'a> {
    /// Serialize using MessagePack format.
    ///
    /// # Panics
    ///
    /// Panics if the concrete type cannot be serialized using message pack.
    fn serialize(&self) -> Vec<u8> {
        rmp_serialize(self).unwrap() // Safe for core structs.
    }

    /// Deserialize using MessagePack format.
    ///
    /// # Errors
    ///
    /// Propagates the message pack decoder error.
    fn deserialize(buf: &'a [u8]) -> Result<Self> {
        rmp_deserialize(buf)
    }
}

/// Blanket implementation for types implementing `Serialize` and `Deserialize`.
impl<'a, T: Serialize + Deserialize<'a>> MessagePack<'a> for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
    struct DirEntry<'a> {
        node: &'a str,
        weight: u32,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
    struct Directory<'a> {
        name: &'a str,
        owner: String,
        #[serde(with = "serde_bytes")]
        token: &'a [u8],
        replicas: Vec<u16>,
        entries: BTreeMap<&'a str, DirEntry<'a>>,
    }

    impl<'a> Directory<'a> {
        fn new() -> Self {
            let mut entries = BTreeMap::new();
            entries.insert(
                "k1",
                DirEntry {
                    node: "foo",
                    weight: 123,
                },
            );
            entries.insert(
                "k2",
                DirEntry {
                    node: "bar",
                    weight: 456,
                },
            );
            Self {
                name: "dir",
                owner: "root".to_string(),
                token: &[0x01, 0xFF, 0x80],
                replicas: vec![0x01, 0xFF, 0x80],
                entries,
            }
        }
    }

    const DIRECTORY_HEX: &str =
        "95a3646972a4726f6f74c40301ff809301ccffcc8082a26b3192a3666f6f7ba26b3292a3626172cd01c8";

    #[test]
    fn directory_serialize() {
        let dir = Directory::new();

        let buf = rmp_serialize(&dir).unwrap();

        assert_eq!(hex::encode(&buf), DIRECTORY_HEX);
    }

    #[test]
    fn directory_deserialize() {
        let exp = Directory::new();
        let buf = hex::decode(DIRECTORY_HEX).unwrap();

        let dir: Directory = rmp_deserialize(&buf).unwrap();

        assert_eq!(dir, exp);
    }
}
