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

//! CPU proof-of-work miner.
//!
//! The miner walks a 256-bit nonce space and streams every nonce whose
//! double SHA-256 over `data || nonce` reaches the requested difficulty
//! (leading zero bits). The stream ends when the quit channel is closed or
//! the consumer drops the nonce receiver.

use crate::{
    channel::{Receiver, Sender},
    crypto::{double_sha256, Hash},
};

/// 256-bit unsigned integer used as the mining nonce.
///
/// Stored as four 64-bit limbs, `a` being the most significant.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Uint256 {
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub d: u64,
}

impl Uint256 {
    pub fn new(a: u64, b: u64, c: u64, d: u64) -> Self {
        Uint256 { a, b, c, d }
    }

    /// Increment by one, wrapping on overflow of the whole 256-bit space.
    pub fn inc(&mut self) {
        let (d, carry) = self.d.overflowing_add(1);
        self.d = d;
        if carry {
            let (c, carry) = self.c.overflowing_add(1);
            self.c = c;
            if carry {
                let (b, carry) = self.b.overflowing_add(1);
                self.b = b;
                if carry {
                    self.a = self.a.wrapping_add(1);
                }
            }
        }
    }

    /// Big-endian byte representation.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&self.a.to_be_bytes());
        buf[8..16].copy_from_slice(&self.b.to_be_bytes());
        buf[16..24].copy_from_slice(&self.c.to_be_bytes());
        buf[24..32].copy_from_slice(&self.d.to_be_bytes());
        buf
    }
}

/// A nonce satisfying the requested difficulty, along with its hash.
#[derive(Debug, Clone)]
pub struct NonceInfo {
    /// The winning nonce.
    pub nonce: Uint256,
    /// Actual number of leading zero bits of the hash.
    pub difficulty: u32,
    /// Double SHA-256 over `data || nonce`.
    pub hash: Hash,
}

/// Mining work unit.
pub struct MiningBlock {
    /// Input data the nonce is appended to.
    pub data: Vec<u8>,
    /// Stream of satisfying nonces.
    pub nonce_tx: Sender<NonceInfo>,
}

/// CPU miner bounded by a quit signal.
pub struct CpuMiner {
    quit: Receiver<()>,
}

impl CpuMiner {
    pub fn new(quit: Receiver<()>) -> Self {
        CpuMiner { quit }
    }

    /// Walk the nonce space starting from `start`, streaming every nonce
    /// whose hash has at least `difficulty` leading zero bits.
    ///
    /// Returns when the quit channel is closed or the nonce receiver is
    /// dropped. This call is CPU-bound and expected to run on a dedicated
    /// thread.
    pub fn compute_block_nonce(&self, block: &MiningBlock, start: Uint256, difficulty: u32) {
        let mut nonce = start;
        let mut buf = block.data.clone();
        let data_len = buf.len();
        buf.extend_from_slice(&nonce.to_bytes());
        loop {
            if self.quit.is_closed() {
                return;
            }
            buf[data_len..].copy_from_slice(&nonce.to_bytes());
            let hash = double_sha256(&buf);
            let zeros = leading_zero_bits(hash.hash_value());
            if zeros >= difficulty {
                let info = NonceInfo {
                    nonce,
                    difficulty: zeros,
                    hash,
                };
                if block.nonce_tx.send_sync(info).is_err() {
                    return;
                }
            }
            nonce.inc();
        }
    }
}

fn leading_zero_bits(bytes: &[u8]) -> u32 {
    let mut count = 0;
    for byte in bytes {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::simple_channel;
    use std::thread;

    #[test]
    fn uint256_inc_carry() {
        let mut nonce = Uint256::new(0, 0, 0, u64::MAX);

        nonce.inc();

        assert_eq!(nonce, Uint256::new(0, 0, 1, 0));
    }

    #[test]
    fn uint256_bytes_are_big_endian() {
        let nonce = Uint256::new(1, 2, 3, 4);

        let bytes = nonce.to_bytes();

        assert_eq!(bytes[7], 1);
        assert_eq!(bytes[15], 2);
        assert_eq!(bytes[23], 3);
        assert_eq!(bytes[31], 4);
    }

    #[test]
    fn leading_zeros() {
        assert_eq!(leading_zero_bits(&[0x00, 0x00, 0xff]), 16);
        assert_eq!(leading_zero_bits(&[0x00, 0x0f, 0xff]), 12);
        assert_eq!(leading_zero_bits(&[0x80, 0x00]), 0);
        assert_eq!(leading_zero_bits(&[0x00, 0x00]), 16);
    }

    #[test]
    fn mine_trivial_difficulty() {
        let (nonce_tx, nonce_rx) = simple_channel();
        let (quit_tx, quit_rx) = simple_channel::<()>();

        let handle = thread::spawn(move || {
            let miner = CpuMiner::new(quit_rx);
            let block = MiningBlock {
                data: b"node identifier".to_vec(),
                nonce_tx,
            };
            miner.compute_block_nonce(&block, Uint256::default(), 0);
        });

        let info = nonce_rx.recv_sync().unwrap();
        // With difficulty zero the very first nonce satisfies the target.
        assert_eq!(info.nonce, Uint256::default());
        assert_eq!(info.hash.hash_size(), 32);

        // Closing the quit channel terminates the miner.
        quit_tx.close();
        nonce_rx.close();
        handle.join().unwrap();
    }

    #[test]
    fn mined_nonce_hash_is_reproducible() {
        let (nonce_tx, nonce_rx) = simple_channel();
        let (quit_tx, quit_rx) = simple_channel::<()>();

        let handle = thread::spawn(move || {
            let miner = CpuMiner::new(quit_rx);
            let block = MiningBlock {
                data: b"payload".to_vec(),
                nonce_tx,
            };
            miner.compute_block_nonce(&block, Uint256::default(), 4);
        });

        let info = nonce_rx.recv_sync().unwrap();
        let mut buf = b"payload".to_vec();
        buf.extend_from_slice(&info.nonce.to_bytes());

        assert_eq!(double_sha256(&buf), info.hash);
        assert!(info.difficulty >= 4);

        quit_tx.close();
        nonce_rx.close();
        handle.join().unwrap();
    }
}
