//! AES-128-CTR slots and random material.
//!
//! Every slot gets a fresh random 128-bit key and a zero IV; a key encrypts
//! exactly one entry (or one blob's padding), so the IV never repeats under
//! any key.

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;

type Aes128Ctr = Ctr128BE<Aes128>;

pub fn random_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Caller-generated globally-unique blob id.
pub fn random_blob_id() -> [u8; 32] {
    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// One streaming encryption slot.
pub struct EncryptSlot {
    cipher: Aes128Ctr,
    key: [u8; 16],
}

impl EncryptSlot {
    pub fn fresh() -> Self {
        let key = random_key();
        let cipher = Aes128Ctr::new(&key.into(), &[0u8; 16].into());
        Self { cipher, key }
    }

    /// The key recorded in the catalog for later decryption.
    pub fn key(&self) -> [u8; 16] {
        self.key
    }

    /// Encrypt the next chunk of the stream in place.
    pub fn apply(&mut self, chunk: &mut [u8]) {
        self.cipher.apply_keystream(chunk);
    }
}
