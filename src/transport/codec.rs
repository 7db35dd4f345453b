//! Frame encryption.
//!
//! Every frame on the wire is `nonce(12) || ciphertext`, where the ciphertext
//! is the ChaCha20-Poly1305 sealing of the bincode-encoded [`Message`] under
//! a key derived from the shared cluster key with SHA-256.

use crate::message::Message;
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes is too short")]
    Truncated(usize),

    #[error("frame failed authentication")]
    Authentication,

    #[error("frame could not be sealed")]
    Seal,

    #[error("malformed message: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Clone)]
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
}

impl fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameCipher")
    }
}

impl FrameCipher {
    pub fn new(key: &[u8]) -> Self {
        let digest = Sha256::digest(key);
        let key = Key::from_slice(&digest);
        Self {
            cipher: ChaCha20Poly1305::new(key),
        }
    }

    pub fn seal(&self, message: &Message) -> Result<Bytes, CodecError> {
        let plaintext = bincode::serialize(message)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|_| CodecError::Seal)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(Bytes::from(frame))
    }

    pub fn open(&self, frame: &[u8]) -> Result<Message, CodecError> {
        if frame.len() <= NONCE_LEN {
            return Err(CodecError::Truncated(frame.len()));
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Authentication)?;
        Ok(bincode::deserialize(&plaintext)?)
    }
}
