use aes::cipher::{KeyIvInit, StreamCipher};
use anyhow::anyhow;
use sha2::{Digest, Sha256};

use crate::error::ProtocolError;

type Aes256Ctr = ctr::Ctr32BE<aes::Aes256>;

pub const KEY_LEN: usize = 32;
/// number of checksum bytes appended to each payload before encryption
pub const TAG_LEN: usize = 8;

/// Derives the session key from the login key exchange's shared secret
pub fn derive_key(salt: &[u8], shared_secret: &[u8]) -> [u8; KEY_LEN] {
    let mut sha256 = Sha256::default();
    sha256.update(salt);
    sha256.update(shared_secret);
    sha256.finalize().into()
}

/// Creates the sending and receiving halves for a key. The halves are independent: each has
///  its own message counter and its own continuous cipher stream.
pub fn new_pair(key: &[u8; KEY_LEN]) -> anyhow::Result<(Encryptor, Decryptor)> {
    Ok((
        Encryptor(CipherState::new(key)?),
        Decryptor(CipherState::new(key)?),
    ))
}

struct CipherState {
    key: [u8; KEY_LEN],
    counter: u64,
    cipher: Aes256Ctr,
}

impl CipherState {
    fn new(key: &[u8; KEY_LEN]) -> anyhow::Result<CipherState> {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&key[..12]);
        iv[15] = 2;

        let cipher = Aes256Ctr::new_from_slices(key, &iv)
            .map_err(|e| anyhow!("invalid AES key or IV: {}", e))?;

        Ok(CipherState {
            key: *key,
            counter: 0,
            cipher,
        })
    }

    /// The checksum for the next message, advancing the counter
    fn next_tag(&mut self, payload: &[u8]) -> [u8; TAG_LEN] {
        let mut sha256 = Sha256::default();
        sha256.update(self.counter.to_le_bytes());
        sha256.update(payload);
        sha256.update(self.key);
        self.counter = self.counter.wrapping_add(1);

        let digest = sha256.finalize();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        tag
    }
}

pub struct Encryptor(CipherState);

impl Encryptor {
    /// Appends the checksum and encrypts payload and checksum
    pub fn encrypt(&mut self, payload: &[u8]) -> Vec<u8> {
        let tag = self.0.next_tag(payload);

        let mut result = Vec::with_capacity(payload.len() + TAG_LEN);
        result.extend_from_slice(payload);
        result.extend_from_slice(&tag);
        self.0.cipher.apply_keystream(&mut result);
        result
    }
}

pub struct Decryptor(CipherState);

impl Decryptor {
    /// Decrypts a message and verifies its checksum, returning the payload without it.
    ///
    /// Every call consumes a counter value and the message's length of the cipher stream,
    ///  whether verification succeeds or not - the peer's encryptor advanced as well.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut plain = ciphertext.to_vec();
        self.0.cipher.apply_keystream(&mut plain);

        if plain.len() < TAG_LEN {
            let _ = self.0.next_tag(&[]);
            return Err(ProtocolError::malformed(format!("encrypted payload of {} bytes is too short for a checksum", plain.len())));
        }

        let received_tag = plain.split_off(plain.len() - TAG_LEN);
        let expected_tag = self.0.next_tag(&plain);
        if received_tag != expected_tag {
            return Err(ProtocolError::IntegrityFailure.into());
        }
        Ok(plain)
    }
}
