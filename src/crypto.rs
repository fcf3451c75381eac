//! Datagram encryption for the overlay transport.
//!
//! Every UDP payload on the wire is `nonce(12) || ciphertext || tag(16)`
//! under ChaCha20-Poly1305, keyed with SHA-256 of the shared secret. There
//! is no key derivation salt, no version byte and no sequence number; both
//! ends of a link must agree on the secret alone.

use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use sha2::{Digest, Sha256};

/// Nonce prefix length of every wire datagram.
pub const NONCE_LEN: usize = 12;

/// Poly1305 authenticator appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Stateless AEAD codec shared by the hub and its agents.
///
/// Nonces are drawn fresh from the system RNG for every datagram, so
/// uniqueness holds per sender without any coordination. The random 96-bit
/// nonce space puts the collision bound around 2^48 datagrams under one key.
/// A captured datagram stays valid until the secret changes; there is no
/// replay window on this transport.
pub struct PacketCipher {
    aead: ChaCha20Poly1305,
}

impl PacketCipher {
    pub fn new(secret: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Seal `plaintext` under a fresh random nonce and return the complete
    /// wire datagram. An empty plaintext is legal and produces a keepalive.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|e| anyhow!("encryption failed: {}", e))?;

        let mut packet = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// Open a wire datagram, returning the inner plaintext.
    ///
    /// Fails on anything shorter than the nonce prefix and on any datagram
    /// that does not authenticate under this cipher's key.
    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < NONCE_LEN {
            return Err(anyhow!("datagram too short: {} bytes", packet.len()));
        }
        let (nonce, ciphertext) = packet.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("datagram failed authentication"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let cipher = PacketCipher::new("test-secret");
        let plaintext = b"a full IPv4 packet would go here";

        let packet = cipher.seal(plaintext).unwrap();
        assert_eq!(packet.len(), NONCE_LEN + plaintext.len() + TAG_LEN);

        let opened = cipher.open(&packet).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let cipher = PacketCipher::new("test-secret");
        let packet = cipher.seal(&[]).unwrap();
        assert_eq!(packet.len(), NONCE_LEN + TAG_LEN);
        assert!(cipher.open(&packet).unwrap().is_empty());
    }

    #[test]
    fn wrong_key_rejected() {
        let sealer = PacketCipher::new("secret-one");
        let opener = PacketCipher::new("secret-two");
        let packet = sealer.seal(b"payload").unwrap();
        assert!(opener.open(&packet).is_err());
    }

    #[test]
    fn tampering_rejected() {
        let cipher = PacketCipher::new("test-secret");
        let packet = cipher.seal(b"payload").unwrap();

        for i in 0..packet.len() {
            let mut tampered = packet.clone();
            tampered[i] ^= 0x01;
            assert!(cipher.open(&tampered).is_err(), "flip at byte {}", i);
        }
    }

    #[test]
    fn truncation_rejected() {
        let cipher = PacketCipher::new("test-secret");
        let packet = cipher.seal(b"payload").unwrap();

        for len in 0..NONCE_LEN {
            assert!(cipher.open(&packet[..len]).is_err(), "length {}", len);
        }
        // Long enough to carry a nonce but the tag no longer matches.
        assert!(cipher.open(&packet[..packet.len() - 1]).is_err());
    }

    #[test]
    fn nonces_are_unique_per_datagram() {
        let cipher = PacketCipher::new("test-secret");
        let a = cipher.seal(b"same plaintext").unwrap();
        let b = cipher.seal(b"same plaintext").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }
}
