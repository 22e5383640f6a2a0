//! Cryptographic primitives and helpers used by the session layer.
//!
//! Bulk protection is AES-128-GCM; key derivation is HKDF-SHA256; the
//! password-authenticated exchange lives in [`spake2p`]. Certificate chain
//! validation is deliberately not implemented here: the embedding application
//! injects a [`CertificateVerifier`].

pub mod spake2p;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::Aes128Gcm;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::session::PeerIdentity;

pub(crate) type HmacSha256 = Hmac<Sha256>;

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub(crate) fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), Error> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out)
        .map_err(|_| Error::Crypto("hkdf output length"))
}

/// PBKDF2-HMAC-SHA256 (RFC 8018). Only used to stretch commissioning
/// passcodes into SPAKE2+ witnesses, so a hand-rolled loop over HMAC keeps
/// the dependency surface small.
pub(crate) fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    let mut block: u32 = 1;
    for chunk in out.chunks_mut(32) {
        let mut input = Vec::with_capacity(salt.len() + 4);
        input.extend_from_slice(salt);
        input.extend_from_slice(&block.to_be_bytes());

        let mut u = hmac_sha256(password, &input);
        let mut t = u;
        for _ in 1..iterations.max(1) {
            u = hmac_sha256(password, &u);
            for (ti, ui) in t.iter_mut().zip(u.iter()) {
                *ti ^= ui;
            }
        }

        chunk.copy_from_slice(&t[..chunk.len()]);
        block += 1;
    }
}

/// AEAD seal with AES-128-GCM.
pub(crate) fn aead_seal(
    key: &[u8; 16],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    // Imported locally: `KeyInit` at module scope would make
    // `new_from_slice` ambiguous with `Mac` on `Hmac<Sha256>`.
    use aes_gcm::KeyInit;

    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| Error::Crypto("aead key length"))?;
    cipher
        .encrypt(nonce.into(), Payload { msg: plaintext, aad })
        .map_err(|_| Error::Crypto("aead seal"))
}

/// AEAD open with AES-128-GCM. A bad tag is an authentication failure, not a
/// decode error.
pub(crate) fn aead_open(
    key: &[u8; 16],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    use aes_gcm::KeyInit;

    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| Error::Crypto("aead key length"))?;
    cipher
        .decrypt(nonce.into(), Payload { msg: ciphertext, aad })
        .map_err(|_| Error::AuthenticationFailed)
}

/// Nonce for session traffic: message counter plus sender node id. The two
/// directions use distinct keys, so the construction stays unique even when
/// both sides share node id 0 (commissioning sessions).
pub(crate) fn message_nonce(counter: u32, source_node: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&counter.to_le_bytes());
    nonce[4..].copy_from_slice(&source_node.to_le_bytes());
    nonce
}

/// The peer facts a certificate chain validation yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    /// Fabric-scoped identity asserted by the certificate.
    pub identity: PeerIdentity,
    /// SEC1-encoded P-256 public key of the certificate subject.
    pub public_key: Vec<u8>,
}

/// Abstract certificate chain validation.
///
/// Implementations check the chain against their trust anchor, the validity
/// window and the declared usage, and extract the subject identity and
/// public key. Any error is mapped to a generic authentication failure
/// before it reaches the wire.
pub trait CertificateVerifier {
    fn verify(&self, certificate: &[u8]) -> Result<VerifiedPeer, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 16];
        let nonce = message_nonce(5, 0xAABB);
        let aad = b"header";

        let ct = aead_seal(&key, &nonce, aad, b"hello").unwrap();
        let pt = aead_open(&key, &nonce, aad, &ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn tampered_ciphertext_fails_open() {
        let key = [7u8; 16];
        let nonce = message_nonce(5, 1);

        let mut ct = aead_seal(&key, &nonce, b"", b"hello").unwrap();
        ct[0] ^= 1;
        assert_eq!(
            aead_open(&key, &nonce, b"", &ct).unwrap_err(),
            Error::AuthenticationFailed
        );
    }

    #[test]
    fn modified_aad_fails_open() {
        let key = [9u8; 16];
        let nonce = message_nonce(1, 2);

        let ct = aead_seal(&key, &nonce, b"aad-a", b"data").unwrap();
        assert!(aead_open(&key, &nonce, b"aad-b", &ct).is_err());
    }

    #[test]
    fn pbkdf2_matches_rfc7914_style_vector() {
        // RFC 6070-equivalent vector for PBKDF2-HMAC-SHA256:
        // P="password", S="salt", c=1, dkLen=32.
        let mut out = [0u8; 32];
        pbkdf2_sha256(b"password", b"salt", 1, &mut out);
        let expected = [
            0x12, 0x0f, 0xb6, 0xcf, 0xfc, 0xf8, 0xb3, 0x2c, 0x43, 0xe7, 0x22, 0x52, 0x56, 0xc4,
            0xf8, 0x37, 0xa8, 0x65, 0x48, 0xc9, 0x2c, 0xcc, 0x35, 0x48, 0x08, 0x05, 0x98, 0x7c,
            0xb7, 0x0b, 0xe1, 0x7b,
        ];
        assert_eq!(out, expected);
    }
}
