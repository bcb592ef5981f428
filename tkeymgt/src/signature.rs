//! App digests, Ed25519 signatures and the host/device signature checks.
//!
//! Signatures are Ed25519 over the BLAKE2s-256 digest of the app image, never
//! over the image itself. The same digest is what the verifier recomputes on
//! the device.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{CMD_VERIFY, RSP_VERIFY},
        session::DeviceSession,
    },
    blake2::{Blake2s256, Digest as _},
    ed25519_dalek::{SigningKey, Verifier, VerifyingKey},
    log::debug,
    std::{fmt, time::Duration},
};

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 32;
/// Signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;
/// Public key length in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Key index tag length in bytes.
pub const KEY_INDEX_LEN: usize = 8;

/// Algorithm tag of signatures: Ed25519 over a BLAKE2s digest.
pub const SIGNATURE_ALG: [u8; 2] = *b"Eb";
/// Algorithm tag of public keys.
pub const PUBLIC_KEY_ALG: [u8; 2] = *b"Ed";

/// BLAKE2s-256 digest of an app image.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Digest `image`.
    pub fn compute(image: &[u8]) -> Self {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&Blake2s256::digest(image));
        Self(bytes)
    }

    /// Wrap raw digest bytes (e.g. as reported by the firmware).
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// Tag naming the key a signature was made with.
pub type KeyIndex = [u8; KEY_INDEX_LEN];

/// Key index derived from a public key: the first eight digest bytes.
pub fn key_index_for(key: &[u8; PUBLIC_KEY_LEN]) -> KeyIndex {
    let digest = Digest::compute(key);
    let mut index = [0u8; KEY_INDEX_LEN];
    index.copy_from_slice(&digest.as_bytes()[..KEY_INDEX_LEN]);
    index
}

/// A detached app signature with its tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Algorithm tag.
    pub alg: [u8; 2],
    /// Key index tag.
    pub key_index: KeyIndex,
    /// Raw Ed25519 signature.
    pub bytes: [u8; SIGNATURE_LEN],
}

impl Signature {
    /// Signature with the default algorithm tag and no key index.
    pub const fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self {
            alg: SIGNATURE_ALG,
            key_index: [0; KEY_INDEX_LEN],
            bytes,
        }
    }
}

/// An Ed25519 public key with its tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    /// Algorithm tag.
    pub alg: [u8; 2],
    /// Key index tag.
    pub key_index: KeyIndex,
    /// Raw key bytes.
    pub bytes: [u8; PUBLIC_KEY_LEN],
}

impl PublicKey {
    /// Public key with the default algorithm tag and derived key index.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self {
            alg: PUBLIC_KEY_ALG,
            key_index: key_index_for(&bytes),
            bytes,
        }
    }

    /// Whether two keys have the same key material. Tags are not compared,
    /// the device only stores the 32 key bytes.
    pub fn same_key(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

/// Host-side signature check.
///
/// Returns `false` for anything that is not a valid signature by `key` over
/// the digest of `image`, including malformed key material.
pub fn verify_locally(key: &PublicKey, image: &[u8], signature: &Signature) -> bool {
    verify_digest(key, &Digest::compute(image), signature)
}

/// Host-side signature check over an already computed digest.
pub fn verify_digest(key: &PublicKey, digest: &Digest, signature: &Signature) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key.bytes) else {
        debug!("Public key is not a valid Ed25519 point");
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&signature.bytes);
    verifying_key.verify(digest.as_bytes(), &sig).is_ok()
}

/// Ask the running verifier to check `signature` over `digest` with the key
/// it holds. A non-OK status surfaces as [`Error::DeviceError`].
///
/// A verifier that accepts may reset straight into the verified app without
/// answering. The transport closing while we wait for the answer therefore
/// counts as acceptance; the caller still has to await the disconnect.
pub fn verify_on_device<P: Port>(
    session: &mut DeviceSession<P>,
    digest: &Digest,
    signature: &Signature,
    timeout: Option<Duration>,
) -> Result<()> {
    let mut payload = [0u8; DIGEST_LEN + SIGNATURE_LEN];
    payload[..DIGEST_LEN].copy_from_slice(digest.as_bytes());
    payload[DIGEST_LEN..].copy_from_slice(&signature.bytes);
    session.send(CMD_VERIFY, &payload)?;

    match session.read_frame(RSP_VERIFY, session.transaction_id(), timeout) {
        Ok(_) => Ok(()),
        Err(Error::Io(e)) => {
            debug!("Transport closed after verify ({e}), device accepted");
            Ok(())
        },
        Err(e) => Err(e),
    }
}

/// Ed25519 signing key seed.
pub type Seed = [u8; 32];

/// Parse a hex seed as written by key generation tools. Only the first 64
/// characters are used, so a trailing newline is fine.
pub fn parse_seed(text: &str) -> Result<Seed> {
    let hex_part = text.trim().get(..64).ok_or_else(|| {
        Error::InvalidKeyFile(format!(
            "expected 64 hex characters of seed, got {}",
            text.trim().len()
        ))
    })?;
    let mut seed = [0u8; 32];
    hex::decode_to_slice(hex_part, &mut seed)
        .map_err(|e| Error::InvalidKeyFile(format!("invalid seed: {e}")))?;
    Ok(seed)
}

/// Public key belonging to `seed`.
pub fn public_key_from_seed(seed: &Seed) -> PublicKey {
    PublicKey::from_bytes(SigningKey::from_bytes(seed).verifying_key().to_bytes())
}

/// Sign the digest of `image` with `seed`.
pub fn sign(seed: &Seed, image: &[u8]) -> Signature {
    use ed25519_dalek::Signer;

    let key = SigningKey::from_bytes(seed);
    let digest = Digest::compute(image);
    Signature {
        alg: SIGNATURE_ALG,
        key_index: key_index_for(&key.verifying_key().to_bytes()),
        bytes: key.sign(digest.as_bytes()).to_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: Seed = [0x42; 32];

    fn image() -> Vec<u8> {
        (0..300u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_digest_is_blake2s_256() {
        // BLAKE2s-256 of the empty input
        let empty = Digest::compute(b"");
        assert_eq!(empty.as_bytes()[..4], [0x69, 0x21, 0x7a, 0x30]);
    }

    #[test]
    fn test_verify_locally_accepts_genuine_signature() {
        let key = public_key_from_seed(&SEED);
        let sig = sign(&SEED, &image());
        assert!(verify_locally(&key, &image(), &sig));
        assert_eq!(sig.key_index, key.key_index);
    }

    #[test]
    fn test_verify_locally_rejects_flipped_image_bit() {
        let key = public_key_from_seed(&SEED);
        let sig = sign(&SEED, &image());
        let mut tampered = image();
        tampered[150] ^= 0x01;
        assert!(!verify_locally(&key, &tampered, &sig));
    }

    #[test]
    fn test_verify_locally_rejects_flipped_signature_bit() {
        let key = public_key_from_seed(&SEED);
        let mut sig = sign(&SEED, &image());
        sig.bytes[10] ^= 0x80;
        assert!(!verify_locally(&key, &image(), &sig));
    }

    #[test]
    fn test_verify_locally_rejects_other_key() {
        let other = public_key_from_seed(&[0x17; 32]);
        let sig = sign(&SEED, &image());
        assert!(!verify_locally(&other, &image(), &sig));
    }

    #[test]
    fn test_verify_locally_rejects_garbage_key() {
        let garbage = PublicKey::from_bytes([0xff; 32]);
        let sig = sign(&SEED, &image());
        assert!(!verify_locally(&garbage, &image(), &sig));
    }

    #[test]
    fn test_parse_seed() {
        let text = format!("{}\n", "0a".repeat(32));
        assert_eq!(parse_seed(&text).unwrap(), [0x0a; 32]);
        assert!(parse_seed("abcd").is_err());
        assert!(parse_seed(&"zz".repeat(32)).is_err());
    }
}
