//! Signature and public key files.
//!
//! Both use the signify layout: a comment line, then one line of base64
//! holding a two-byte algorithm tag, an eight-byte key index and the raw
//! signature or key.
//!
//! ```text
//! untrusted comment: verify with app.pub
//! RWJy5xgN+PO2... (base64 of alg || key_index || body)
//! ```

use {
    crate::{
        error::{Error, Result},
        signature::{
            KEY_INDEX_LEN, KeyIndex, PUBLIC_KEY_ALG, PUBLIC_KEY_LEN, PublicKey, SIGNATURE_ALG,
            SIGNATURE_LEN, Signature,
        },
        upload::check_image,
    },
    base64::{Engine as _, engine::general_purpose::STANDARD},
    std::{fs, path::Path},
};

const COMMENT_PREFIX: &str = "untrusted comment: ";

/// Read an app binary and check the device can take it.
pub fn read_image_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let image = fs::read(path)?;
    check_image(&image)?;
    Ok(image)
}

/// Read a signature file.
pub fn read_signature_file(path: impl AsRef<Path>) -> Result<Signature> {
    parse_signature(&fs::read_to_string(path)?)
}

/// Read a public key file.
pub fn read_public_key_file(path: impl AsRef<Path>) -> Result<PublicKey> {
    parse_public_key(&fs::read_to_string(path)?)
}

/// Write a signature file.
pub fn write_signature_file(
    path: impl AsRef<Path>,
    signature: &Signature,
    comment: &str,
) -> Result<()> {
    fs::write(path, format_signature(signature, comment))?;
    Ok(())
}

/// Write a public key file.
pub fn write_public_key_file(path: impl AsRef<Path>, key: &PublicKey, comment: &str) -> Result<()> {
    fs::write(path, format_public_key(key, comment))?;
    Ok(())
}

struct Blob {
    alg: [u8; 2],
    key_index: KeyIndex,
    body: Vec<u8>,
}

fn decode_blob(text: &str, body_len: usize) -> Result<Blob> {
    let mut lines = text.lines();
    let comment = lines
        .next()
        .ok_or_else(|| Error::InvalidKeyFile("file is empty".to_string()))?;
    if !comment.starts_with(COMMENT_PREFIX) {
        return Err(Error::InvalidKeyFile(format!(
            "first line must start with {COMMENT_PREFIX:?}"
        )));
    }
    let encoded = lines
        .next()
        .ok_or_else(|| Error::InvalidKeyFile("missing data line".to_string()))?;
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidKeyFile(format!("could not decode: {e}")))?;

    let expected = 2 + KEY_INDEX_LEN + body_len;
    if raw.len() != expected {
        return Err(Error::InvalidKeyFile(format!(
            "expected {expected} bytes of data, got {}",
            raw.len()
        )));
    }

    let mut alg = [0u8; 2];
    alg.copy_from_slice(&raw[..2]);
    let mut key_index = [0u8; KEY_INDEX_LEN];
    key_index.copy_from_slice(&raw[2..2 + KEY_INDEX_LEN]);
    Ok(Blob {
        alg,
        key_index,
        body: raw[2 + KEY_INDEX_LEN..].to_vec(),
    })
}

fn encode_blob(alg: [u8; 2], key_index: &KeyIndex, body: &[u8], comment: &str) -> String {
    let mut raw = Vec::with_capacity(2 + KEY_INDEX_LEN + body.len());
    raw.extend_from_slice(&alg);
    raw.extend_from_slice(key_index);
    raw.extend_from_slice(body);
    format!("{COMMENT_PREFIX}{comment}\n{}\n", STANDARD.encode(raw))
}

/// Parse the contents of a signature file.
pub fn parse_signature(text: &str) -> Result<Signature> {
    let blob = decode_blob(text, SIGNATURE_LEN)?;
    if blob.alg != SIGNATURE_ALG {
        return Err(Error::InvalidKeyFile(format!(
            "expected an Ed25519 signature over a BLAKE2s digest, got algorithm {:?}",
            String::from_utf8_lossy(&blob.alg)
        )));
    }
    let mut bytes = [0u8; SIGNATURE_LEN];
    bytes.copy_from_slice(&blob.body);
    Ok(Signature {
        alg: blob.alg,
        key_index: blob.key_index,
        bytes,
    })
}

/// Parse the contents of a public key file.
pub fn parse_public_key(text: &str) -> Result<PublicKey> {
    let blob = decode_blob(text, PUBLIC_KEY_LEN)?;
    if blob.alg != PUBLIC_KEY_ALG {
        return Err(Error::InvalidKeyFile(format!(
            "expected an Ed25519 public key, got algorithm {:?}",
            String::from_utf8_lossy(&blob.alg)
        )));
    }
    let mut bytes = [0u8; PUBLIC_KEY_LEN];
    bytes.copy_from_slice(&blob.body);
    Ok(PublicKey {
        alg: blob.alg,
        key_index: blob.key_index,
        bytes,
    })
}

/// Render a signature file.
pub fn format_signature(signature: &Signature, comment: &str) -> String {
    encode_blob(signature.alg, &signature.key_index, &signature.bytes, comment)
}

/// Render a public key file.
pub fn format_public_key(key: &PublicKey, comment: &str) -> String {
    encode_blob(key.alg, &key.key_index, &key.bytes, comment)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::signature::{public_key_from_seed, sign, verify_locally},
    };

    const SEED: [u8; 32] = [3; 32];

    #[test]
    fn test_signature_file_is_readable_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let sig_path = dir.path().join("app.bin.sig");
        let pub_path = dir.path().join("app.pub");

        let image = b"an app".repeat(100);
        write_signature_file(&sig_path, &sign(&SEED, &image), "verify with app.pub").unwrap();
        write_public_key_file(&pub_path, &public_key_from_seed(&SEED), "app public key").unwrap();

        let sig = read_signature_file(&sig_path).unwrap();
        let key = read_public_key_file(&pub_path).unwrap();
        assert!(verify_locally(&key, &image, &sig));
        assert_eq!(sig.key_index, key.key_index);
    }

    #[test]
    fn test_text_layout() {
        let key = public_key_from_seed(&SEED);
        let text = format_public_key(&key, "test key");
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("untrusted comment: test key"));
        let raw = STANDARD.decode(lines.next().unwrap()).unwrap();
        assert_eq!(&raw[..2], b"Ed");
        assert_eq!(&raw[10..], &key.bytes);
    }

    #[test]
    fn test_rejects_swapped_tags() {
        let key = public_key_from_seed(&SEED);
        let mut as_sig = key;
        as_sig.alg = *b"Eb";
        let text = format_public_key(&as_sig, "wrong");
        assert!(matches!(parse_public_key(&text), Err(Error::InvalidKeyFile(_))));

        let mut sig = sign(&SEED, b"x");
        sig.alg = *b"ED";
        let text = format_signature(&sig, "wrong");
        assert!(matches!(parse_signature(&text), Err(Error::InvalidKeyFile(_))));
    }

    #[test]
    fn test_rejects_malformed_files() {
        assert!(parse_signature("").is_err());
        assert!(parse_signature("untrusted comment: x\n").is_err());
        assert!(parse_signature("untrusted comment: x\n!!!notbase64\n").is_err());
        assert!(parse_signature("comment\nRWQ=\n").is_err());
        // key-sized body in a signature file
        let key_text = format_public_key(&public_key_from_seed(&SEED), "k");
        assert!(parse_signature(&key_text).is_err());
    }

    #[test]
    fn test_read_image_file_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(read_image_file(&path), Err(Error::InvalidImage(_))));
        assert!(matches!(
            read_image_file(dir.path().join("missing.bin")),
            Err(Error::Io(_))
        ));
    }
}
