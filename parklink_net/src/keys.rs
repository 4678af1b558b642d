// Ed25519 player keys: generation, key files, signing and verification.
//
// A player's identity is a key pair kept under `<data_dir>/keys/`:
//
//   <name>.privkey          hex-encoded 32-byte secret seed
//   <name>-<hash>.pubkey    hex-encoded 32-byte public key
//
// `<hash>` is the SHA-256 of the public key bytes, hex-encoded. The same
// hash identifies the player in the server's user registry.
//
// The private key is loaded only for the duration of one signing operation
// and dropped right after; `ed25519_dalek::SigningKey` wipes its secret on
// drop.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{NetError, NetResult};

/// A player's secret key.
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self(SigningKey::from_bytes(&seed))
    }

    pub fn from_hex(text: &str) -> NetResult<Self> {
        let bytes = hex::decode(text.trim()).map_err(|e| NetError::Key(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NetError::Key(format!("private key must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(SigningKey::from_bytes(&seed)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.0.sign(message).to_bytes().to_vec()
    }
}

/// A player's public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_hex(text: &str) -> NetResult<Self> {
        let bytes = hex::decode(text.trim()).map_err(|e| NetError::Key(e.to_string()))?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NetError::Key(format!("public key must be 32 bytes, got {}", bytes.len())))?;
        VerifyingKey::from_bytes(&raw)
            .map(PublicKey)
            .map_err(|e| NetError::Key(e.to_string()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Stable identifier for this key: hex SHA-256 of the key bytes.
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }

    /// Check `signature` over `message`. Malformed signatures verify false.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::try_from(signature) {
            Ok(sig) => self.0.verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// Make a player name safe to embed in a file name.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() { "player".into() } else { stem }
}

pub fn private_key_path(keys_dir: &Path, name: &str) -> PathBuf {
    keys_dir.join(format!("{}.privkey", file_stem(name)))
}

pub fn public_key_path(keys_dir: &Path, name: &str, hash: &str) -> PathBuf {
    keys_dir.join(format!("{}-{hash}.pubkey", file_stem(name)))
}

fn load_private_key(path: &Path) -> NetResult<PrivateKey> {
    let text = fs::read_to_string(path)
        .map_err(|e| NetError::Key(format!("cannot read {}: {e}", path.display())))?;
    PrivateKey::from_hex(&text)
}

/// Return the public key for `name`, generating and writing a fresh key pair
/// if no private key file exists yet.
pub fn ensure_key_pair(keys_dir: &Path, name: &str) -> NetResult<PublicKey> {
    let private_path = private_key_path(keys_dir, name);
    if private_path.exists() {
        return Ok(load_private_key(&private_path)?.public_key());
    }

    fs::create_dir_all(keys_dir)?;
    let key = PrivateKey::generate();
    let public = key.public_key();
    fs::write(&private_path, key.to_hex())?;
    fs::write(public_key_path(keys_dir, name, &public.hash()), public.to_hex())?;
    tracing::info!(path = %private_path.display(), hash = %public.hash(), "generated new player key");
    Ok(public)
}

/// Sign an authentication challenge with the stored key for `name`. Returns
/// the hex public key and the signature. The private key is dropped before
/// returning.
pub fn sign_challenge(keys_dir: &Path, name: &str, challenge: &[u8]) -> NetResult<(String, Vec<u8>)> {
    let key = load_private_key(&private_key_path(keys_dir, name))?;
    let signature = key.sign(challenge);
    Ok((key.public_key().to_hex(), signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_keys_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "parklink-keys-{tag}-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn sign_then_verify() {
        let key = PrivateKey::generate();
        let public = key.public_key();
        let challenge = b"challenge bytes";
        let sig = key.sign(challenge);
        assert!(public.verify(challenge, &sig));
    }

    #[test]
    fn flipped_bit_fails_verification() {
        let key = PrivateKey::generate();
        let public = key.public_key();
        let challenge = vec![7u8; 64];
        let mut sig = key.sign(&challenge);
        sig[10] ^= 0x01;
        assert!(!public.verify(&challenge, &sig));

        let good = key.sign(&challenge);
        let mut altered = challenge.clone();
        altered[0] ^= 0x80;
        assert!(!public.verify(&altered, &good));
    }

    #[test]
    fn malformed_signature_is_rejected() {
        let public = PrivateKey::generate().public_key();
        assert!(!public.verify(b"msg", &[1, 2, 3]));
        assert!(!public.verify(b"msg", &[]));
    }

    #[test]
    fn hex_roundtrip_preserves_hash() {
        let public = PrivateKey::generate().public_key();
        let parsed = PublicKey::from_hex(&public.to_hex()).unwrap();
        assert_eq!(parsed, public);
        assert_eq!(parsed.hash(), public.hash());
        assert_eq!(public.hash().len(), 64);
    }

    #[test]
    fn bad_public_key_hex_is_an_error() {
        assert!(PublicKey::from_hex("zz").is_err());
        assert!(PublicKey::from_hex("abcd").is_err());
    }

    #[test]
    fn key_files_are_created_once_and_reused() {
        let dir = temp_keys_dir("reuse");
        let first = ensure_key_pair(&dir, "Guest Player").unwrap();
        let second = ensure_key_pair(&dir, "Guest Player").unwrap();
        assert_eq!(first, second);
        assert!(private_key_path(&dir, "Guest Player").exists());
        assert!(public_key_path(&dir, "Guest Player", &first.hash()).exists());

        let (public_hex, sig) = sign_challenge(&dir, "Guest Player", b"abc").unwrap();
        assert_eq!(public_hex, first.to_hex());
        assert!(first.verify(b"abc", &sig));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn signing_without_key_file_fails() {
        let dir = temp_keys_dir("missing");
        assert!(matches!(
            sign_challenge(&dir, "nobody", b"abc"),
            Err(NetError::Key(_))
        ));
    }
}
