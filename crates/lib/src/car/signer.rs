//! Ed25519 keys for signing and verifying archives.
//!
//! A signer is identified by the base58 encoding of its public key; that string is
//! all a verifier needs.

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use super::CarError;

pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// A private signing key.
pub struct CarSigner {
  key: SigningKey,
}

impl std::fmt::Debug for CarSigner {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CarSigner").field("id", &self.signer_id()).finish()
  }
}

impl CarSigner {
  /// A fresh random key.
  pub fn generate() -> Self {
    Self {
      key: SigningKey::generate(&mut OsRng),
    }
  }

  pub fn from_seed(seed: [u8; 32]) -> Self {
    Self {
      key: SigningKey::from_bytes(&seed),
    }
  }

  /// Loads a 32-byte seed, stored either raw or as 64 hex characters.
  pub fn from_file(path: &Path) -> Result<Self, CarError> {
    let bytes = std::fs::read(path).map_err(|e| CarError::io("read", path, e))?;
    if let Ok(seed) = <[u8; 32]>::try_from(bytes.as_slice()) {
      return Ok(Self::from_seed(seed));
    }

    let text = String::from_utf8_lossy(&bytes);
    let decoded = hex::decode(text.trim()).map_err(|e| CarError::InvalidKey(format!("{}: {e}", path.display())))?;
    let seed = <[u8; 32]>::try_from(decoded.as_slice()).map_err(|_| {
      CarError::InvalidKey(format!(
        "{}: expected 32 bytes, got {}",
        path.display(),
        decoded.len()
      ))
    })?;
    Ok(Self::from_seed(seed))
  }

  /// Base58 public key.
  pub fn signer_id(&self) -> String {
    bs58::encode(self.key.verifying_key().as_bytes()).into_string()
  }

  pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
    self.key.sign(message).to_bytes()
  }
}

/// Checks `signature` over `message` against the public key named by `signer_id`.
pub fn verify(signer_id: &str, message: &[u8], signature: &[u8]) -> Result<(), CarError> {
  let public = bs58::decode(signer_id)
    .into_vec()
    .map_err(|e| CarError::InvalidKey(format!("signer '{signer_id}': {e}")))?;
  let public = <[u8; 32]>::try_from(public.as_slice())
    .map_err(|_| CarError::InvalidKey(format!("signer '{signer_id}': expected 32 bytes")))?;
  let key = VerifyingKey::from_bytes(&public).map_err(|e| CarError::InvalidKey(format!("signer '{signer_id}': {e}")))?;

  let signature = Signature::from_slice(signature).map_err(|_| CarError::InvalidSignature)?;
  key
    .verify_strict(message, &signature)
    .map_err(|_| CarError::InvalidSignature)
}
