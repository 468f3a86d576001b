//! SHA-256 and Ed25519 verification of downloaded artifacts.

use std::path::Path;

use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{UpdateError, UpdateResult};

pub type Sha256Digest = [u8; 32];

/// Placeholder for "no checksum declared".
pub const NO_CHECKSUM: Sha256Digest = [0u8; 32];

pub fn is_declared(digest: &Sha256Digest) -> bool {
    *digest != NO_CHECKSUM
}

pub fn sha256_bytes(data: &[u8]) -> Sha256Digest {
    Sha256::digest(data).into()
}

/// Calculate the SHA-256 digest of a file.
pub async fn sha256_file(path: &Path) -> UpdateResult<Sha256Digest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().into())
}

/// Compare a computed digest against a declared one. Undeclared digests pass.
pub fn verify_checksum(expected: &Sha256Digest, actual: &Sha256Digest) -> UpdateResult<()> {
    if is_declared(expected) && expected != actual {
        return Err(UpdateError::ChecksumMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

/// Verify a detached Ed25519 signature over an artifact's SHA-256 digest.
pub fn verify_signature(
    public_key: &[u8; 32],
    digest: &Sha256Digest,
    signature: &[u8],
) -> UpdateResult<()> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|e| UpdateError::SignatureInvalid {
        reason: format!("invalid public key: {e}"),
    })?;
    let bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| UpdateError::SignatureInvalid {
            reason: format!("signature is {} bytes, expected 64", signature.len()),
        })?;
    let signature = Signature::from_bytes(&bytes);
    key.verify_strict(digest, &signature)
        .map_err(|e| UpdateError::SignatureInvalid {
            reason: e.to_string(),
        })
}
