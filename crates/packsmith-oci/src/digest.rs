//! Content digests.

use sha2::{Digest, Sha256};

/// Digest algorithm prefix used for all content.
pub const SHA256: &str = "sha256";

/// Compute the `sha256:<hex>` digest of `data`.
#[must_use]
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{SHA256}:{}", hex::encode(Sha256::digest(data)))
}

/// Split a digest into `(algorithm, hex)`.
///
/// Returns `None` unless the digest is `sha256:` followed by 64 lowercase hex
/// characters.
#[must_use]
pub fn split_digest(digest: &str) -> Option<(&str, &str)> {
    let (algorithm, hex) = digest.split_once(':')?;
    let valid = algorithm == SHA256
        && hex.len() == 64
        && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    valid.then_some((algorithm, hex))
}
