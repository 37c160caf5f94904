use sha2::{Digest, Sha256};

/// SHA-256 of a bearer credential, hex encoded (64 characters).
///
/// Sessions are indexed by this value so the raw credential never has to be
/// kept.
pub fn fingerprint(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}
