use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// 32 random bytes, base64url without padding (43 chars)
pub fn generate_claim_token() -> String {
    let mut bytes = [0u8; 32];
    thread_rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex of the opaque token; the only form that is persisted
pub fn hash_claim_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Six decimal digits, zero padded
pub fn generate_verification_code() -> String {
    format!("{:06}", thread_rng().gen_range(0..1_000_000u32))
}

/// The token id is mixed in so equal codes on different tokens hash apart
pub fn hash_verification_code(token_id: Uuid, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token_id.as_bytes());
    hasher.update(b":");
    hasher.update(code.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of two hex digests
pub fn digests_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
