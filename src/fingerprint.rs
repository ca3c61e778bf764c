//! Client fingerprint ("beam ID").
//!
//! A stable one-way identifier derived from client IP and user agent, used
//! as the audit log key so entries for one client correlate without the raw
//! IP or UA serving as a reversible key. Computed once per request and
//! reused for its lifetime.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Fixed output width of a beam ID.
pub const BEAM_ID_LENGTH: usize = 16;

/// Digest iterations. Cheap key stretching so the IP/UA pair is not
/// recoverable from a single hash table.
const HASH_ROUNDS: usize = 1000;

/// Bytes of the final digest that survive into the encoded ID.
const DIGEST_PREFIX_LEN: usize = 11;

/// Derive a beam ID from the concatenated identifiable parts.
///
/// Deterministic: the same `(ip, user_agent)` pair always yields the same
/// ID. The result is always exactly [`BEAM_ID_LENGTH`] characters, padded
/// with `=` when the encoding comes up short.
pub fn beam_id(parts: &[&str]) -> String {
    let mut buf: Vec<u8> = parts.concat().into_bytes();
    for _ in 0..HASH_ROUNDS {
        buf = Sha256::digest(&buf).to_vec();
    }

    let mut id = URL_SAFE_NO_PAD.encode(&buf[..DIGEST_PREFIX_LEN]);
    id.truncate(BEAM_ID_LENGTH);
    while id.len() < BEAM_ID_LENGTH {
        id.push('=');
    }
    id
}
