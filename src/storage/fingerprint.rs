//! Content fingerprints used as dataset ids.

use xxhash_rust::xxh64::xxh64;

/// Length of a rendered fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

/// Content fingerprint of raw upload bytes: XXH64, 16 lowercase hex digits.
///
/// Doubles as the dataset id, so identical uploads always land in the same
/// directory.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:016x}", xxh64(bytes, 0))
}

/// Returns true if `id` has the shape of a fingerprint.
///
/// Callers use this before joining an externally supplied id onto a
/// filesystem path.
pub fn is_fingerprint(id: &str) -> bool {
    id.len() == FINGERPRINT_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
