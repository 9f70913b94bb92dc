//! SHA-256 digest helpers and chain-id computation.
//!
//! Layers are identified by the SHA-256 of their canonical tar; images by
//! the SHA-256 of their canonical JSON. The cache key for a prefix of
//! build steps is a running chain digest over the steps' digests.

use std::io::Read;

use kubeimage_core::Result;
use sha2::{Digest, Sha256};

/// Hex length of a SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Compute the SHA-256 of a byte slice as lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 of everything a reader yields.
///
/// Returns the hex digest and the number of bytes read.
pub fn sha256_reader<R: Read>(mut reader: R) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 32 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Whether a string is a plausible hex SHA-256.
pub fn is_digest_hex(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Strip a leading `sha256:` prefix if present.
pub fn strip_algo_prefix(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Extend a chain digest with one more item.
///
/// `chain(parent, item) = SHA256(parent ‖ " " ‖ item)`; an empty parent
/// starts the chain at the item itself. Used both to fold a base image's
/// layer ids and to extend the cache chain per instruction.
pub fn chain_digest(parent: &str, item: &str) -> String {
    if parent.is_empty() {
        item.to_string()
    } else {
        sha256_bytes(format!("{} {}", parent, item).as_bytes())
    }
}

/// Fold a chain digest over an ordered list of items.
pub fn chain_of(items: &[String]) -> String {
    items
        .iter()
        .fold(String::new(), |acc, item| chain_digest(&acc, item))
}

/// Digest of one build instruction, the unit the cache chain advances by.
///
/// `SHA256(kind ‖ NUL ‖ value ‖ NUL ‖ input_digest?)`. The input digest
/// covers what the raw instruction text cannot: a local `COPY` passes the
/// digest of its source tree, a `RUN` the digest of its expanded command
/// line, so mutating a source or overriding an `ARG` busts the chain.
pub fn instruction_digest(kind: &str, value: &str, input_digest: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(value.as_bytes());
    hasher.update([0u8]);
    if let Some(digest) = input_digest {
        hasher.update(digest.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_bytes_known_value() {
        assert_eq!(
            sha256_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_sha256_reader_matches_bytes() {
        let data = b"cluster image payload".to_vec();
        let (digest, size) = sha256_reader(&data[..]).unwrap();
        assert_eq!(digest, sha256_bytes(&data));
        assert_eq!(size, data.len() as u64);
    }

    #[test]
    fn test_is_digest_hex() {
        assert!(is_digest_hex(&"a".repeat(64)));
        assert!(!is_digest_hex(&"a".repeat(63)));
        assert!(!is_digest_hex(&"g".repeat(64)));
    }

    #[test]
    fn test_strip_algo_prefix() {
        assert_eq!(strip_algo_prefix("sha256:abc"), "abc");
        assert_eq!(strip_algo_prefix("abc"), "abc");
    }

    #[test]
    fn test_chain_starts_at_first_item() {
        let first = sha256_bytes(b"layer0");
        assert_eq!(chain_digest("", &first), first);
    }

    #[test]
    fn test_chain_is_pure() {
        let a = sha256_bytes(b"a");
        let b = sha256_bytes(b"b");
        let once = chain_digest(&chain_digest("", &a), &b);
        let twice = chain_digest(&chain_digest("", &a), &b);
        assert_eq!(once, twice);
        assert_eq!(chain_of(&[a, b]), once);
    }

    #[test]
    fn test_chain_order_sensitive() {
        let a = sha256_bytes(b"a");
        let b = sha256_bytes(b"b");
        assert_ne!(
            chain_of(&[a.clone(), b.clone()]),
            chain_of(&[b, a])
        );
    }

    #[test]
    fn test_chain_prefix_property() {
        // chain(0..i) depends only on the first i items
        let items: Vec<String> = (0..4).map(|i| sha256_bytes(format!("l{i}").as_bytes())).collect();
        let prefix = chain_of(&items[..2]);
        let full = items[2..]
            .iter()
            .fold(prefix.clone(), |acc, item| chain_digest(&acc, item));
        assert_eq!(full, chain_of(&items));
    }

    #[test]
    fn test_instruction_digest_input_disambiguates() {
        let without = instruction_digest("COPY", "charts charts", None);
        let with = instruction_digest("COPY", "charts charts", Some("abc"));
        assert_ne!(without, with);
        // the same RUN line with differently expanded args keys differently
        let one = instruction_digest("RUN", "echo $V", Some("digest-of-echo-1"));
        let two = instruction_digest("RUN", "echo $V", Some("digest-of-echo-2"));
        assert_ne!(one, two);
    }

    #[test]
    fn test_instruction_digest_fields_not_ambiguous() {
        // NUL separators keep (kind, value) pairs from colliding
        let a = instruction_digest("RUN", "xy", None);
        let b = instruction_digest("RUNx", "y", None);
        assert_ne!(a, b);
    }
}
