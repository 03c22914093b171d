use sha2::{Digest, Sha256};

/// Hash an ordered list of strings into a stable hex digest.
///
/// Parts are joined with a `:::` separator before hashing, so the digest is a
/// pure function of the part values and their order. This is the primitive
/// underneath stage signatures and lock file names.
pub fn sha256_hex<S: AsRef<str>>(parts: &[S]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(":::");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Flatten a string map into sorted `k=v` pairs for hashing.
pub fn sorted_pairs(map: &std::collections::BTreeMap<String, String>) -> Vec<String> {
    map.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn digest_is_deterministic() {
        let a = sha256_hex(&["alpine:3.18", "echo hi"]);
        let b = sha256_hex(&["alpine:3.18", "echo hi"]);
        assert_eq!(a, b);
    }

    #[test]
    fn digest_is_order_sensitive() {
        assert_ne!(sha256_hex(&["a", "b"]), sha256_hex(&["b", "a"]));
    }

    #[test]
    fn digest_distinguishes_part_boundaries() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(sha256_hex(&["ab", "c"]), sha256_hex(&["a", "bc"]));
    }

    #[test]
    fn digest_is_hex() {
        let d = sha256_hex(&["anything"]);
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn map_pairs_are_sorted() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), "2".to_string());
        map.insert("a".to_string(), "1".to_string());
        assert_eq!(sorted_pairs(&map), vec!["a=1", "b=2"]);
    }
}
