//! `syncedResourceVersion` digest, spec.md §3/§4.E step 4.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// SHA-256 over `generation || sorted(labels) || sorted(annotations)`,
/// base16-encoded. `BTreeMap` iteration is already key-sorted, giving a
/// stable digest independent of map insertion order.
pub fn resource_version_digest(
    generation: i64,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(generation.to_le_bytes());
    for (k, v) in labels {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b";");
    }
    for (k, v) in annotations {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_map_ordering() {
        let mut labels_a = BTreeMap::new();
        labels_a.insert("b".to_string(), "2".to_string());
        labels_a.insert("a".to_string(), "1".to_string());

        let mut labels_b = BTreeMap::new();
        labels_b.insert("a".to_string(), "1".to_string());
        labels_b.insert("b".to_string(), "2".to_string());

        let empty = BTreeMap::new();
        assert_eq!(
            resource_version_digest(1, &labels_a, &empty),
            resource_version_digest(1, &labels_b, &empty)
        );
    }

    #[test]
    fn changes_with_generation() {
        let empty = BTreeMap::new();
        assert_ne!(
            resource_version_digest(1, &empty, &empty),
            resource_version_digest(2, &empty, &empty)
        );
    }
}
