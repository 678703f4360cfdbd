//! Content-addressed keys for cached commit messages.

use std::fmt;

use sha2::{Digest, Sha256};

/// Number of diff characters that participate in the key.
pub const KEY_DIFF_PREFIX_CHARS: usize = 500;

/// Length of the hex key kept from the SHA-256 digest.
pub const KEY_HEX_LEN: usize = 16;

/// Cache key for a `(model, diff)` pair.
///
/// Only the first [`KEY_DIFF_PREFIX_CHARS`] characters of the diff are hashed,
/// so two diffs that differ past that point share an entry. The model id is part
/// of the hashed content, which keeps entries from different models apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(model: &str, diff: &str) -> Self {
        let prefix_end = diff
            .char_indices()
            .nth(KEY_DIFF_PREFIX_CHARS)
            .map_or(diff.len(), |(idx, _)| idx);

        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(b":");
        hasher.update(diff[..prefix_end].as_bytes());
        let digest = hex::encode(hasher.finalize());

        Self(digest[..KEY_HEX_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the output blob for this key.
    pub fn blob_file_name(&self) -> String {
        format!("{}.txt", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Filesystem-safe form of a model id (`org/name` becomes `org--name`).
pub fn model_file_stem(model: &str) -> String {
    model.replace('/', "--")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_sixteen_lowercase_hex_chars() {
        let key = CacheKey::derive("distilgpt2", "diff --git a/x b/x");
        assert_eq!(key.as_str().len(), KEY_HEX_LEN);
        assert!(
            key.as_str()
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
    }

    #[test]
    fn key_matches_sha256_of_model_colon_diff() {
        // sha256("m:d") computed independently
        let expected = {
            let mut h = Sha256::new();
            h.update(b"m:d");
            hex::encode(h.finalize())[..16].to_string()
        };
        assert_eq!(CacheKey::derive("m", "d").as_str(), expected);
    }

    #[test]
    fn different_models_give_different_keys() {
        let diff = "+fn main() {}";
        assert_ne!(
            CacheKey::derive("distilgpt2", diff),
            CacheKey::derive("HuggingFaceTB/SmolLM-135M", diff)
        );
    }

    #[test]
    fn only_first_500_chars_are_hashed() {
        let base = "x".repeat(KEY_DIFF_PREFIX_CHARS);
        let a = format!("{base}tail-one");
        let b = format!("{base}a completely different tail");
        assert_eq!(CacheKey::derive("m", &a), CacheKey::derive("m", &b));

        let mut c = base.clone();
        c.replace_range(499..500, "y");
        assert_ne!(CacheKey::derive("m", &base), CacheKey::derive("m", &c));
    }

    #[test]
    fn prefix_counts_characters_not_bytes() {
        let base = "é".repeat(KEY_DIFF_PREFIX_CHARS);
        let a = format!("{base}1");
        let b = format!("{base}2");
        assert_eq!(CacheKey::derive("m", &a), CacheKey::derive("m", &b));
    }

    #[test]
    fn model_file_stem_replaces_slashes() {
        assert_eq!(
            model_file_stem("TinyLlama/TinyLlama-1.1B-Chat-v1.0"),
            "TinyLlama--TinyLlama-1.1B-Chat-v1.0"
        );
        assert_eq!(model_file_stem("distilgpt2"), "distilgpt2");
    }
}
