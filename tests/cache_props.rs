//! Property-based tests for cache keys and the store.
//!
//! - keys depend only on the model and the first 500 characters of the diff
//! - keys are always 16 lowercase hex characters
//! - a fresh `put` is always readable under any model name

use proptest::prelude::*;
use tempfile::TempDir;

use llmcommit::cache::key::{KEY_DIFF_PREFIX_CHARS, KEY_HEX_LEN};
use llmcommit::cache::{CacheKey, CacheStore};

/// Diff-like text, including multi-byte characters.
fn diff_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z +\\-\n]{0,700}",
        "[α-ω日本語 \n]{0,700}",
        Just("diff --git a/x b/x\n".repeat(40)),
    ]
}

fn model_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("distilgpt2".to_string()),
        Just("HuggingFaceTB/SmolLM-135M".to_string()),
        "[a-zA-Z0-9/_.-]{1,40}",
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn prop_key_is_fixed_width_hex(model in model_strategy(), diff in diff_strategy()) {
        let key = CacheKey::derive(&model, &diff);
        prop_assert_eq!(key.as_str().len(), KEY_HEX_LEN);
        prop_assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn prop_key_ignores_text_past_prefix(
        model in model_strategy(),
        diff in diff_strategy(),
        tail in "[a-z\n]{1,50}",
    ) {
        let prefix: String = diff.chars().take(KEY_DIFF_PREFIX_CHARS).collect();
        let padded: String = prefix
            .chars()
            .chain(std::iter::repeat('x'))
            .take(KEY_DIFF_PREFIX_CHARS)
            .collect();
        prop_assert_eq!(
            CacheKey::derive(&model, &padded),
            CacheKey::derive(&model, &format!("{padded}{tail}"))
        );
    }

    #[test]
    fn prop_key_separates_models(diff in diff_strategy(), a in model_strategy(), b in model_strategy()) {
        prop_assume!(a != b);
        prop_assert_ne!(CacheKey::derive(&a, &diff), CacheKey::derive(&b, &diff));
    }

    #[test]
    fn prop_put_then_get(model in model_strategy(), diff in diff_strategy(), message in "[ -~]{0,80}") {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::new(tmp.path());
        store.put(&diff, &model, &message).unwrap();
        prop_assert_eq!(store.get(&diff, &model), Some(message));
    }
}
