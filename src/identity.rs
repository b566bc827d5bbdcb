//! Content identity.
//!
//! The fingerprint is a SHA-256 digest over a canonical JSON encoding of the request's
//! semantic content. Object keys are sorted at every depth so parameter objects that differ
//! only in key order hash identically; array order is significant. Tags are not part of the
//! fingerprint.

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::domain::request::{ContentHash, RequestContent};

/// Compute the fingerprint of `content`.
pub fn content_hash(content: &RequestContent) -> ContentHash {
    let history: Vec<Value> = content
        .history
        .iter()
        .map(|message| json!({ "role": message.role, "content": message.content }))
        .collect();

    let document = json!({
        "model": content.model,
        "history": history,
        "query": content.query,
        "generation_params": canonicalize(&content.generation_params),
        "duplication_index": content.duplication_index,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(&document));
    ContentHash(hex::encode(hasher.finalize()))
}

/// Rebuild `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_bytes(value: &Value) -> Vec<u8> {
    // Value's Display is compact JSON and never fails.
    canonicalize(value).to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::ChatMessage;

    fn content() -> RequestContent {
        RequestContent::new("gpt-test", "What is the capital of France?")
            .with_history(vec![ChatMessage::system("Answer tersely.")])
            .with_params(json!({"temperature": 0.2, "max_tokens": 64}))
    }

    #[test]
    fn test_hash_is_deterministic_hex() {
        let first = content_hash(&content());
        let second = content_hash(&content());

        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
        assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_param_key_order_does_not_matter() {
        let reordered = content().with_params(json!({"max_tokens": 64, "temperature": 0.2}));
        assert_eq!(content_hash(&content()), content_hash(&reordered));

        let nested_a = content().with_params(json!({"stop": {"b": 1, "a": [2, 1]}}));
        let nested_b = content().with_params(json!({"stop": {"a": [2, 1], "b": 1}}));
        assert_eq!(content_hash(&nested_a), content_hash(&nested_b));
    }

    #[test]
    fn test_array_order_matters() {
        let a = content().with_params(json!({"stop": ["x", "y"]}));
        let b = content().with_params(json!({"stop": ["y", "x"]}));
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_every_field_participates() {
        let base = content_hash(&content());

        let mut model = content();
        model.model = "gpt-other".to_string();
        assert_ne!(base, content_hash(&model));

        let mut query = content();
        query.query.push('!');
        assert_ne!(base, content_hash(&query));

        let history = content().with_history(vec![ChatMessage::system("Answer at length.")]);
        assert_ne!(base, content_hash(&history));

        let params = content().with_params(json!({"temperature": 0.3, "max_tokens": 64}));
        assert_ne!(base, content_hash(&params));

        let duplicate = content().with_duplication_index(1);
        assert_ne!(base, content_hash(&duplicate));
    }
}
