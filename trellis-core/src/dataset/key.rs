use serde_json::Value;
use sha2::{Digest, Sha256};

use super::record::DatasetParameters;

/// Derive a dataset key.
///
/// The hash covers the parameters in key order, a salt of `salt_time` (the
/// current second, plus any reroll offset), the query label and the parent
/// key. Identical submissions within the same second therefore collide, which
/// is what [`KeyCollisionPolicy`](crate::config::KeyCollisionPolicy) decides
/// about.
pub fn get_key(
    query: &str,
    parameters: &DatasetParameters,
    parent: Option<&str>,
    salt_time: i64,
) -> String {
    let mut salted = parameters.to_sorted_map();
    salted.insert("_salt".to_string(), Value::from(salt_time));

    // BTreeMap serialises in key order, so the encoding is stable.
    let encoded = serde_json::to_string(&salted).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    hasher.update(query.as_bytes());
    hasher.update(parent.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> DatasetParameters {
        DatasetParameters::default()
            .with_label("cats")
            .with_extra("board", json!("pol"))
    }

    #[test]
    fn same_inputs_same_second_collide() {
        let a = get_key("cats", &params(), None, 1_000);
        let b = get_key("cats", &params(), None, 1_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn salt_query_and_parent_all_contribute() {
        let base = get_key("cats", &params(), None, 1_000);
        assert_ne!(base, get_key("cats", &params(), None, 1_001));
        assert_ne!(base, get_key("dogs", &params(), None, 1_000));
        assert_ne!(base, get_key("cats", &params(), Some("parent"), 1_000));
    }

    #[test]
    fn extra_key_order_does_not_matter() {
        let one = DatasetParameters::default()
            .with_extra("a", json!(1))
            .with_extra("b", json!(2));
        let two = DatasetParameters::default()
            .with_extra("b", json!(2))
            .with_extra("a", json!(1));
        assert_eq!(get_key("q", &one, None, 5), get_key("q", &two, None, 5));
    }
}
