use serde_json::Value;
use std::hash::{Hash, Hasher};

/// Wraps a JSON scalar/array request id so it can key a `HashMap`. JSON
/// numbers, strings, and arrays of those hash and compare structurally --
/// `serde_json::Value` itself is `Eq` but not `Hash`, so this newtype carries
/// the canonical serialized form alongside the value for hashing.
#[derive(Debug, Clone)]
pub struct RequestId {
    value: Value,
    canonical: String,
}

impl RequestId {
    pub fn new(value: Value) -> Self {
        let canonical = value.to_string();
        Self { value, canonical }
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl PartialEq for RequestId {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for RequestId {}

impl Hash for RequestId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl From<Value> for RequestId {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn equal_values_hash_equal() {
        let a = RequestId::new(json!(1));
        let b = RequestId::new(json!(1));
        let mut map = HashMap::new();
        map.insert(a, "first");
        assert_eq!(map.get(&b), Some(&"first"));
    }

    #[test]
    fn distinct_types_are_distinct_ids() {
        let a = RequestId::new(json!(1));
        let b = RequestId::new(json!("1"));
        assert_ne!(a, b);
    }
}
