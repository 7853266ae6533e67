//! Round-trip check for values crossing the process boundary.
//!
//! A value is serializable when encoding it and decoding the result yields
//! an equal value. Non-finite floats and structured map keys fail this.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// Encode `value`, decode it back and compare.
///
/// Returns the wire representation on success.
pub fn verify<T>(value: &T) -> Result<Value>
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    let encoded = serde_json::to_string(value)
        .map_err(|e| Error::Serialization(format!("Failed to encode value: {}", e)))?;
    let decoded: T = serde_json::from_str(&encoded)
        .map_err(|e| Error::Serialization(format!("Failed to decode value: {}", e)))?;
    if &decoded != value {
        return Err(Error::Serialization(
            "Value changed across serialization".to_string(),
        ));
    }

    serde_json::from_str(&encoded)
        .map_err(|e| Error::Serialization(format!("Failed to decode value: {}", e)))
}

/// Whether `value` survives the round trip.
pub fn is_serializable<T>(value: &T) -> bool
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    verify(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i64,
        label: String,
    }

    #[test]
    fn test_plain_values_pass() {
        assert_eq!(verify(&json!({"a": [1, 2, null]})).unwrap(), json!({"a": [1, 2, null]}));
        assert_eq!(
            verify(&Point { x: 1, label: "one".to_string() }).unwrap(),
            json!({"x": 1, "label": "one"})
        );
    }

    #[test]
    fn test_non_finite_floats_fail() {
        assert!(!is_serializable(&f64::NAN));
        assert!(!is_serializable(&f64::INFINITY));
        assert!(!is_serializable(&vec![1.0, f64::NEG_INFINITY]));
        assert!(is_serializable(&1.5f64));
    }

    #[test]
    fn test_structured_map_keys_fail() {
        let mut map: BTreeMap<(i32, i32), String> = BTreeMap::new();
        map.insert((1, 2), "pair".to_string());
        assert!(!is_serializable(&map));
    }

    #[test]
    fn test_lossy_option_fails() {
        // `Some(None)` encodes as `null` and decodes as `None`.
        let value: Option<Option<i32>> = Some(None);
        assert!(!is_serializable(&value));
    }
}
