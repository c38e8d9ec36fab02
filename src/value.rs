//! Dynamic Values
//!
//! Option and meta values have no fixed schema. `Value` models the loosely
//! typed values the platform stores: scalars, ordered arrays with integer or
//! string keys, and objects carrying a class name.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================
// Array Keys
// ============================================

/// Key of an ordered array entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArrayKey {
    Int(i64),
    Str(String),
}

impl ArrayKey {
    /// Build a key from a string, normalizing canonical decimal integers
    /// (`"5"`, `"-12"`) to integer keys the way the platform's arrays do.
    pub fn normalized(key: &str) -> Self {
        if is_canonical_int(key) {
            if let Ok(n) = key.parse::<i64>() {
                return ArrayKey::Int(n);
            }
        }
        ArrayKey::Str(key.to_string())
    }
}

fn is_canonical_int(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return false;
    }
    // "-0" stays a string key
    !(s.starts_with('-') && digits == "0")
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayKey::Int(n) => write!(f, "{}", n),
            ArrayKey::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ArrayKey {
    fn from(n: i64) -> Self {
        ArrayKey::Int(n)
    }
}

impl From<&str> for ArrayKey {
    fn from(s: &str) -> Self {
        ArrayKey::normalized(s)
    }
}

impl From<String> for ArrayKey {
    fn from(s: String) -> Self {
        ArrayKey::normalized(&s)
    }
}

// ============================================
// Values
// ============================================

/// A stored value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Ordered array; insertion order is preserved
    Array(Vec<(ArrayKey, Value)>),
    Object {
        class: String,
        properties: Vec<(String, Value)>,
    },
}

impl Value {
    /// Build a list (keys `0..n`)
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (ArrayKey::Int(i as i64), v.into()))
                .collect(),
        )
    }

    /// Build an associative array
    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<ArrayKey>,
        V: Into<Value>,
    {
        Value::Array(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build an object of the given class
    pub fn object<I, V>(class: &str, properties: I) -> Self
    where
        I: IntoIterator<Item = (String, V)>,
        V: Into<Value>,
    {
        Value::Object {
            class: class.to_string(),
            properties: properties.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }

    /// Emptiness as the platform defines it: null, false, 0, 0.0, "",
    /// "0" and empty arrays are empty. Objects never are.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(n) => *n == 0,
            Value::Float(f) => *f == 0.0,
            Value::String(s) => s.is_empty() || s == "0",
            Value::Array(items) => items.is_empty(),
            Value::Object { .. } => false,
        }
    }

    pub fn is_truthy(&self) -> bool {
        !self.is_empty()
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object { .. })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[(ArrayKey, Value)]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up an array entry by key
    pub fn get(&self, key: &ArrayKey) -> Option<&Value> {
        self.as_array()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Number of array entries, if this is an array
    pub fn count(&self) -> Option<usize> {
        self.as_array().map(<[_]>::len)
    }

    /// True for arrays whose keys are all integers
    pub fn is_numeric_array(&self) -> bool {
        match self {
            Value::Array(items) => items.iter().all(|(k, _)| matches!(k, ArrayKey::Int(_))),
            _ => false,
        }
    }

    /// String form used when writing to storage.
    ///
    /// Containers are expected to have gone through `maybe_serialize`
    /// already; they are serialized here as a fallback.
    pub fn to_db_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(true) => "1".to_string(),
            Value::Bool(false) => String::new(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_float(*f),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object { .. } => crate::serialize::serialize(self),
        }
    }
}

/// Float text shared by the string cast and the `d:` encoding
pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NAN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e17).contains(&abs) {
        let sci = format!("{:e}", f);
        let (mantissa, exp) = sci.split_once('e').unwrap_or((&sci, "0"));
        let mantissa = if mantissa.contains('.') {
            mantissa.to_string()
        } else {
            format!("{}.0", mantissa)
        };
        return match exp.strip_prefix('-') {
            Some(e) => format!("{}E-{}", mantissa, e),
            None => format!("{}E+{}", mantissa, exp),
        };
    }
    format!("{}", f)
}

// ============================================
// Conversions
// ============================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::list(items.into_iter().map(Value::from)),
            serde_json::Value::Object(map) => {
                Value::map(map.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) if value.is_list() => {
                serde_json::Value::Array(items.iter().map(|(_, v)| v.into()).collect())
            }
            Value::Array(items) => serde_json::Value::Object(
                items
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.into()))
                    .collect(),
            ),
            Value::Object { properties, .. } => serde_json::Value::Object(
                properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl Value {
    /// True for arrays keyed exactly `0..n` in order
    pub fn is_list(&self) -> bool {
        match self {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .all(|(i, (k, _))| *k == ArrayKey::Int(i as i64)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalization() {
        assert_eq!(ArrayKey::from("5"), ArrayKey::Int(5));
        assert_eq!(ArrayKey::from("-12"), ArrayKey::Int(-12));
        assert_eq!(ArrayKey::from("05"), ArrayKey::Str("05".into()));
        assert_eq!(ArrayKey::from("-0"), ArrayKey::Str("-0".into()));
        assert_eq!(ArrayKey::from("key"), ArrayKey::Str("key".into()));
    }

    #[test]
    fn test_emptiness() {
        assert!(Value::Null.is_empty());
        assert!(Value::from("0").is_empty());
        assert!(Value::from("").is_empty());
        assert!(Value::Int(0).is_empty());
        assert!(Value::list(Vec::<Value>::new()).is_empty());
        assert!(!Value::from("a").is_empty());
        assert!(!Value::object("stdClass", Vec::<(String, Value)>::new()).is_empty());
    }

    #[test]
    fn test_db_string_cast() {
        assert_eq!(Value::Bool(true).to_db_string(), "1");
        assert_eq!(Value::Bool(false).to_db_string(), "");
        assert_eq!(Value::Null.to_db_string(), "");
        assert_eq!(Value::Int(-3).to_db_string(), "-3");
        assert_eq!(Value::Float(0.5).to_db_string(), "0.5");
        assert_eq!(Value::Float(1e25).to_db_string(), "1.0E+25");
        assert_eq!(Value::Float(1.5e-7).to_db_string(), "1.5E-7");
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"a": [1, 2], "b": "x"});
        let value = Value::from(json.clone());
        assert_eq!(
            value.get(&ArrayKey::from("a")),
            Some(&Value::list([1i64, 2]))
        );
        assert_eq!(serde_json::Value::from(&value), json);
    }

    #[test]
    fn test_list_detection() {
        assert!(Value::list(["a", "b"]).is_list());
        assert!(!Value::map([(1i64, "a")]).is_list());
        assert!(Value::map([(1i64, "a")]).is_numeric_array());
    }
}
