//! Self-describing dynamic value used for late-bound component method calls
//! and cross-thread envelope payloads.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Variant {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Variant>),
    Map(BTreeMap<String, Variant>),
}

impl Variant {
    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Variant::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Variant::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Variant::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Variant]> {
        match self {
            Variant::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Variant>> {
        match self {
            Variant::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Map field access; `Null` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> &Variant {
        static NULL: Variant = Variant::Null;
        match self {
            Variant::Map(m) => m.get(key).unwrap_or(&NULL),
            _ => &NULL,
        }
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v as i64)
    }
}

impl From<u32> for Variant {
    fn from(v: u32) -> Self {
        Variant::Int(v as i64)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Float(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::Str(v.to_owned())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::Str(v)
    }
}

impl From<Bytes> for Variant {
    fn from(v: Bytes) -> Self {
        Variant::Bytes(v)
    }
}

impl From<Vec<u8>> for Variant {
    fn from(v: Vec<u8>) -> Self {
        Variant::Bytes(Bytes::from(v))
    }
}

impl From<Vec<Variant>> for Variant {
    fn from(v: Vec<Variant>) -> Self {
        Variant::List(v)
    }
}

impl From<BTreeMap<String, Variant>> for Variant {
    fn from(v: BTreeMap<String, Variant>) -> Self {
        Variant::Map(v)
    }
}

impl FromIterator<(String, Variant)> for Variant {
    fn from_iter<I: IntoIterator<Item = (String, Variant)>>(iter: I) -> Self {
        Variant::Map(iter.into_iter().collect())
    }
}
