//! Cache keys

use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value;

use crate::error::{Error, Result};

/// Address of one cached value.
///
/// With an `hfield` the value lives in a field of the hash at
/// [`storage_key`](Self::storage_key), so every field of that hash lands on
/// the same shard. Equality is by [`full_key`](Self::full_key).
#[derive(Clone, Debug)]
pub struct CacheKey {
    namespace: String,
    key: String,
    hfield: Option<String>,
    full_key: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self::build(namespace.into(), key.into(), None)
    }

    /// Key addressing a field of a hash
    pub fn with_field(
        namespace: impl Into<String>,
        key: impl Into<String>,
        hfield: impl Into<String>,
    ) -> Self {
        Self::build(namespace.into(), key.into(), Some(hfield.into()))
    }

    fn build(namespace: String, key: String, hfield: Option<String>) -> Self {
        let mut full_key = prefixed(&namespace, &key);
        if let Some(field) = &hfield {
            full_key.push(':');
            full_key.push_str(field);
        }
        Self {
            namespace,
            key,
            hfield,
            full_key,
        }
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn hfield(&self) -> Option<&str> {
        self.hfield.as_deref()
    }

    /// `namespace:key[:hfield]`
    #[inline]
    pub fn full_key(&self) -> &str {
        &self.full_key
    }

    /// Key sent to the store: `namespace:key`
    pub fn storage_key(&self) -> String {
        prefixed(&self.namespace, &self.key)
    }

    /// Key of the side record describing how this value was produced
    pub fn side_record_key(&self) -> String {
        let mut side = prefixed(&self.namespace, "$KEY:");
        side.push_str(&self.key);
        if let Some(field) = &self.hfield {
            side.push(':');
            side.push_str(field);
        }
        side
    }

    /// Region index member: `[namespace, key, hfield]` as JSON
    pub fn to_member(&self) -> Vec<u8> {
        let hfield = match &self.hfield {
            Some(field) => Value::String(field.clone()),
            None => Value::Null,
        };
        Value::Array(vec![
            Value::String(self.namespace.clone()),
            Value::String(self.key.clone()),
            hfield,
        ])
        .to_string()
        .into_bytes()
    }

    pub fn from_member(member: &[u8]) -> Result<Self> {
        let (namespace, key, hfield): (String, String, Option<String>) =
            serde_json::from_slice(member)
                .map_err(|e| Error::Serialization(format!("bad region member: {}", e)))?;
        Ok(Self::build(namespace, key, hfield))
    }
}

/// `namespace:rest`, or just `rest` without a namespace
pub(crate) fn prefixed(namespace: &str, rest: &str) -> String {
    if namespace.is_empty() {
        rest.to_string()
    } else {
        format!("{}:{}", namespace, rest)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.full_key == other.full_key
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full_key.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_key)
    }
}
