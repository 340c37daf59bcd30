use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::ast::Value;
use crate::collections::{PersistentVector, Seq};
use crate::error::CinderError;

#[derive(Clone, Default)]
pub struct PersistentMap {
    entries: im::HashMap<Value, Value>,
    meta: Option<Arc<PersistentMap>>,
}

impl PersistentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Self {
            entries: pairs.into_iter().collect(),
            meta: None,
        }
    }

    pub(crate) fn from_im(entries: im::HashMap<Value, Value>) -> Self {
        Self { entries, meta: None }
    }

    pub(crate) fn to_im(&self) -> im::HashMap<Value, Value> {
        self.entries.clone()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn assoc(&self, key: Value, value: Value) -> PersistentMap {
        Self {
            entries: self.entries.update(key, value),
            meta: self.meta.clone(),
        }
    }

    /// Removes `key`; a map without the key comes back unchanged.
    pub fn without(&self, key: &Value) -> PersistentMap {
        if !self.entries.contains_key(key) {
            return self.clone();
        }
        Self {
            entries: self.entries.without(key),
            meta: self.meta.clone(),
        }
    }

    pub fn val_at(&self, key: &Value) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry_at(&self, key: &Value) -> Option<Value> {
        self.entries
            .get(key)
            .map(|v| Value::vector(vec![key.clone(), v.clone()]))
    }

    /// Adds an entry given as a `[k v]` pair, or merges another map.
    pub fn cons(&self, entry: &Value) -> Result<PersistentMap, CinderError> {
        match entry {
            Value::Vector(pair) if pair.count() == 2 => {
                let key = pair.nth(0).unwrap_or(Value::Nil);
                let value = pair.nth(1).unwrap_or(Value::Nil);
                Ok(self.assoc(key, value))
            }
            Value::Map(other) => Ok(other
                .iter()
                .fold(self.clone(), |acc, (k, v)| acc.assoc(k.clone(), v.clone()))),
            Value::Nil => Ok(self.clone()),
            other => Err(CinderError::illegal_argument(format!(
                "map entry must be a [key value] vector, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn iter(&self) -> im::hashmap::Iter<'_, Value, Value> {
        self.entries.iter()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.keys().cloned().collect()
    }

    pub fn vals(&self) -> Vec<Value> {
        self.entries.values().cloned().collect()
    }

    pub fn seq(&self) -> Option<Seq> {
        let pairs: im::Vector<Value> = self
            .entries
            .iter()
            .map(|(k, v)| Value::Vector(PersistentVector::from_vec(vec![k.clone(), v.clone()])))
            .collect();
        Seq::from_indexed(pairs, 0)
    }

    pub fn empty(&self) -> PersistentMap {
        Self {
            entries: im::HashMap::new(),
            meta: self.meta.clone(),
        }
    }

    pub fn meta(&self) -> Option<&PersistentMap> {
        self.meta.as_deref()
    }

    pub fn with_meta(&self, meta: Option<PersistentMap>) -> Self {
        Self {
            entries: self.entries.clone(),
            meta: meta.map(Arc::new),
        }
    }

    pub fn ptr_eq(&self, other: &PersistentMap) -> bool {
        self.entries.ptr_eq(&other.entries)
    }

    /// Order-independent hash of the entries.
    pub fn unordered_hash(&self) -> u64 {
        self.entries.iter().fold(0u64, |acc, (k, v)| {
            let mut hasher = DefaultHasher::new();
            k.hash(&mut hasher);
            v.hash(&mut hasher);
            acc.wrapping_add(hasher.finish())
        })
    }
}

impl PartialEq for PersistentMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl fmt::Debug for PersistentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::value_format::format_value(&Value::Map(self.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(name: &str) -> Value {
        Value::keyword(name)
    }

    #[test]
    fn assoc_sets_whether_or_not_present() {
        let m = PersistentMap::new().assoc(kw("a"), Value::Int(1));
        let m2 = m.assoc(kw("a"), Value::Int(2));
        assert_eq!(m2.val_at(&kw("a")), Some(Value::Int(2)));
        assert_eq!(m.val_at(&kw("a")), Some(Value::Int(1)));
        assert_eq!(m2.count(), 1);
    }

    #[test]
    fn without_missing_key_is_a_no_op() {
        let m = PersistentMap::new().assoc(kw("a"), Value::Int(1));
        let same = m.without(&kw("zzz"));
        assert!(same.ptr_eq(&m));
        assert_eq!(m.without(&kw("a")).count(), 0);
    }

    #[test]
    fn metadata_does_not_affect_equality() {
        let m = PersistentMap::new().assoc(kw("a"), Value::Int(1));
        let tagged = m.with_meta(Some(PersistentMap::new().assoc(kw("line"), Value::Int(3))));
        assert!(m == tagged);
        assert_eq!(m.unordered_hash(), tagged.unordered_hash());
    }
}
