use std::{
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use indexmap::IndexMap;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{SeqAccess, Visitor},
    ser::SerializeSeq,
};

/// A new-type around an `IndexMap` that serializes as a vector of key-value tuples.
///
/// Record values are keyed by [`RecordId`][crate::RecordId], which JSON cannot use as an object
/// key without stringifying it. Serializing the pairs as a sequence keeps the keys typed and keeps
/// the insertion order, which is the order records were affected in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerdeVecMap<K: Eq + std::hash::Hash, V>(IndexMap<K, V>);

impl<K, V> SerdeVecMap<K, V>
where
    K: Eq + std::hash::Hash,
{
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn into_inner(self) -> IndexMap<K, V> {
        self.0
    }
}

impl<K, V> Default for SerdeVecMap<K, V>
where
    K: Eq + std::hash::Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, T> From<T> for SerdeVecMap<K, V>
where
    K: Eq + std::hash::Hash,
    T: Into<IndexMap<K, V>>,
{
    fn from(value: T) -> Self {
        Self(value.into())
    }
}

impl<K, V> FromIterator<(K, V)> for SerdeVecMap<K, V>
where
    K: Eq + std::hash::Hash,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<K, V> IntoIterator for SerdeVecMap<K, V>
where
    K: Eq + std::hash::Hash,
{
    type Item = (K, V);
    type IntoIter = indexmap::map::IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<K, V> Deref for SerdeVecMap<K, V>
where
    K: Eq + std::hash::Hash,
{
    type Target = IndexMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> DerefMut for SerdeVecMap<K, V>
where
    K: Eq + std::hash::Hash,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<K, V> Serialize for SerdeVecMap<K, V>
where
    K: Eq + std::hash::Hash + Serialize,
    V: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for ele in self.iter() {
            seq.serialize_element(&ele)?;
        }
        seq.end()
    }
}

impl<'de, K, V> Deserialize<'de> for SerdeVecMap<K, V>
where
    K: Eq + std::hash::Hash + Deserialize<'de>,
    V: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = deserializer.deserialize_seq(VecVisitor::new())?;
        Ok(Self(v.into_iter().collect()))
    }
}

type Output<K, V> = fn() -> Vec<(K, V)>;

struct VecVisitor<K, V> {
    marker: PhantomData<Output<K, V>>,
}

impl<K, V> VecVisitor<K, V> {
    fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<'de, K, V> Visitor<'de> for VecVisitor<K, V>
where
    K: Deserialize<'de>,
    V: Deserialize<'de>,
{
    type Value = Vec<(K, V)>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a vector of key value pairs")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut v = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(ele) = seq.next_element()? {
            v.push(ele);
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::SerdeVecMap;
    use crate::RecordId;

    #[test]
    fn keeps_typed_keys_and_order_through_json() {
        let map: SerdeVecMap<RecordId, &str> =
            [(RecordId::new(9), "nine"), (RecordId::new(2), "two")]
                .into_iter()
                .collect();
        let s = serde_json::to_string(&map).unwrap();
        assert_eq!(s, r#"[[9,"nine"],[2,"two"]]"#);
        let d: SerdeVecMap<RecordId, &str> = serde_json::from_str(&s).unwrap();
        assert_eq!(d, map);
        assert_eq!(d.keys().copied().collect::<Vec<_>>(), vec![
            RecordId::new(9),
            RecordId::new(2)
        ]);
    }
}
