//! This module implements helper types and traits for `serde`.

use super::{HashMap, MaskHash};

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};

use std::fmt;
use std::marker::PhantomData;

/// Helper type to allow `serde` to access [`HashMap`] entries.
struct HashMapVisitor<K, V> {
    marker: PhantomData<fn() -> HashMap<K, V>>,
}

impl<'d, K, V> Visitor<'d> for HashMapVisitor<K, V>
where
    K: Deserialize<'d> + MaskHash + Ord + Clone,
    V: Deserialize<'d> + Copy,
{
    type Value = HashMap<K, V>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("HashMap")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'d>,
    {
        let map = HashMap::builder()
            .initial_buckets(access.size_hint().unwrap_or(0).max(2))
            .build();
        while let Some((key, value)) = access.next_entry()? {
            map.upsert(key, value)
                .map_err(|error| serde::de::Error::custom(error))?;
        }
        Ok(map)
    }
}

impl<'d, K, V> Deserialize<'d> for HashMap<K, V>
where
    K: Deserialize<'d> + MaskHash + Ord + Clone,
    V: Deserialize<'d> + Copy,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        deserializer.deserialize_map(HashMapVisitor {
            marker: PhantomData,
        })
    }
}

impl<K, V> Serialize for HashMap<K, V>
where
    K: MaskHash + Ord + Clone + Serialize,
    V: Copy + Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        let mut error = None;
        self.scan(|key, value| {
            if error.is_none() {
                if let Err(e) = map.serialize_entry(key, &value) {
                    error.replace(e);
                }
            }
        });
        if let Some(e) = error {
            return Err(e);
        }
        map.end()
    }
}
