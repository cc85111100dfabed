// Tolerant Value Types
// Polymorphic containers that accept more than one concrete YAML shape
// on decode and normalize to a single internal form

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;

/// A value that decodes from either a single scalar or a sequence of
/// scalars. `"x"` and `["x"]` normalize to the same one-element list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StringOrStringSlice(pub Vec<String>);

impl Deref for StringOrStringSlice {
    type Target = Vec<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<String>> for StringOrStringSlice {
    fn from(values: Vec<String>) -> Self {
        StringOrStringSlice(values)
    }
}

impl<'de> Deserialize<'de> for StringOrStringSlice {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StringOrSliceVisitor;

        impl<'de> Visitor<'de> for StringOrSliceVisitor {
            type Value = StringOrStringSlice;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string or a list of strings")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(StringOrStringSlice(vec![value.to_string()]))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut values = Vec::new();
                while let Some(value) = seq.next_element::<String>()? {
                    values.push(value);
                }
                Ok(StringOrStringSlice(values))
            }
        }

        deserializer.deserialize_any(StringOrSliceVisitor)
    }
}

/// A mapping that decodes from either a map or a sequence of `KEY` /
/// `KEY=VALUE` tokens. A bare `KEY` maps to a null value, which the
/// preprocessor's emptiness tests keep distinct from an explicit empty
/// string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingWithEquals(pub BTreeMap<String, Option<String>>);

impl Deref for MappingWithEquals {
    type Target = BTreeMap<String, Option<String>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<(String, Option<String>)> for MappingWithEquals {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        MappingWithEquals(iter.into_iter().collect())
    }
}

impl<'de> Deserialize<'de> for MappingWithEquals {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MappingVisitor;

        impl<'de> Visitor<'de> for MappingVisitor {
            type Value = MappingWithEquals;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map or a list of KEY=VALUE tokens")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut entries = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, Option<String>>()? {
                    entries.insert(key, value);
                }
                Ok(MappingWithEquals(entries))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut entries = BTreeMap::new();
                while let Some(token) = seq.next_element::<String>()? {
                    match token.split_once('=') {
                        Some((key, value)) => {
                            entries.insert(key.to_string(), Some(value.to_string()));
                        }
                        None => {
                            entries.insert(token, None);
                        }
                    }
                }
                Ok(MappingWithEquals(entries))
            }
        }

        deserializer.deserialize_any(MappingVisitor)
    }
}

/// A set of names that decodes from either a single scalar or a
/// sequence. Iteration order is lexicographic, which keeps everything
/// built on top of it deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StringSet(pub BTreeSet<String>);

impl Deref for StringSet {
    type Target = BTreeSet<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<String> for StringSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        StringSet(iter.into_iter().collect())
    }
}

impl<'de> Deserialize<'de> for StringSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StringSetVisitor;

        impl<'de> Visitor<'de> for StringSetVisitor {
            type Value = StringSet;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string or a list of strings")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let mut set = BTreeSet::new();
                set.insert(value.to_string());
                Ok(StringSet(set))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut set = BTreeSet::new();
                while let Some(value) = seq.next_element::<String>()? {
                    set.insert(value);
                }
                Ok(StringSet(set))
            }
        }

        deserializer.deserialize_any(StringSetVisitor)
    }
}

/// An ordered list of `KEY` / `KEY=VALUE` tokens that also decodes from
/// a map (`{k: v}` becomes `["k=v"]`, `{k: null}` becomes `["k"]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StringMapOrStringSlice(pub Vec<String>);

impl Deref for StringMapOrStringSlice {
    type Target = Vec<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<String>> for StringMapOrStringSlice {
    fn from(values: Vec<String>) -> Self {
        StringMapOrStringSlice(values)
    }
}

impl<'de> Deserialize<'de> for StringMapOrStringSlice {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MapOrSliceVisitor;

        impl<'de> Visitor<'de> for MapOrSliceVisitor {
            type Value = StringMapOrStringSlice;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map or a list of KEY=VALUE tokens")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut values = Vec::new();
                while let Some(value) = seq.next_element::<String>()? {
                    values.push(value);
                }
                Ok(StringMapOrStringSlice(values))
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                // Collect into a BTreeMap first so map input yields a
                // reproducible token order.
                let mut entries = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, Option<String>>()? {
                    entries.insert(key, value);
                }
                let values = entries
                    .into_iter()
                    .map(|(key, value)| match value {
                        Some(value) => format!("{}={}", key, value),
                        None => key,
                    })
                    .collect();
                Ok(StringMapOrStringSlice(values))
            }
        }

        deserializer.deserialize_any(MapOrSliceVisitor)
    }
}
