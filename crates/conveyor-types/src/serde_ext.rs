//! Serde helpers shared across config and workflow types.

use std::fmt;
use std::marker::PhantomData;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;

/// Deserialize a YAML/JSON map into a `Vec<(String, T)>` preserving the
/// document's entry order.
///
/// Trigger, event, and step iteration order is semantically meaningful
/// (admission and launch order are deterministic given the config), so these
/// maps must not round-trip through an unordered `HashMap`.
pub fn ordered_map<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct OrderedMapVisitor<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map with string keys")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, value)) = access.next_entry::<String, T>()? {
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Holder {
        #[serde(deserialize_with = "super::ordered_map")]
        entries: Vec<(String, u32)>,
    }

    #[test]
    fn test_ordered_map_preserves_document_order() {
        let yaml = "entries:\n  zebra: 1\n  apple: 2\n  mango: 3\n";
        let holder: Holder = serde_yaml_ng::from_str(yaml).unwrap();
        let keys: Vec<&str> = holder.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["zebra", "apple", "mango"]);
    }

    #[test]
    fn test_ordered_map_empty() {
        let yaml = "entries: {}\n";
        let holder: Holder = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(holder.entries.is_empty());
    }
}
