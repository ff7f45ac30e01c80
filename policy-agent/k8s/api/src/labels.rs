use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// An endpoint's label set.
///
/// Labels are shared (behind an `Arc`) between the endpoint store and the label index so that
/// re-indexing an endpoint does not copy its labels.
#[derive(Clone, Debug, Eq, Default, Hash)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

// === impl Labels ===

impl Labels {
    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the keys whose values differ between `self` and `other`, including keys that are
    /// only set on one side.
    pub fn changed_keys(&self, other: &Labels) -> BTreeSet<String> {
        if Arc::ptr_eq(&self.0, &other.0) {
            return BTreeSet::new();
        }

        let mut changed = BTreeSet::new();
        for (k, v) in self.0.iter() {
            if other.0.get(k) != Some(v) {
                changed.insert(k.clone());
            }
        }
        for k in other.0.keys() {
            if !self.0.contains_key(k) {
                changed.insert(k.clone());
            }
        }
        changed
    }

    /// Builds a new label set from `self` with `overrides` applied on top.
    pub fn overlay<'a>(&self, overrides: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut map = (*self.0).clone();
        for (k, v) in overrides {
            map.insert(k.to_string(), v.to_string());
        }
        Self(Arc::new(map))
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
