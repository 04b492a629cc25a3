use std::{borrow::Cow, fmt::Display};

type TagPart = Cow<'static, str>;

/// An ordered set of `key=value` labels attached to every sample of a metric.
///
/// Keys are unique. Tags keep the order in which they were first supplied, and that order is
/// the serialized order: base tags first, then the tags declared on the metric, then any
/// per-call tags. Overriding an existing key replaces its value in place.
///
/// Empty keys are never stored, and there is no way to store an absent value; use
/// [`TagSet::with_optional`] to omit a tag whose value is unknown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "Vec<(String, String)>", into = "Vec<(String, String)>"))]
pub struct TagSet {
    tags: Vec<(TagPart, TagPart)>,
}

impl TagSet {
    /// An empty tag set.
    #[must_use]
    pub const fn new() -> Self {
        Self { tags: Vec::new() }
    }

    /// Add a tag, replacing the value if the key is already present.
    #[must_use]
    pub fn with(mut self, key: impl Into<TagPart>, value: impl Into<TagPart>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add a tag only if `value` is present.
    #[must_use]
    pub fn with_optional<V: Into<TagPart>>(self, key: impl Into<TagPart>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    /// Insert a tag, replacing the value if the key is already present.
    pub fn insert(&mut self, key: impl Into<TagPart>, value: impl Into<TagPart>) {
        let key = key.into();
        if key.is_empty() {
            tracing::debug!("ignoring tag with empty name");
            return;
        }
        let value = value.into();
        match self.tags.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.tags.push((key, value)),
        }
    }

    /// Combine two tag sets; on a key collision the value from `other` wins.
    #[must_use]
    pub fn merge(&self, other: &TagSet) -> TagSet {
        let mut merged = self.clone();
        for (key, value) in &other.tags {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Look up the value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }

    /// Iterate over `(key, value)` pairs in serialization order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether the set has no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Serialize as `k1=v1,k2=v2,...`.
    #[must_use]
    pub fn serialize(&self) -> String {
        self.to_string()
    }
}

impl Display for TagSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (key, value)) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for TagSet
where
    K: Into<TagPart>,
    V: Into<TagPart>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tags = TagSet::new();
        for (key, value) in iter {
            tags.insert(key, value);
        }
        tags
    }
}

impl<K, V> Extend<(K, V)> for TagSet
where
    K: Into<TagPart>,
    V: Into<TagPart>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl From<Vec<(String, String)>> for TagSet {
    fn from(tags: Vec<(String, String)>) -> Self {
        tags.into_iter().collect()
    }
}

impl From<TagSet> for Vec<(String, String)> {
    fn from(tags: TagSet) -> Self {
        tags.tags
            .into_iter()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}
