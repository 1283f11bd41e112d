//! Label sets and hub locations
//!
//! A `LabelSet` is kept sorted by name with unique names so two sets with the
//! same contents always compare and serialize identically.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "LabelSetRepr")]
pub struct LabelSet {
    labels: Vec<Label>,
}

#[derive(Deserialize)]
struct LabelSetRepr {
    #[serde(default)]
    labels: Vec<Label>,
}

impl From<LabelSetRepr> for LabelSet {
    fn from(repr: LabelSetRepr) -> Self {
        LabelSet::from_pairs(repr.labels.into_iter().map(|l| (l.name, l.value)))
    }
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs; a later pair with a repeated name wins
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut set = Self::new();
        for (k, v) in pairs {
            set.insert(k, v);
        }
        set
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let label = Label::new(name, value);
        match self
            .labels
            .binary_search_by(|l| l.name.as_str().cmp(label.name.as_str()))
        {
            Ok(idx) => self.labels[idx] = label,
            Err(idx) => self.labels.insert(idx, label),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.labels[idx].value.as_str())
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Every label in `self` is present with the same value in `other`
    pub fn is_subset_of(&self, other: &LabelSet) -> bool {
        self.labels
            .iter()
            .all(|l| other.get(&l.name) == Some(l.value.as_str()))
    }

    /// An empty filter matches everything
    pub fn matches(&self, filter: &LabelSet) -> bool {
        filter.is_subset_of(self)
    }

    pub fn merge(&self, other: &LabelSet) -> LabelSet {
        let mut merged = self.clone();
        for l in &other.labels {
            merged.insert(l.name.clone(), l.value.clone());
        }
        merged
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, l) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", l.name, l.value)?;
        }
        Ok(())
    }
}

/// Parses `name=value,name=value`; blank input gives an empty set
impl FromStr for LabelSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = LabelSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| format!("label '{}' is missing '='", part))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(format!("label '{}' has an empty name", part));
            }
            set.insert(name, value.trim());
        }
        Ok(set)
    }
}

/// A reachable address of a hub together with the labels describing it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub labels: LabelSet,
    pub addresses: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_sorted_and_unique() {
        let mut set = LabelSet::new();
        set.insert("zone", "b");
        set.insert("type", "public");
        set.insert("zone", "a");
        assert_eq!(set.len(), 2);
        assert_eq!(set.labels()[0].name, "type");
        assert_eq!(set.get("zone"), Some("a"));
    }

    #[test]
    fn test_order_irrelevant_for_equality() {
        let a = LabelSet::from_pairs([("x", "1"), ("y", "2")]);
        let b = LabelSet::from_pairs([("y", "2"), ("x", "1")]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "x=1,y=2");
    }

    #[test]
    fn test_parse() {
        let set: LabelSet = "region=us-west, type=public".parse().unwrap();
        assert_eq!(set.get("region"), Some("us-west"));
        assert_eq!(set.get("type"), Some("public"));
        assert!("".parse::<LabelSet>().unwrap().is_empty());
        assert!("novalue".parse::<LabelSet>().is_err());
        assert!("=x".parse::<LabelSet>().is_err());
    }

    #[test]
    fn test_matches() {
        let hub = LabelSet::from_pairs([("region", "eu"), ("type", "public")]);
        assert!(hub.matches(&LabelSet::new()));
        assert!(hub.matches(&LabelSet::from_pairs([("type", "public")])));
        assert!(!hub.matches(&LabelSet::from_pairs([("type", "private")])));
        assert!(!hub.matches(&LabelSet::from_pairs([("rack", "1")])));
    }

    #[test]
    fn test_serialized_shape() {
        let set = LabelSet::from_pairs([("type", "public")]);
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"labels": [{"name": "type", "value": "public"}]})
        );
    }

    #[test]
    fn test_deserialize_normalizes() {
        let set: LabelSet = serde_json::from_str(
            r#"{"labels":[{"name":"b","value":"1"},{"name":"a","value":"2"},{"name":"b","value":"3"}]}"#,
        )
        .unwrap();
        assert_eq!(set.to_string(), "a=2,b=3");
    }
}
