//! Feature schema: the ordered column names a tree was fitted on.
//!
//! The position of a name in the schema is the column index used both by the
//! vector builder and by every internal node's `split_feature`.

use crate::errors::VetreeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered, duplicate-free list of feature names. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct FeatureSchema {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl FeatureSchema {
    /// Build a schema, rejecting duplicate names.
    pub fn new<I, S>(names: I) -> Result<Self, VetreeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(VetreeError::corrupt(format!(
                    "duplicate feature name '{name}' in schema"
                )));
            }
        }
        Ok(Self { names, index })
    }

    /// Empty schema, used when a bare legacy model carried no feature list.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Column index of `name`, if the schema has it.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Name at column `idx`.
    pub fn name(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl TryFrom<Vec<String>> for FeatureSchema {
    type Error = VetreeError;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        FeatureSchema::new(names)
    }
}

impl From<FeatureSchema> for Vec<String> {
    fn from(schema: FeatureSchema) -> Self {
        schema.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_follows_order() {
        let schema = FeatureSchema::new(["age", "body_temperature", "animal_cow"]).unwrap();
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.index_of("age"), Some(0));
        assert_eq!(schema.index_of("animal_cow"), Some(2));
        assert_eq!(schema.index_of("animal_pig"), None);
        assert_eq!(schema.name(1), Some("body_temperature"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = FeatureSchema::new(["fever", "cough", "fever"]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_serde_as_plain_list() {
        let schema = FeatureSchema::new(["age", "fever"]).unwrap();
        let json = serde_json::to_string(&schema).unwrap();
        assert_eq!(json, r#"["age","fever"]"#);

        let restored: FeatureSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, schema);
        assert_eq!(restored.index_of("fever"), Some(1));

        assert!(serde_json::from_str::<FeatureSchema>(r#"["a","a"]"#).is_err());
    }
}
