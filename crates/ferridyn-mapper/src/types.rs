//! Core types: items, system properties, table schemas and resource models.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A resource or stored row: a JSON object keyed by attribute name.
pub type Item = Map<String, Value>;

/// Type tag of a resource.
pub const TYPE: &str = "_t";
/// Content-addressed identity of one revision.
pub const LINK: &str = "_link";
/// Identity stable across revisions.
pub const PERMALINK: &str = "_permalink";
/// Monotonic revision time used to settle write races.
pub const TIME: &str = "_time";
pub const AUTHOR: &str = "_author";
/// Names of properties removed by minification.
pub const CUT: &str = "_cut";

/// Properties every resource may carry without declaring them on its model.
pub const SYSTEM_PROPERTIES: [&str; 6] = [TYPE, LINK, PERMALINK, TIME, AUTHOR, CUT];

/// Maximum item size in bytes (400KB, matching DynamoDB).
pub const MAX_ITEM_SIZE: usize = 400 * 1024;

/// Maximum number of rows per batch write (matching DynamoDB).
pub const MAX_BATCH_WRITE: usize = 25;

pub fn is_system_property(name: &str) -> bool {
    SYSTEM_PROPERTIES.contains(&name)
}

/// The type of a physical key attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    String,
    Number,
}

/// A key attribute definition (name + type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDefinition {
    pub name: String,
    pub key_type: KeyType,
}

impl KeyDefinition {
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_type: KeyType::String,
        }
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_type: KeyType::Number,
        }
    }
}

/// Which attributes a secondary index carries alongside its keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type", content = "attributes")]
pub enum Projection {
    All,
    KeysOnly,
    Include(Vec<String>),
}

impl Projection {
    /// Whether a resource property is readable straight from the index.
    pub fn carries(&self, property: &str) -> bool {
        match self {
            Projection::All => true,
            Projection::KeysOnly => false,
            Projection::Include(attrs) => {
                let top = property.split('.').next().unwrap_or(property);
                attrs.iter().any(|a| a == top)
            }
        }
    }
}

/// A secondary index declared on the physical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub partition_key: KeyDefinition,
    pub sort_key: Option<KeyDefinition>,
    pub projection: Projection,
}

/// Physical layout of a table as reported by the storage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub partition_key: KeyDefinition,
    pub sort_key: Option<KeyDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
}

impl TableSchema {
    pub fn index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Every physical key attribute name (table and index keys).
    pub fn key_attributes(&self) -> Vec<&str> {
        let mut names = vec![self.partition_key.name.as_str()];
        if let Some(sk) = &self.sort_key {
            names.push(sk.name.as_str());
        }
        for index in &self.indexes {
            names.push(index.partition_key.name.as_str());
            if let Some(sk) = &index.sort_key {
                names.push(sk.name.as_str());
            }
        }
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Key attributes identifying a row in the base table.
    pub fn primary_key_attributes(&self) -> Vec<&str> {
        let mut names = vec![self.partition_key.name.as_str()];
        if let Some(sk) = &self.sort_key {
            names.push(sk.name.as_str());
        }
        names
    }
}

/// Declared type of a model property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Epoch milliseconds.
    Date,
}

/// A property declared on a resource model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub property_type: PropertyType,
    #[serde(default)]
    pub required: bool,
}

/// Templates filling the table's own partition/sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyTemplate {
    pub hash: String,
    #[serde(default)]
    pub range: Option<String>,
}

/// Templates filling one of the table's secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTemplate {
    /// Name of the table index this template fills.
    pub name: String,
    pub hash: String,
    #[serde(default)]
    pub range: Option<String>,
    pub projection: Projection,
}

/// Declarative description of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceModel {
    pub id: String,
    pub properties: Vec<PropertyDef>,
    pub primary_key: PrimaryKeyTemplate,
    #[serde(default)]
    pub indexes: Vec<IndexTemplate>,
    /// Parent type, for `SUBCLASS_OF` filters.
    #[serde(default)]
    pub subclass_of: Option<String>,
}

impl ResourceModel {
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Declared type of a property path. System properties are typed too.
    pub fn property_type(&self, path: &str) -> Option<PropertyType> {
        let top = path.split('.').next().unwrap_or(path);
        if top == TIME {
            return Some(PropertyType::Date);
        }
        if top == CUT {
            return Some(PropertyType::Array);
        }
        if is_system_property(top) {
            return Some(PropertyType::String);
        }
        let def = self.property(top)?;
        if top.len() == path.len() {
            Some(def.property_type)
        } else {
            None
        }
    }

    pub fn is_declared(&self, path: &str) -> bool {
        let top = path.split('.').next().unwrap_or(path);
        is_system_property(top) || self.property(top).is_some()
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.property(name).is_some_and(|p| p.required)
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_projection_wire_format() {
        let p: Projection = serde_json::from_value(json!({"type": "ALL"})).unwrap();
        assert_eq!(p, Projection::All);
        let p: Projection =
            serde_json::from_value(json!({"type": "INCLUDE", "attributes": ["name"]})).unwrap();
        assert!(p.carries("name"));
        assert!(p.carries("name.first"));
        assert!(!p.carries("age"));
        assert!(!Projection::KeysOnly.carries("name"));
    }

    #[test]
    fn test_key_attributes_deduplicated() {
        let schema = TableSchema {
            name: "t".to_string(),
            partition_key: KeyDefinition::string("_h"),
            sort_key: Some(KeyDefinition::string("_r")),
            indexes: vec![IndexDefinition {
                name: "idx0".to_string(),
                partition_key: KeyDefinition::string("_x0h"),
                sort_key: Some(KeyDefinition::string("_r")),
                projection: Projection::All,
            }],
        };
        assert_eq!(schema.key_attributes(), vec!["_h", "_r", "_x0h"]);
        assert_eq!(schema.primary_key_attributes(), vec!["_h", "_r"]);
    }

    #[test]
    fn test_property_type_lookup() {
        let model = ResourceModel {
            id: "Order".to_string(),
            properties: vec![PropertyDef {
                name: "total".to_string(),
                property_type: PropertyType::Number,
                required: true,
            }],
            primary_key: PrimaryKeyTemplate {
                hash: "{total}".to_string(),
                range: None,
            },
            indexes: vec![],
            subclass_of: None,
        };
        assert_eq!(model.property_type("total"), Some(PropertyType::Number));
        assert_eq!(model.property_type(TIME), Some(PropertyType::Date));
        assert_eq!(model.property_type("missing"), None);
        assert!(model.is_declared(LINK));
        assert!(model.is_required("total"));
    }
}
