//! Key derivation: compiled per-model templates and the concrete key
//! attributes they produce for a resource.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::template::{KeyTemplate, typed_parse};
use crate::types::{
    Item, KeyDefinition, KeyType, Projection, PropertyType, ResourceModel, TableSchema,
};

/// One compiled key (table primary key or a secondary index) of a model.
#[derive(Debug, Clone)]
pub struct CompiledKey {
    /// `None` for the table's primary key.
    pub index: Option<String>,
    pub hash: KeyTemplate,
    pub range: Option<KeyTemplate>,
    pub hash_key: KeyDefinition,
    pub range_key: Option<KeyDefinition>,
    pub projection: Projection,
}

impl CompiledKey {
    pub fn is_primary(&self) -> bool {
        self.index.is_none()
    }

    /// The model property the store orders this key's rows by, when the
    /// range template is bare.
    pub fn range_property(&self) -> Option<&str> {
        self.range.as_ref()?.bare_property()
    }

    /// Render the hash template with the given lookup, if the result fits the
    /// physical key type.
    pub fn render_hash<'a>(&self, get: impl Fn(&str) -> Option<&'a Value>) -> Option<Value> {
        let value = self.hash.render_with(get)?;
        fits(&value, self.hash_key.key_type).then_some(value)
    }

    /// Render a condition operand on `property` the way the range attribute
    /// is stored. `None` if the key has no range or the result does not fit.
    pub fn render_range(&self, property: &str, operand: &Value) -> Option<Value> {
        let (template, def) = (self.range.as_ref()?, self.range_key.as_ref()?);
        let value = template.render_with(|p| (p == property).then_some(operand))?;
        fits(&value, def.key_type).then_some(value)
    }

    fn derive(&self, item: &Item) -> Option<DerivedKey> {
        let hash = self.hash.render(item)?;
        if !fits(&hash, self.hash_key.key_type) {
            return None;
        }
        let range = match (&self.range, &self.range_key) {
            (Some(template), Some(def)) => {
                let value = template.render(item)?;
                if !fits(&value, def.key_type) {
                    return None;
                }
                Some((def.name.clone(), value))
            }
            _ => None,
        };
        let mut properties: Vec<String> = self.hash.properties().map(str::to_string).collect();
        if let Some(range) = &self.range {
            properties.extend(range.properties().map(str::to_string));
        }
        Some(DerivedKey {
            index: self.index.clone(),
            hash: (self.hash_key.name.clone(), hash),
            range,
            properties,
        })
    }
}

fn fits(value: &Value, key_type: KeyType) -> bool {
    match key_type {
        KeyType::String => value.is_string(),
        KeyType::Number => value.is_number(),
    }
}

/// Concrete key attributes of one key for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedKey {
    pub index: Option<String>,
    pub hash: (String, Value),
    pub range: Option<(String, Value)>,
    /// Properties the key was rendered from.
    pub properties: Vec<String>,
}

impl DerivedKey {
    pub fn to_item(&self) -> Item {
        let mut item = Item::new();
        item.insert(self.hash.0.clone(), self.hash.1.clone());
        if let Some((name, value)) = &self.range {
            item.insert(name.clone(), value.clone());
        }
        item
    }
}

/// The primary key plus every secondary-index key renderable for a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedKeySet {
    pub primary: DerivedKey,
    /// Sparse: indexes whose templates do not render are absent.
    pub indexes: Vec<DerivedKey>,
}

impl DerivedKeySet {
    /// Every key attribute to persist alongside the resource.
    pub fn attributes(&self) -> Item {
        let mut item = self.primary.to_item();
        for key in &self.indexes {
            item.extend(key.to_item());
        }
        item
    }

    /// Properties referenced by any rendered template. These are never
    /// minified away.
    pub fn pinned(&self) -> BTreeSet<String> {
        std::iter::once(&self.primary)
            .chain(&self.indexes)
            .flat_map(|k| k.properties.iter().cloned())
            .collect()
    }
}

/// A model with its templates compiled against a table. Immutable once built.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    pub model: ResourceModel,
    /// Primary key first, then indexes in declaration order.
    keys: Vec<CompiledKey>,
}

impl CompiledModel {
    pub fn compile(model: ResourceModel, schema: &TableSchema) -> Result<Self> {
        let mut keys = Vec::with_capacity(model.indexes.len() + 1);

        let hash = compile_template(&model, &model.primary_key.hash)?;
        let range = model
            .primary_key
            .range
            .as_deref()
            .map(|t| compile_template(&model, t))
            .transpose()?;
        keys.push(bind_key(
            &model,
            None,
            hash,
            range,
            &schema.partition_key,
            schema.sort_key.as_ref(),
            Projection::All,
        )?);

        for index in &model.indexes {
            let def = schema.index(&index.name).ok_or_else(|| {
                Error::invalid(format!(
                    "model '{}' references unknown index '{}' of table '{}'",
                    model.id, index.name, schema.name
                ))
            })?;
            if def.projection != index.projection {
                return Err(Error::invalid(format!(
                    "model '{}' declares projection {:?} for index '{}', table has {:?}",
                    model.id, index.projection, index.name, def.projection
                )));
            }
            let hash = compile_template(&model, &index.hash)?;
            let range = index
                .range
                .as_deref()
                .map(|t| compile_template(&model, t))
                .transpose()?;
            keys.push(bind_key(
                &model,
                Some(index.name.clone()),
                hash,
                range,
                &def.partition_key,
                def.sort_key.as_ref(),
                def.projection.clone(),
            )?);
        }

        // Keys sharing a physical attribute must agree on its template.
        let mut seen: Vec<(&str, &str)> = Vec::new();
        for key in &keys {
            let mut pairs = vec![(key.hash_key.name.as_str(), key.hash.source())];
            if let (Some(def), Some(t)) = (&key.range_key, &key.range) {
                pairs.push((def.name.as_str(), t.source()));
            }
            for (attr, source) in pairs {
                if let Some((_, other)) = seen.iter().find(|(a, _)| *a == attr)
                    && *other != source
                {
                    return Err(Error::invalid(format!(
                        "model '{}' fills key attribute '{attr}' with both '{other}' and '{source}'",
                        model.id
                    )));
                }
                seen.push((attr, source));
            }
        }

        Ok(Self { model, keys })
    }

    pub fn id(&self) -> &str {
        &self.model.id
    }

    pub fn primary(&self) -> &CompiledKey {
        &self.keys[0]
    }

    pub fn indexes(&self) -> &[CompiledKey] {
        &self.keys[1..]
    }

    /// Primary key first, then indexes in declaration order.
    pub fn keys(&self) -> &[CompiledKey] {
        &self.keys
    }

    pub fn key(&self, index: Option<&str>) -> Option<&CompiledKey> {
        self.keys.iter().find(|k| k.index.as_deref() == index)
    }

    /// Whether a physical key attribute is also a model property.
    pub fn is_property(&self, attribute: &str) -> bool {
        self.model.property(attribute).is_some()
    }

    /// Derive every key for a resource. `None` if the primary key cannot be
    /// rendered.
    pub fn derive_keys(&self, item: &Item) -> Option<DerivedKeySet> {
        let primary = self.primary().derive(item)?;
        let indexes = self.indexes().iter().filter_map(|k| k.derive(item)).collect();
        Some(DerivedKeySet { primary, indexes })
    }

    /// Recover typed property values from a row's key attributes.
    pub fn parse_keys(&self, row: &Item) -> Result<Item> {
        let mut out = Item::new();
        for key in &self.keys {
            let parts = std::iter::once((&key.hash, &key.hash_key))
                .chain(key.range.as_ref().zip(key.range_key.as_ref()));
            for (template, def) in parts {
                let Some(rendered) = row.get(&def.name) else {
                    continue;
                };
                let Some(raw) = template.parse(rendered) else {
                    continue;
                };
                for (property, raw) in raw {
                    let typed = typed_parse(&property, &raw, self.model.property_type(&property))?;
                    out.insert(property, typed);
                }
            }
        }
        Ok(out)
    }
}

fn compile_template(model: &ResourceModel, source: &str) -> Result<KeyTemplate> {
    let template = KeyTemplate::compile(source)?;
    for property in template.properties() {
        if !model.is_declared(property) {
            return Err(Error::invalid(format!(
                "template '{source}' references undeclared property '{property}' of '{}'",
                model.id
            )));
        }
        if matches!(
            model.property_type(property),
            Some(PropertyType::Object | PropertyType::Array)
        ) {
            return Err(Error::invalid(format!(
                "template '{source}' uses '{property}', which cannot be a key component"
            )));
        }
    }
    Ok(template)
}

/// The physical key type a template renders to.
fn rendered_key_type(model: &ResourceModel, template: &KeyTemplate) -> KeyType {
    match template.bare_property().map(|p| model.property_type(p)) {
        Some(Some(PropertyType::Number | PropertyType::Date)) => KeyType::Number,
        _ => KeyType::String,
    }
}

fn bind_key(
    model: &ResourceModel,
    index: Option<String>,
    hash: KeyTemplate,
    range: Option<KeyTemplate>,
    hash_key: &KeyDefinition,
    range_key: Option<&KeyDefinition>,
    projection: Projection,
) -> Result<CompiledKey> {
    let label = index.as_deref().unwrap_or("primary key");
    if range.is_some() != range_key.is_some() {
        return Err(Error::invalid(format!(
            "model '{}': range template presence for {label} does not match the table",
            model.id
        )));
    }
    let parts = std::iter::once((&hash, hash_key)).chain(range.as_ref().zip(range_key));
    for (template, def) in parts {
        let rendered = rendered_key_type(model, template);
        if rendered != def.key_type {
            return Err(Error::invalid(format!(
                "model '{}': template '{}' renders {rendered:?} but '{}' is {:?}",
                model.id,
                template.source(),
                def.name,
                def.key_type
            )));
        }
        if model.property(&def.name).is_some() && template.bare_property() != Some(&def.name) {
            return Err(Error::invalid(format!(
                "model '{}': property '{}' collides with a key attribute filled by '{}'",
                model.id,
                def.name,
                template.source()
            )));
        }
    }
    Ok(CompiledKey {
        index,
        hash,
        range,
        hash_key: hash_key.clone(),
        range_key: range_key.cloned(),
        projection,
    })
}
