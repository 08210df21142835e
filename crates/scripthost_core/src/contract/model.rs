//! Domain values passed to capability operations.
//!
//! # Invariants
//! - Values are immutable once handed to a capability instance.
//! - The engine converts these values across the interpreter boundary but
//!   never interprets their contents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One configuration attribute as supplied by the script registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleCustomProperty {
    pub value1: String,
    pub value2: String,
    pub description: String,
}

impl SimpleCustomProperty {
    pub fn new(value1: impl Into<String>) -> Self {
        Self {
            value1: value1.into(),
            ..Self::default()
        }
    }
}

/// Immutable attribute map consumed by `init`/`destroy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationAttributes {
    values: BTreeMap<String, SimpleCustomProperty>,
}

impl ConfigurationAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of an attribute with only `value1` set.
    pub fn with(mut self, name: impl Into<String>, value1: impl Into<String>) -> Self {
        self.values
            .insert(name.into(), SimpleCustomProperty::new(value1));
        self
    }

    /// Builder-style insert of a full property.
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        property: SimpleCustomProperty,
    ) -> Self {
        self.values.insert(name.into(), property);
        self
    }

    pub fn get(&self, name: &str) -> Option<&SimpleCustomProperty> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SimpleCustomProperty)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl FromIterator<(String, SimpleCustomProperty)> for ConfigurationAttributes {
    fn from_iter<I: IntoIterator<Item = (String, SimpleCustomProperty)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Evidence a policy needs before it can decide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimDefinition {
    pub name: String,
    pub namespace: String,
    pub issuer: Vec<String>,
    pub claim_type: String,
    pub claim_token_format: Vec<String>,
    pub friendly_name: String,
}

impl ClaimDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Host-supplied description of the request under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationContext {
    payload: Value,
}

impl AuthorizationContext {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

impl Default for AuthorizationContext {
    fn default() -> Self {
        Self::new(Value::Object(Default::default()))
    }
}
