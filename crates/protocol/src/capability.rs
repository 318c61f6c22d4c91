//! Capability descriptors
//!
//! A capability is a named, versioned contract a worker advertises at
//! registration time. Discovery goes through capability names instead of
//! hard-coded worker addresses, so the name is a validated newtype rather
//! than a free-form string.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validated capability name: non-empty lowercase `[a-z0-9_]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityName(String);

impl CapabilityName {
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(ProtocolError::InvalidCapabilityName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CapabilityName {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CapabilityName> for String {
    fn from(name: CapabilityName) -> Self {
        name.0
    }
}

/// A contract a worker advertises to the registry
///
/// The schemas describe the expected input/output payload shapes and are
/// carried as opaque JSON; the core never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: CapabilityName,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub version: String,
    pub tags: Vec<String>,
}

impl Capability {
    pub fn new(name: CapabilityName, description: impl Into<String>) -> Self {
        Self {
            name,
            description: description.into(),
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            version: "1.0.0".to_string(),
            tags: Vec::new(),
        }
    }

    pub fn with_schemas(mut self, input: serde_json::Value, output: serde_json::Value) -> Self {
        self.input_schema = input;
        self.output_schema = output;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}
