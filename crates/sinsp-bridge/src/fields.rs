use serde::{Deserialize, Serialize};

use crate::extract::FieldKind;

/// One field an extractor plugin exposes, as listed by `plugin_get_fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldEntry {
    #[serde(rename = "type")]
    pub field_type: String,
    pub name: String,
    #[serde(default)]
    pub arg_required: bool,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub properties: String,
}

impl FieldEntry {
    pub fn new(kind: FieldKind, name: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            field_type: kind.type_name().to_string(),
            name: name.into(),
            arg_required: false,
            display: String::new(),
            desc: desc.into(),
            properties: String::new(),
        }
    }

    pub fn arg_required(mut self) -> Self {
        self.arg_required = true;
        self
    }

    pub fn display(mut self, display: impl Into<String>) -> Self {
        self.display = display.into();
        self
    }

    pub fn properties(mut self, properties: impl Into<String>) -> Self {
        self.properties = properties.into();
        self
    }

    pub fn kind(&self) -> Option<FieldKind> {
        match self.field_type.as_str() {
            "string" => Some(FieldKind::String),
            "uint64" => Some(FieldKind::Uint64),
            _ => None,
        }
    }
}
