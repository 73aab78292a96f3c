use serde::{Deserialize, Serialize};

/// Describes which credential fields a connector accepts at runtime.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ConnectorConfigSchema {
    pub fields: Vec<Field>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Field {
    pub name: String,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum FieldType {
    Text,
    Secret, // Use for client secrets, API keys – anything sensitive
    Select { options: Vec<String> },
}
