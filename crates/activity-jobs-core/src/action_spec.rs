use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::JobError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SchemaType {
    Unicode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValueSchema {
    #[serde(rename = "type")]
    pub value_type: SchemaType,
}

impl ValueSchema {
    /// # Errors
    /// Returns [`JobError::Validation`] when `value` does not have the schema's type.
    pub fn check(&self, value: &Value) -> Result<(), JobError> {
        match (self.value_type, value) {
            (SchemaType::Unicode, Value::String(_)) => Ok(()),
            (SchemaType::Unicode, other) => {
                Err(JobError::Validation(format!("expected a unicode string, got {other}")))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CustomizationArgSpec {
    pub name: String,
    pub description: String,
    pub schema: ValueSchema,
    pub default_value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LearnerActionSpec {
    pub action_type: String,
    pub description: String,
    pub customization_arg_specs: Vec<CustomizationArgSpec>,
}

impl LearnerActionSpec {
    /// The action logged when a learner starts playing an exploration.
    #[must_use]
    pub fn exploration_start() -> &'static Self {
        static SPEC: OnceLock<LearnerActionSpec> = OnceLock::new();
        SPEC.get_or_init(|| Self {
            action_type: "ExplorationStart".to_string(),
            description: "A learner action for starting an exploration".to_string(),
            customization_arg_specs: vec![CustomizationArgSpec {
                name: "state_name".to_string(),
                description: "Initial state name".to_string(),
                schema: ValueSchema { value_type: SchemaType::Unicode },
                default_value: Value::String(String::new()),
            }],
        })
    }

    #[must_use]
    pub fn customization_arg_specs(&self) -> &[CustomizationArgSpec] {
        &self.customization_arg_specs
    }

    /// Argument specs as the ordered JSON list the validation layer reads.
    #[must_use]
    pub fn to_declaration(&self) -> Value {
        Value::Array(
            self.customization_arg_specs
                .iter()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "description": spec.description,
                        "schema": { "type": spec.schema.value_type },
                        "default_value": spec.default_value,
                    })
                })
                .collect(),
        )
    }

    /// `{name: {"value": default}}` for every argument.
    #[must_use]
    pub fn default_customization_args(&self) -> Map<String, Value> {
        self.customization_arg_specs
            .iter()
            .map(|spec| (spec.name.clone(), json!({ "value": spec.default_value })))
            .collect()
    }

    /// Check supplied arguments against the declared schemas.
    ///
    /// Missing arguments are allowed and take their default; unknown ones are not.
    ///
    /// # Errors
    /// Returns [`JobError::Validation`] for unknown names or mistyped values.
    pub fn validate_customization_args(&self, args: &Map<String, Value>) -> Result<(), JobError> {
        for (name, wrapped) in args {
            let Some(spec) = self.customization_arg_specs.iter().find(|spec| &spec.name == name)
            else {
                return Err(JobError::Validation(format!(
                    "unknown customization arg {name} for {}",
                    self.action_type
                )));
            };
            let value = wrapped.get("value").ok_or_else(|| {
                JobError::Validation(format!("customization arg {name} has no value"))
            })?;
            spec.schema.check(value)?;
        }
        Ok(())
    }
}
