//! Command and config-profile definitions.
//!
//! A [`CommandDefinition`] owns the compiled validators for every declared
//! input and output type. It is immutable after construction apart from the
//! builder operations; once registered in a service it must not change.

use crate::error::{ProtocolError, SchemaViolation};
use crate::manifest::{CommandDescriptor, ConfigProfileDescriptor};
use crate::message::InputDemand;
use crate::validate::{collect_violations, compile_schema};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failures while building a command or profile definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandDefinitionError {
    #[error("input type already declared: {0}")]
    DuplicateInputType(String),

    #[error("output type already declared: {0}")]
    DuplicateOutputType(String),

    #[error("schema for {name} does not compile: {reason}")]
    InvalidSchema { name: String, reason: String },
}

/// Manifest-facing description of one input or output type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoTypeDescriptor {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl IoTypeDescriptor {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            schema: None,
            required: true,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// One declared input or output type with its compiled validator.
pub struct IoTypeDefinition {
    name: String,
    descriptor: IoTypeDescriptor,
    validator: Option<Validator>,
}

impl IoTypeDefinition {
    fn new(name: String, descriptor: IoTypeDescriptor) -> Result<Self, CommandDefinitionError> {
        let validator = match descriptor.schema.as_ref() {
            Some(schema) => Some(compile_schema(schema).map_err(|reason| {
                CommandDefinitionError::InvalidSchema {
                    name: name.clone(),
                    reason,
                }
            })?),
            None => None,
        };
        Ok(Self {
            name,
            descriptor,
            validator,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &IoTypeDescriptor {
        &self.descriptor
    }

    /// Build the `RequestInput` demand for this type.
    pub fn demand(&self, min_count: u32) -> InputDemand {
        InputDemand {
            description: self.descriptor.description.clone(),
            schema: self.descriptor.schema.clone(),
            required: Some(self.descriptor.required),
            min_count: Some(min_count),
        }
    }

    fn check(&self, value: &Value) -> Vec<SchemaViolation> {
        match self.validator.as_ref() {
            Some(validator) => collect_violations(validator, value),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for IoTypeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoTypeDefinition")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Scope a config profile binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileScope {
    User,
    Organization,
}

/// A named bag of configuration a command may require on Invoke.
pub struct ConfigProfileDefinition {
    name: String,
    scope: ProfileScope,
    setup_uri: String,
    description: String,
    schema: Option<Value>,
    validator: Option<Validator>,
}

impl ConfigProfileDefinition {
    pub fn new(
        name: impl Into<String>,
        scope: ProfileScope,
        setup_uri: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            scope,
            setup_uri: setup_uri.into(),
            description: description.into(),
            schema: None,
            validator: None,
        }
    }

    /// Attach a schema; supplied profile data must validate against it.
    pub fn with_schema(mut self, schema: Value) -> Result<Self, CommandDefinitionError> {
        let validator =
            compile_schema(&schema).map_err(|reason| CommandDefinitionError::InvalidSchema {
                name: self.name.clone(),
                reason,
            })?;
        self.schema = Some(schema);
        self.validator = Some(validator);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> ProfileScope {
        self.scope
    }

    /// Validate supplied profile data against the declared schema.
    pub fn validate(&self, value: &Value) -> Result<(), ProtocolError> {
        let Some(validator) = self.validator.as_ref() else {
            return Ok(());
        };
        let errors = collect_violations(validator, value);
        if errors.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::InvalidConfigProfile {
            profile: self.name.clone(),
            errors,
        })
    }

    pub fn descriptor(&self) -> ConfigProfileDescriptor {
        ConfigProfileDescriptor {
            name: self.name.clone(),
            scope: self.scope,
            setup_uri: self.setup_uri.clone(),
            description: self.description.clone(),
            schema: self.schema.clone(),
        }
    }
}

impl std::fmt::Debug for ConfigProfileDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigProfileDefinition")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// A named, schematized operation exposed by a service.
#[derive(Debug)]
pub struct CommandDefinition {
    name: String,
    description: BTreeMap<String, String>,
    required_config_profiles: Vec<String>,
    requires_user_confirmation: bool,
    input_types: Vec<IoTypeDefinition>,
    output_types: Vec<IoTypeDefinition>,
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: BTreeMap::new(),
            required_config_profiles: Vec::new(),
            requires_user_confirmation: false,
            input_types: Vec::new(),
            output_types: Vec::new(),
        }
    }

    /// Add a description in one language.
    #[must_use]
    pub fn with_description(mut self, language: impl Into<String>, text: impl Into<String>) -> Self {
        self.description.insert(language.into(), text.into());
        self
    }

    /// Reference a config profile the command requires on Invoke.
    #[must_use]
    pub fn with_config_profile(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.required_config_profiles.contains(&name) {
            self.required_config_profiles.push(name);
        }
        self
    }

    /// Require explicit user confirmation before invocation.
    #[must_use]
    pub fn with_user_confirmation(mut self) -> Self {
        self.requires_user_confirmation = true;
        self
    }

    /// Declare an input type. Duplicate names fail.
    pub fn with_input_type(
        mut self,
        name: impl Into<String>,
        descriptor: IoTypeDescriptor,
    ) -> Result<Self, CommandDefinitionError> {
        let name = name.into();
        if self.has_input_type(&name) {
            return Err(CommandDefinitionError::DuplicateInputType(name));
        }
        self.input_types.push(IoTypeDefinition::new(name, descriptor)?);
        Ok(self)
    }

    /// Declare an output type. Duplicate names fail.
    pub fn with_output_type(
        mut self,
        name: impl Into<String>,
        descriptor: IoTypeDescriptor,
    ) -> Result<Self, CommandDefinitionError> {
        let name = name.into();
        if self.has_output_type(&name) {
            return Err(CommandDefinitionError::DuplicateOutputType(name));
        }
        self.output_types
            .push(IoTypeDefinition::new(name, descriptor)?);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &BTreeMap<String, String> {
        &self.description
    }

    pub fn has_input_type(&self, name: &str) -> bool {
        self.input_types.iter().any(|t| t.name == name)
    }

    pub fn has_output_type(&self, name: &str) -> bool {
        self.output_types.iter().any(|t| t.name == name)
    }

    pub fn input_type(&self, name: &str) -> Option<&IoTypeDefinition> {
        self.input_types.iter().find(|t| t.name == name)
    }

    pub fn output_type(&self, name: &str) -> Option<&IoTypeDefinition> {
        self.output_types.iter().find(|t| t.name == name)
    }

    /// Validate one provided input value against its declared schema.
    pub fn validate_input(&self, name: &str, value: &Value) -> Result<(), ProtocolError> {
        let def = self
            .input_type(name)
            .ok_or_else(|| ProtocolError::UnknownInputType(name.to_string()))?;
        let errors = def.check(value);
        if errors.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::InvalidInput {
            input_type: name.to_string(),
            errors,
        })
    }

    /// Validate one produced output value against its declared schema.
    pub fn validate_output(&self, name: &str, value: &Value) -> Result<(), ProtocolError> {
        let def = self
            .output_type(name)
            .ok_or_else(|| ProtocolError::UnknownOutputType(name.to_string()))?;
        let errors = def.check(value);
        if errors.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::InvalidOutput {
            output_type: name.to_string(),
            errors,
        })
    }

    pub fn required_config_profiles(&self) -> &[String] {
        &self.required_config_profiles
    }

    pub fn requires_config_profile(&self, name: &str) -> bool {
        self.required_config_profiles.iter().any(|p| p == name)
    }

    pub fn requires_user_confirmation(&self) -> bool {
        self.requires_user_confirmation
    }

    /// Manifest-facing descriptor for this command.
    pub fn descriptor(&self, endpoint_uri: impl Into<String>) -> CommandDescriptor {
        CommandDescriptor {
            command_name: self.name.clone(),
            description: self.description.clone(),
            required_config_profiles: self.required_config_profiles.clone(),
            requires_user_confirmation: self.requires_user_confirmation,
            input_types: self
                .input_types
                .iter()
                .map(|t| (t.name.clone(), t.descriptor.clone()))
                .collect(),
            output_types: self
                .output_types
                .iter()
                .map(|t| (t.name.clone(), t.descriptor.clone()))
                .collect(),
            endpoint_uri: endpoint_uri.into(),
        }
    }
}
