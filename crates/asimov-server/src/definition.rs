//! Service definition: identity, config profiles, and registered commands.

use asimov_contract::{CommandDefinition, ConfigProfileDefinition, ServiceManifest};
use asimov_runtime::CommandHandler;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Builder failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceDefinitionError {
    #[error("command already registered: {0}")]
    DuplicateCommand(String),

    #[error("config profile already registered: {0}")]
    DuplicateConfigProfile(String),
}

/// A registered command: its definition plus the handler that executes it.
#[derive(Clone)]
pub struct CommandRegistration {
    pub definition: Arc<CommandDefinition>,
    pub handler: Arc<dyn CommandHandler>,
}

impl std::fmt::Debug for CommandRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistration")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Everything a running service knows about itself.
pub struct ServiceDefinition {
    name: String,
    version: String,
    description: BTreeMap<String, String>,
    terms_url: Option<String>,
    accepted_payment_schemas: Vec<String>,
    profiles: HashMap<String, Arc<ConfigProfileDefinition>>,
    commands: HashMap<String, CommandRegistration>,
}

impl ServiceDefinition {
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> ServiceDefinitionBuilder {
        ServiceDefinitionBuilder {
            name: name.into(),
            version: version.into(),
            description: BTreeMap::new(),
            terms_url: None,
            accepted_payment_schemas: Vec::new(),
            profiles: HashMap::new(),
            commands: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepted_payment_schemas(&self) -> &[String] {
        &self.accepted_payment_schemas
    }

    pub fn command(&self, name: &str) -> Option<&CommandRegistration> {
        self.commands.get(name)
    }

    pub fn profiles(&self) -> &HashMap<String, Arc<ConfigProfileDefinition>> {
        &self.profiles
    }

    /// Assemble the manifest document, commands sorted by name.
    pub fn manifest(&self, base_url: &str) -> ServiceManifest {
        let base = base_url.trim_end_matches('/');
        let mut profiles: Vec<_> = self.profiles.values().map(|p| p.descriptor()).collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        let mut commands: Vec<_> = self
            .commands
            .values()
            .map(|c| {
                c.definition
                    .descriptor(format!("{base}/invoke/{}", c.definition.name()))
            })
            .collect();
        commands.sort_by(|a, b| a.command_name.cmp(&b.command_name));
        ServiceManifest {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            config_profiles: profiles,
            terms_url: self.terms_url.clone(),
            accepted_payment_schemas: self.accepted_payment_schemas.clone(),
            commands,
        }
    }
}

/// Builder for [`ServiceDefinition`].
#[derive(Debug)]
pub struct ServiceDefinitionBuilder {
    name: String,
    version: String,
    description: BTreeMap<String, String>,
    terms_url: Option<String>,
    accepted_payment_schemas: Vec<String>,
    profiles: HashMap<String, Arc<ConfigProfileDefinition>>,
    commands: HashMap<String, CommandRegistration>,
}

impl ServiceDefinitionBuilder {
    #[must_use]
    pub fn with_description(mut self, language: impl Into<String>, text: impl Into<String>) -> Self {
        self.description.insert(language.into(), text.into());
        self
    }

    #[must_use]
    pub fn with_terms_url(mut self, url: impl Into<String>) -> Self {
        self.terms_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_accepted_payment_schemas(mut self, schemas: Vec<String>) -> Self {
        self.accepted_payment_schemas = schemas;
        self
    }

    pub fn with_config_profile(
        mut self,
        profile: ConfigProfileDefinition,
    ) -> Result<Self, ServiceDefinitionError> {
        let name = profile.name().to_string();
        if self.profiles.contains_key(&name) {
            return Err(ServiceDefinitionError::DuplicateConfigProfile(name));
        }
        self.profiles.insert(name, Arc::new(profile));
        Ok(self)
    }

    pub fn with_command(
        mut self,
        definition: CommandDefinition,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, ServiceDefinitionError> {
        let name = definition.name().to_string();
        if self.commands.contains_key(&name) {
            return Err(ServiceDefinitionError::DuplicateCommand(name));
        }
        self.commands.insert(
            name,
            CommandRegistration {
                definition: Arc::new(definition),
                handler,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> ServiceDefinition {
        ServiceDefinition {
            name: self.name,
            version: self.version,
            description: self.description,
            terms_url: self.terms_url,
            accepted_payment_schemas: self.accepted_payment_schemas,
            profiles: self.profiles,
            commands: self.commands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asimov_contract::IoTypeDescriptor;
    use asimov_runtime::{HandlerError, ServiceContext};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopHandler;

    #[async_trait]
    impl CommandHandler for NoopHandler {
        async fn run(&self, _ctx: Arc<ServiceContext>) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn greet() -> CommandDefinition {
        CommandDefinition::new("greet")
            .with_description("en", "Greet a user")
            .with_input_type(
                "name",
                IoTypeDescriptor::new("The name").with_schema(json!({"type": "string"})),
            )
            .unwrap()
            .with_output_type("Greetings", IoTypeDescriptor::new("The greeting"))
            .unwrap()
    }

    #[test]
    fn duplicate_command_is_rejected() {
        let err = ServiceDefinition::builder("svc", "0.1.0")
            .with_command(greet(), Arc::new(NoopHandler))
            .unwrap()
            .with_command(greet(), Arc::new(NoopHandler))
            .unwrap_err();
        assert_eq!(
            err,
            ServiceDefinitionError::DuplicateCommand("greet".to_string())
        );
    }

    #[test]
    fn manifest_lists_commands_with_endpoint_uris() {
        let service = ServiceDefinition::builder("svc", "0.1.0")
            .with_description("en", "Test service")
            .with_accepted_payment_schemas(vec!["test+jwt".to_string()])
            .with_command(greet(), Arc::new(NoopHandler))
            .unwrap()
            .build();

        let manifest = service.manifest("http://service.test/");
        assert_eq!(manifest.name, "svc");
        assert_eq!(manifest.version, "0.1.0");
        assert_eq!(manifest.accepted_payment_schemas, vec!["test+jwt"]);
        assert_eq!(manifest.commands.len(), 1);
        assert_eq!(
            manifest.commands[0].endpoint_uri,
            "http://service.test/invoke/greet"
        );
        assert!(manifest.commands[0].input_types.contains_key("name"));
    }
}
